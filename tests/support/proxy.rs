//! In-process proxies speaking just enough of each protocol.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a client asked the proxy to connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Ip(SocketAddr),
    Domain(String, u16),
}

#[derive(Clone, Debug)]
pub enum Mode {
    Socks4,
    Socks5 {
        credentials: Option<(&'static str, &'static str)>,
    },
    Connect {
        authorization: Option<&'static str>,
    },
    /// Accepts, reads, never answers.
    Silent,
}

pub struct Proxy {
    addr: SocketAddr,
    targets: Arc<Mutex<Vec<Target>>>,
}

impl Proxy {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.lock().unwrap().clone()
    }
}

pub async fn socks4() -> Proxy {
    spawn(Mode::Socks4, None).await
}

pub async fn socks5() -> Proxy {
    spawn(Mode::Socks5 { credentials: None }, None).await
}

pub async fn socks5_with_credentials(user: &'static str, pass: &'static str) -> Proxy {
    spawn(
        Mode::Socks5 {
            credentials: Some((user, pass)),
        },
        None,
    )
    .await
}

pub async fn http_connect(authorization: Option<&'static str>) -> Proxy {
    spawn(Mode::Connect { authorization }, None).await
}

pub async fn silent() -> Proxy {
    spawn(Mode::Silent, None).await
}

/// An HTTP `CONNECT` proxy that is itself behind TLS.
#[cfg(feature = "rustls-tls")]
pub async fn https_connect(config: Arc<rustls::ServerConfig>) -> Proxy {
    spawn(
        Mode::Connect {
            authorization: None,
        },
        Some(tokio_rustls::TlsAcceptor::from(config)),
    )
    .await
}

#[cfg(feature = "rustls-tls")]
type Acceptor = Option<tokio_rustls::TlsAcceptor>;
#[cfg(not(feature = "rustls-tls"))]
type Acceptor = Option<std::convert::Infallible>;

async fn spawn(mode: Mode, acceptor: Acceptor) -> Proxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let targets = Arc::new(Mutex::new(Vec::new()));

    let recorded = targets.clone();
    tokio::spawn(async move {
        loop {
            let (sock, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let mode = mode.clone();
            let acceptor = acceptor.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                match acceptor {
                    #[cfg(feature = "rustls-tls")]
                    Some(acceptor) => {
                        if let Ok(sock) = acceptor.accept(sock).await {
                            handle(sock, mode, recorded).await;
                        }
                    }
                    #[cfg(not(feature = "rustls-tls"))]
                    Some(never) => match never {},
                    None => handle(sock, mode, recorded).await,
                }
            });
        }
    });

    Proxy { addr, targets }
}

async fn handle<S>(mut sock: S, mode: Mode, recorded: Arc<Mutex<Vec<Target>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = match mode {
        Mode::Socks4 => socks4_request(&mut sock).await,
        Mode::Socks5 { credentials } => socks5_request(&mut sock, credentials).await,
        Mode::Connect { authorization } => connect_request(&mut sock, authorization).await,
        Mode::Silent => {
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
    };
    let target = match target {
        Some(target) => target,
        None => return,
    };
    recorded.lock().unwrap().push(target.clone());

    let upstream = match &target {
        Target::Ip(addr) => TcpStream::connect(*addr).await,
        Target::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    let ok = upstream.is_ok();
    let reply: &[u8] = match (&mode, ok) {
        (Mode::Socks4, true) => &[0, 0x5a, 0, 0, 0, 0, 0, 0],
        (Mode::Socks4, false) => &[0, 0x5b, 0, 0, 0, 0, 0, 0],
        (Mode::Socks5 { .. }, true) => &[5, 0, 0, 1, 127, 0, 0, 1, 0, 0],
        (Mode::Socks5 { .. }, false) => &[5, 5, 0, 1, 0, 0, 0, 0, 0, 0],
        (Mode::Connect { .. }, true) => b"HTTP/1.1 200 Connection established\r\n\r\n",
        (Mode::Connect { .. }, false) => b"HTTP/1.1 502 Bad Gateway\r\n\r\n",
        (Mode::Silent, _) => unreachable!(),
    };
    if sock.write_all(reply).await.is_err() {
        return;
    }

    if let Ok(mut upstream) = upstream {
        let _ = tokio::io::copy_bidirectional(&mut sock, &mut upstream).await;
    }
}

async fn socks4_request<S>(sock: &mut S) -> Option<Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 8];
    sock.read_exact(&mut head).await.ok()?;
    assert_eq!(head[0], 4, "socks4 version");
    assert_eq!(head[1], 1, "socks4 connect command");
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

    let _user_id = read_cstr(sock).await?;
    if ip.octets()[..3] == [0, 0, 0] && ip.octets()[3] != 0 {
        let host = read_cstr(sock).await?;
        Some(Target::Domain(host, port))
    } else {
        Some(Target::Ip(SocketAddr::new(ip.into(), port)))
    }
}

async fn socks5_request<S>(
    sock: &mut S,
    credentials: Option<(&'static str, &'static str)>,
) -> Option<Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    sock.read_exact(&mut head).await.ok()?;
    assert_eq!(head[0], 5, "socks5 version");
    let mut methods = vec![0u8; head[1].into()];
    sock.read_exact(&mut methods).await.ok()?;

    match credentials {
        Some((user, pass)) => {
            if !methods.contains(&2) {
                let _ = sock.write_all(&[5, 0xff]).await;
                return None;
            }
            sock.write_all(&[5, 2]).await.ok()?;

            let mut ver = [0u8; 1];
            sock.read_exact(&mut ver).await.ok()?;
            let username = read_pstr(sock).await?;
            let password = read_pstr(sock).await?;
            if username != user || password != pass {
                let _ = sock.write_all(&[1, 1]).await;
                return None;
            }
            sock.write_all(&[1, 0]).await.ok()?;
        }
        None => {
            assert!(methods.contains(&0), "no-auth always offered");
            sock.write_all(&[5, 0]).await.ok()?;
        }
    }

    let mut request = [0u8; 4];
    sock.read_exact(&mut request).await.ok()?;
    assert_eq!(&request[..3], &[5, 1, 0], "socks5 connect request");
    let ip: Option<IpAddr> = match request[3] {
        1 => {
            let mut octets = [0u8; 4];
            sock.read_exact(&mut octets).await.ok()?;
            Some(Ipv4Addr::from(octets).into())
        }
        4 => {
            let mut octets = [0u8; 16];
            sock.read_exact(&mut octets).await.ok()?;
            Some(Ipv6Addr::from(octets).into())
        }
        3 => None,
        other => panic!("unexpected socks5 address type {other}"),
    };
    let host = match ip {
        Some(_) => None,
        None => Some(read_pstr(sock).await?),
    };
    let mut port = [0u8; 2];
    sock.read_exact(&mut port).await.ok()?;
    let port = u16::from_be_bytes(port);

    match (ip, host) {
        (Some(ip), _) => Some(Target::Ip(SocketAddr::new(ip, port))),
        (None, Some(host)) => Some(Target::Domain(host, port)),
        (None, None) => None,
    }
}

async fn connect_request<S>(sock: &mut S, authorization: Option<&'static str>) -> Option<Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        sock.read_exact(&mut byte).await.ok()?;
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let authority = request_line
        .strip_prefix("CONNECT ")?
        .strip_suffix(" HTTP/1.1")?
        .to_owned();

    let mut host_header = None;
    let mut auth_header = None;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(": ")?;
        if name.eq_ignore_ascii_case("host") {
            host_header = Some(value.to_owned());
        } else if name.eq_ignore_ascii_case("proxy-authorization") {
            auth_header = Some(value.to_owned());
        }
    }
    assert_eq!(host_header.as_deref(), Some(authority.as_str()));

    if let Some(expected) = authorization {
        if auth_header.as_deref() != Some(expected) {
            let _ = sock
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
            return None;
        }
    }

    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => Some(Target::Ip(SocketAddr::new(ip, port))),
        Err(_) => Some(Target::Domain(host.to_owned(), port)),
    }
}

async fn read_cstr<S: AsyncRead + Unpin>(sock: &mut S) -> Option<String> {
    let mut out = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        sock.read_exact(&mut byte).await.ok()?;
        if byte[0] == 0 {
            return String::from_utf8(out).ok();
        }
        out.push(byte[0]);
    }
}

async fn read_pstr<S: AsyncRead + Unpin>(sock: &mut S) -> Option<String> {
    let mut len = [0u8; 1];
    sock.read_exact(&mut len).await.ok()?;
    let mut out = vec![0u8; len[0].into()];
    sock.read_exact(&mut out).await.ok()?;
    String::from_utf8(out).ok()
}
