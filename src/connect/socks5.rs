//! SOCKS5 ([RFC 1928]) with username/password authentication ([RFC 1929]).
//!
//! [RFC 1928]: https://www.rfc-editor.org/rfc/rfc1928
//! [RFC 1929]: https://www.rfc-editor.org/rfc/rfc1929

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::handshake::Handshake;
use super::TargetAddr;
use crate::error::{self, Rejection};
use crate::proxy::ProxyType;

const VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xff;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

pub(super) async fn negotiate<S>(
    hs: &mut Handshake<'_, S>,
    auth: Option<(&str, &str)>,
    target: &TargetAddr,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Everything is validated before the first byte goes out.
    let auth = auth.map(|(user, pass)| auth_request(user, pass)).transpose()?;
    let request = connect_request(target)?;

    let greeting: &[u8] = if auth.is_some() {
        &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    hs.send(greeting).await?;

    let mut reply = [0u8; 2];
    hs.recv_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(reject(format!("unexpected version {:#04x} in reply", reply[0])));
    }

    match (reply[1], auth) {
        (AUTH_NONE, _) => {
            log::trace!("socks5 proxy selected no authentication");
        }
        (AUTH_PASSWORD, Some(auth)) => {
            log::trace!("socks5 proxy selected username/password authentication");
            authenticate(hs, &auth).await?;
        }
        (AUTH_UNACCEPTABLE, _) => {
            return Err(error::proxy(
                Rejection::new(ProxyType::Socks5, "no acceptable authentication methods")
                    .with_code(AUTH_UNACCEPTABLE.into())
                    .auth(),
            ));
        }
        (method, _) => {
            return Err(error::proxy(
                Rejection::new(
                    ProxyType::Socks5,
                    "proxy selected an authentication method that was not offered",
                )
                .with_code(method.into()),
            ));
        }
    }

    hs.send(&request).await?;

    let mut head = [0u8; 3];
    hs.recv_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(reject(format!("unexpected version {:#04x} in reply", head[0])));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(error::proxy(
            Rejection::new(ProxyType::Socks5, reply_reason(head[1])).with_code(head[1].into()),
        ));
    }

    let bound = read_bound_addr(hs).await?;
    log::debug!("socks5 tunnel to {target} established, bound to {bound}");
    Ok(())
}

async fn authenticate<S>(hs: &mut Handshake<'_, S>, request: &[u8]) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    hs.send(request).await?;

    let mut reply = [0u8; 2];
    hs.recv_exact(&mut reply).await?;
    if reply[0] != AUTH_PASSWORD_VERSION {
        return Err(reject("invalid authentication response"));
    }
    if reply[1] != 0 {
        return Err(error::proxy(
            Rejection::new(ProxyType::Socks5, "authentication failed")
                .with_code(reply[1].into())
                .auth(),
        ));
    }
    Ok(())
}

fn auth_request(username: &str, password: &str) -> crate::Result<BytesMut> {
    let ulen = field_len(username, "username")?;
    let plen = field_len(password, "password")?;

    let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
    buf.put_u8(AUTH_PASSWORD_VERSION);
    buf.put_u8(ulen);
    buf.put_slice(username.as_bytes());
    buf.put_u8(plen);
    buf.put_slice(password.as_bytes());
    Ok(buf)
}

fn connect_request(target: &TargetAddr) -> crate::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_slice(&[VERSION, CMD_CONNECT, 0x00]);

    let port = match *target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Domain(ref host, port) => {
            if host.is_empty() {
                return Err(error::builder("socks5 destination host is empty"));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(field_len(host, "destination host")?);
            buf.put_slice(host.as_bytes());
            port
        }
    };
    buf.put_u16(port);
    Ok(buf)
}

async fn read_bound_addr<S>(hs: &mut Handshake<'_, S>) -> crate::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut atyp = [0u8; 1];
    hs.recv_exact(&mut atyp).await?;

    let host = match atyp[0] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            hs.recv_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            hs.recv_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            hs.recv_exact(&mut len).await?;
            let mut name = vec![0u8; len[0].into()];
            hs.recv_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => {
            return Err(reject(format!("invalid address type {other:#04x} in reply")));
        }
    };

    let mut port = [0u8; 2];
    hs.recv_exact(&mut port).await?;
    Ok(crate::util::authority(&host, u16::from_be_bytes(port)))
}

fn field_len(value: &str, what: &str) -> crate::Result<u8> {
    u8::try_from(value.len())
        .map_err(|_| error::builder(format!("socks5 {what} is longer than 255 bytes")))
}

fn reject(reason: impl Into<std::borrow::Cow<'static, str>>) -> crate::Error {
    error::proxy(Rejection::new(ProxyType::Socks5, reason))
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
