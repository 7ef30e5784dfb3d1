//! Connections tunneled through a proxy.
//!
//! A [`Connector`] owns a [`Proxy`] configuration and a pair of timeouts,
//! and turns a [`Destination`] into a [`ProxyStream`]:
//!
//! 1. the destination is resolved locally, unless the proxy resolves names,
//! 2. a TCP connection to the proxy is opened, wrapped in TLS when the proxy
//!    is configured for it,
//! 3. the proxy's handshake is negotiated,
//! 4. the tunnel is wrapped in TLS when the destination asks for it.
//!
//! Steps 1 and 2 share the connect timeout; every read and write of step 3
//! is bounded by the read timeout.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use self::handshake::Handshake;
use self::rewind::Rewind;
use crate::dns::{DnsResolverWithOverrides, DynResolver, GaiResolver, IntoResolve, Resolve};
use crate::error;
use crate::proxy::{Proxy, ProxyType};
#[cfg(feature = "rustls-tls")]
use crate::tls::TlsConnector;

mod handshake;
mod rewind;
mod socks4;
mod socks5;
mod tunnel;

pub(crate) trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

pub(crate) type Conn = Box<dyn AsyncConn>;

/// The address a SOCKS proxy is asked to connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => fmt::Display::fmt(addr, f),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Where a tunneled connection should lead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
    tls: bool,
}

impl Destination {
    /// A plain destination at `host:port`.
    ///
    /// The host is a name or an IP literal; IPv6 literals may be given with
    /// or without brackets.
    ///
    /// # Errors
    ///
    /// An empty host or a port of 0 is an error.
    pub fn new(host: impl Into<String>, port: u16) -> crate::Result<Destination> {
        let host = host.into();
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(bare) => bare.to_owned(),
            None => host,
        };
        if host.is_empty() {
            return Err(error::builder("destination host is empty"));
        }
        if port == 0 {
            return Err(error::builder("destination port is 0"));
        }
        Ok(Destination {
            host,
            port,
            tls: false,
        })
    }

    /// Derive a destination from a request URI.
    ///
    /// `https` and `wss` URIs are TLS destinations defaulting to port 443,
    /// everything else defaults to port 80.
    pub fn from_uri(uri: &Uri) -> crate::Result<Destination> {
        let tls = matches!(uri.scheme_str(), Some("https") | Some("wss"));
        let host = uri
            .host()
            .ok_or_else(|| error::builder(format!("URI has no host: {uri}")))?;
        let port = uri
            .port_u16()
            .unwrap_or(if tls { 443 } else { 80 });
        Ok(Destination::new(host, port)?.tls(tls))
    }

    /// Whether the connection should be upgraded to TLS after the tunnel
    /// is established.
    pub fn tls(mut self, enabled: bool) -> Destination {
        self.tls = enabled;
        self
    }

    /// The destination host, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this is a TLS destination.
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::util::authority(&self.host, self.port))
    }
}

/// A `ConnectorBuilder` can be used to create a `Connector` with custom
/// configuration.
#[must_use]
pub struct ConnectorBuilder {
    config: Config,
}

struct Config {
    proxy: Proxy,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    dns_resolver: Option<Arc<dyn Resolve>>,
    dns_overrides: HashMap<String, Vec<SocketAddr>>,
    #[cfg(feature = "rustls-tls")]
    tls: TlsSetting,
}

#[cfg(feature = "rustls-tls")]
enum TlsSetting {
    Default,
    Custom(TlsConnector),
    Disabled,
}

impl ConnectorBuilder {
    /// Constructs a new `ConnectorBuilder` for the given proxy.
    ///
    /// No timeouts are set by default.
    pub fn new(proxy: Proxy) -> ConnectorBuilder {
        ConnectorBuilder {
            config: Config {
                proxy,
                connect_timeout: None,
                read_timeout: None,
                dns_resolver: None,
                dns_overrides: HashMap::new(),
                #[cfg(feature = "rustls-tls")]
                tls: TlsSetting::Default,
            },
        }
    }

    /// Returns a `Connector` that uses this `ConnectorBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if the proxy has no host or port, or if the
    /// default TLS configuration cannot be built.
    pub fn build(self) -> crate::Result<Connector> {
        let config = self.config;
        let proxy = config.proxy;

        if proxy.host().is_empty() {
            return Err(error::builder("proxy host is empty"));
        }
        if proxy.port() == 0 {
            return Err(error::builder("proxy port is 0"));
        }
        if proxy.proxy_type() != ProxyType::Socks4
            && proxy.username().is_some()
            && proxy.password().is_none()
        {
            return Err(error::builder("proxy username given without a password"));
        }
        if proxy.proxy_type() == ProxyType::Socks4 && proxy.password().is_some() {
            log::debug!("socks4 has no password authentication, only the user id is sent");
        }

        let mut resolver: Arc<dyn Resolve> = match config.dns_resolver {
            Some(resolver) => resolver,
            None => Arc::new(GaiResolver::new()),
        };
        if !config.dns_overrides.is_empty() {
            resolver = Arc::new(DnsResolverWithOverrides::new(
                resolver,
                config.dns_overrides,
            ));
        }

        #[cfg(feature = "rustls-tls")]
        let tls = match config.tls {
            TlsSetting::Default => Some(TlsConnector::new()?),
            TlsSetting::Custom(tls) => Some(tls),
            TlsSetting::Disabled => None,
        };

        Ok(Connector {
            inner: Arc::new(Inner {
                proxy,
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
                resolver: DynResolver::new(resolver),
                #[cfg(feature = "rustls-tls")]
                tls,
            }),
        })
    }

    /// Set a timeout for resolving names and opening the connection to the
    /// proxy, including TLS to the proxy.
    ///
    /// The same budget is applied again to the TLS handshake with the
    /// destination.
    ///
    /// Default is no timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set a timeout for each read and write of the proxy handshake.
    ///
    /// Default is no timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Override the DNS resolver used for the proxy host, and for the
    /// destination when it is resolved locally.
    ///
    /// Defaults to [`GaiResolver`].
    pub fn dns_resolver<R: IntoResolve>(mut self, resolver: R) -> ConnectorBuilder {
        self.config.dns_resolver = Some(resolver.into_resolve());
        self
    }

    /// Override DNS resolution for a specific domain to a particular IP
    /// address.
    ///
    /// The port of `addr` is ignored, the port being connected to always
    /// wins.
    pub fn resolve(self, domain: &str, addr: SocketAddr) -> ConnectorBuilder {
        self.resolve_to_addrs(domain, &[addr])
    }

    /// Override DNS resolution for a specific domain to particular IP
    /// addresses.
    ///
    /// The ports of `addrs` are ignored.
    pub fn resolve_to_addrs(mut self, domain: &str, addrs: &[SocketAddr]) -> ConnectorBuilder {
        self.config
            .dns_overrides
            .insert(domain.to_ascii_lowercase(), addrs.to_vec());
        self
    }

    /// Use the given TLS configuration for TLS destinations.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn tls_connector(mut self, tls: TlsConnector) -> ConnectorBuilder {
        self.config.tls = TlsSetting::Custom(tls);
        self
    }

    /// Hand out the raw tunnel even for TLS destinations, leaving TLS to
    /// the caller.
    #[allow(unused_mut)]
    pub fn no_tls(mut self) -> ConnectorBuilder {
        #[cfg(feature = "rustls-tls")]
        {
            self.config.tls = TlsSetting::Disabled;
        }
        self
    }
}

impl fmt::Debug for ConnectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorBuilder")
            .field("proxy", &self.config.proxy)
            .field("connect_timeout", &self.config.connect_timeout)
            .field("read_timeout", &self.config.read_timeout)
            .finish()
    }
}

/// Establishes connections through a single proxy.
///
/// The `Connector` holds its configuration in an `Arc`, so cloning it is
/// cheap, and concurrent calls to [`Connector::connect`] are independent.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    proxy: Proxy,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    resolver: DynResolver,
    #[cfg(feature = "rustls-tls")]
    tls: Option<TlsConnector>,
}

impl Connector {
    /// A connector with the default configuration.
    ///
    /// Use [`Connector::builder`] to set timeouts or DNS overrides.
    pub fn new(proxy: Proxy) -> crate::Result<Connector> {
        ConnectorBuilder::new(proxy).build()
    }

    /// Creates a `ConnectorBuilder` to configure a `Connector`.
    pub fn builder(proxy: Proxy) -> ConnectorBuilder {
        ConnectorBuilder::new(proxy)
    }

    /// The proxy connections go through.
    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    /// Connect to `dst` through the proxy.
    ///
    /// On success the returned stream is positioned right after the proxy
    /// handshake; everything written to it is relayed to the destination.
    /// On failure the connection to the proxy is closed.
    ///
    /// Dropping the returned future cancels the attempt and closes the
    /// connection.
    pub async fn connect(&self, dst: &Destination) -> crate::Result<ProxyStream> {
        self.connect_with_proxy(dst)
            .await
            .map_err(|e| e.with_destination(dst.host(), dst.port()))
    }

    async fn connect_with_proxy(&self, dst: &Destination) -> crate::Result<ProxyStream> {
        let inner = &*self.inner;
        let proxy = &inner.proxy;
        log::trace!(
            "connecting to {dst} through {} proxy {}",
            proxy.proxy_type(),
            crate::util::authority(proxy.host(), proxy.port())
        );

        let (target, mut conn) = with_connect_timeout(inner.connect_timeout, async {
            let target = self.target_addr(dst).await?;
            let conn = self.connect_to_proxy().await?;
            Ok::<_, crate::Error>((target, conn))
        })
        .await?;

        log::trace!("negotiating {} handshake for {target}", proxy.proxy_type());
        let leftover = {
            let mut hs = Handshake::new(&mut conn, inner.read_timeout);
            match proxy.proxy_type() {
                ProxyType::Socks4 => {
                    let user_id = proxy.username().unwrap_or("");
                    socks4::negotiate(&mut hs, user_id, &target).await?;
                    Bytes::new()
                }
                ProxyType::Socks5 => {
                    let auth = proxy.username().zip(proxy.password());
                    socks5::negotiate(&mut hs, auth, &target).await?;
                    Bytes::new()
                }
                ProxyType::Http => {
                    tunnel::negotiate(
                        &mut hs,
                        dst.host(),
                        dst.port(),
                        proxy.proxy_authorization(),
                        proxy.connect_headers(),
                    )
                    .await?
                }
            }
        };

        let conn: Conn = if leftover.is_empty() {
            conn
        } else {
            log::trace!("replaying {} bytes received with the handshake", leftover.len());
            Box::new(Rewind::new_buffered(conn, leftover))
        };

        #[cfg(feature = "rustls-tls")]
        let conn = match inner.tls {
            Some(ref tls) if dst.is_tls() => {
                log::trace!("starting tls with {}", dst.host());
                let tls_stream = with_connect_timeout(inner.connect_timeout, async {
                    tls.connect(dst.host(), conn).await.map_err(|e| {
                        log::debug!("tls handshake with {} failed: {e}", dst.host());
                        error::connect(e)
                    })
                })
                .await?;
                Box::new(tls_stream) as Conn
            }
            _ => conn,
        };

        log::trace!("relaying to {dst}");
        Ok(ProxyStream { inner: conn })
    }

    /// What the proxy is asked to connect to.
    async fn target_addr(&self, dst: &Destination) -> crate::Result<TargetAddr> {
        let proxy = &self.inner.proxy;

        if let Ok(ip) = dst.host().parse::<IpAddr>() {
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, dst.port())));
        }
        if proxy.is_rdns() || proxy.proxy_type() == ProxyType::Http {
            return Ok(TargetAddr::Domain(dst.host().to_owned(), dst.port()));
        }

        let mut addrs = self
            .inner
            .resolver
            .resolve_host(dst.host(), dst.port())
            .await
            .map_err(error::connect)?;
        let addr = match proxy.proxy_type() {
            ProxyType::Socks4 => addrs.find(SocketAddr::is_ipv4),
            _ => addrs.next(),
        };
        let addr = addr.ok_or_else(|| {
            error::connect(format!("no usable addresses found for {}", dst.host()))
        })?;
        log::trace!("resolved {} locally to {}", dst.host(), addr.ip());
        Ok(TargetAddr::Ip(addr))
    }

    async fn connect_to_proxy(&self) -> crate::Result<Conn> {
        let proxy = &self.inner.proxy;
        let addrs = self
            .inner
            .resolver
            .resolve_host(proxy.host(), proxy.port())
            .await
            .map_err(error::connect)?;

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            log::trace!("connecting to proxy at {addr}");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    log::debug!("proxy connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        let tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) => return Err(error::connect(e)),
            (None, None) => {
                return Err(error::connect(format!(
                    "no addresses found for proxy host {}",
                    proxy.host()
                )))
            }
        };
        tcp.set_nodelay(true).map_err(error::connect)?;

        #[cfg(feature = "rustls-tls")]
        if let Some(tls) = proxy.tls_connector() {
            log::trace!("starting tls with proxy {}", proxy.host());
            let tls_stream = tls.connect(proxy.host(), tcp).await.map_err(|e| {
                log::debug!("tls handshake with proxy {} failed: {e}", proxy.host());
                error::connect(e)
            })?;
            return Ok(Box::new(tls_stream));
        }

        Ok(Box::new(tcp))
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.inner.proxy)
            .field("connect_timeout", &self.inner.connect_timeout)
            .field("read_timeout", &self.inner.read_timeout)
            .finish()
    }
}

async fn with_connect_timeout<F, T>(timeout: Option<Duration>, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(res) => res,
            Err(_) => Err(error::connect_timeout()),
        },
        None => fut.await,
    }
}

/// A connection relaying to a destination through a proxy.
///
/// Implements both tokio's and hyper's I/O traits, so it can be used
/// directly or handed to a hyper client.
pub struct ProxyStream {
    inner: Conn,
}

impl fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyStream").finish()
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

impl hyper::rt::Read for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), io::Error>> {
        // SAFETY: the tokio ReadBuf only ever initializes and fills the
        // cursor's memory, and `n` bytes of it were filled.
        let n = unsafe {
            let mut tbuf = ReadBuf::uninit(buf.as_mut());
            match Pin::new(&mut *self.inner).poll_read(cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        unsafe {
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl hyper::rt::Write for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

impl Connection for ProxyStream {
    fn connected(&self) -> Connected {
        // The tunnel is transparent, requests are written in origin form.
        Connected::new()
    }
}
