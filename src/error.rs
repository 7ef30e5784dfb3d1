use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::proxy::ProxyType;

/// A `Result` alias where the `Err` case is `proxy_transport::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur while connecting through a proxy.
///
/// Every failed connection attempt yields exactly one of:
///
/// - a proxy rejection ([`Error::is_proxy`]): the proxy answered, but refused
///   the request or the credentials,
/// - a connection failure ([`Error::is_connect`]): the proxy could not be
///   reached, or the stream to it was lost mid-handshake,
/// - a timeout ([`Error::is_timeout`]): the connect or read budget expired.
///
/// Invalid configuration is reported separately by [`Error::is_builder`].
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    dst: Option<String>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                dst: None,
            }),
        }
    }

    /// Returns the `host:port` of the destination this error is related to,
    /// if known.
    pub fn destination(&self) -> Option<&str> {
        self.inner.dst.as_deref()
    }

    pub(crate) fn with_destination(mut self, host: &str, port: u16) -> Self {
        self.inner.dst = Some(crate::util::authority(host, port));
        self
    }

    /// Returns true if the error is from a builder or invalid configuration.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the proxy actively rejected the request.
    ///
    /// Details are available from [`Error::rejection`].
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy)
    }

    /// Returns true if the error is related to establishing or keeping the
    /// connection to the proxy.
    ///
    /// This is also true for timeouts of the connect phase.
    pub fn is_connect(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Connect | Kind::Timeout(Phase::Connect)
        )
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if the proxy refused the supplied credentials.
    pub fn is_auth(&self) -> bool {
        self.rejection().map_or(false, Rejection::is_auth)
    }

    /// Returns the proxy's rejection, if this is a proxy error.
    pub fn rejection(&self) -> Option<&Rejection> {
        if !self.is_proxy() {
            return None;
        }
        self.inner
            .source
            .as_ref()
            .and_then(|e| e.downcast_ref::<Rejection>())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("proxy_transport::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref dst) = self.inner.dst {
            builder.field("destination", dst);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Connect => f.write_str("error connecting to proxy")?,
            Kind::Proxy => f.write_str("proxy rejected the request")?,
            Kind::Timeout(Phase::Connect) => f.write_str("timed out connecting to proxy")?,
            Kind::Timeout(Phase::Read) => f.write_str("timed out waiting for proxy reply")?,
        }

        if let Some(dst) = &self.inner.dst {
            write!(f, " for {dst}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Builder,
    Connect,
    Proxy,
    Timeout(Phase),
}

/// Which budget expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connect,
    Read,
}

/// The reason a proxy gave for refusing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    protocol: ProxyType,
    code: Option<u16>,
    reason: Cow<'static, str>,
    auth: bool,
}

impl Rejection {
    pub(crate) fn new(protocol: ProxyType, reason: impl Into<Cow<'static, str>>) -> Self {
        Rejection {
            protocol,
            code: None,
            reason: reason.into(),
            auth: false,
        }
    }

    pub(crate) fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub(crate) fn auth(mut self) -> Self {
        self.auth = true;
        self
    }

    /// The protocol spoken with the proxy.
    pub fn protocol(&self) -> ProxyType {
        self.protocol
    }

    /// The raw code from the proxy's reply, when it sent one.
    ///
    /// This is the SOCKS5 `REP` field, the SOCKS4 status byte, or the HTTP
    /// status code.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// A human readable description of the rejection.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the proxy rejected the supplied credentials, as opposed to
    /// the destination.
    pub fn is_auth(&self) -> bool {
        self.auth
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} proxy: {}", self.protocol, self.reason)?;
        match (self.protocol, self.code) {
            (_, None) => (),
            (ProxyType::Http, Some(status)) => write!(f, " (status {status})")?,
            (_, Some(code)) => write!(f, " (code {code:#04x})")?,
        }
        Ok(())
    }
}

impl StdError for Rejection {}

// constructors

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder, Some(e))
}

pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Connect, Some(e))
}

pub(crate) fn proxy(rejection: Rejection) -> Error {
    Error::new(Kind::Proxy, Some(rejection))
}

pub(crate) fn connect_timeout() -> Error {
    Error::new(Kind::Timeout(Phase::Connect), Some(TimedOut))
}

pub(crate) fn read_timeout() -> Error {
    Error::new(Kind::Timeout(Phase::Read), Some(TimedOut))
}

/// Maps a failed handshake read or write.
///
/// A socket level timeout is still a timeout, everything else means the
/// stream to the proxy is gone.
pub(crate) fn handshake_io(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut {
        read_timeout()
    } else {
        connect(e)
    }
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
