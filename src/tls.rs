//! TLS configuration and types
//!
//! A [`TlsConnector`] is the TLS capability handed to the crate. It is used
//! for two distinct hops:
//!
//! - to the proxy itself, set with [`Proxy::tls`](crate::Proxy::tls),
//! - to the destination, through the established tunnel, set with
//!   [`ConnectorBuilder::tls_connector`](crate::ConnectorBuilder::tls_connector).
//!
//! Certificate validation is entirely up to the `rustls` configuration.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;

/// A cheaply cloneable handle to a `rustls` client configuration.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// A connector trusting the Mozilla root certificates from
    /// `webpki-roots`.
    pub fn new() -> crate::Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        TlsConnector::with_root_certificates(roots)
    }

    /// A connector trusting only the given roots.
    pub fn with_root_certificates(roots: RootCertStore) -> crate::Result<TlsConnector> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(crate::error::builder)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnector::from(config))
    }

    pub(crate) async fn connect<S>(&self, host: &str, io: S) -> io::Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = match host.parse::<IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
                .to_owned(),
        };
        tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(server_name, io)
            .await
    }
}

impl From<ClientConfig> for TlsConnector {
    fn from(config: ClientConfig) -> TlsConnector {
        TlsConnector::from(Arc::new(config))
    }
}

impl From<Arc<ClientConfig>> for TlsConnector {
    fn from(config: Arc<ClientConfig>) -> TlsConnector {
        TlsConnector { config }
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}
