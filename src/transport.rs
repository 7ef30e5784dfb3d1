use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::Uri;
use tower_service::Service;

use crate::connect::{Connector, Destination, ProxyStream};
use crate::into_url::IntoUrl;
use crate::proxy::Proxy;

/// A connector service for HTTP clients, tunneling every connection through
/// a proxy.
///
/// `ProxyTransport` implements `Service<Uri>`, which makes it usable as the
/// connector of a [`hyper_util`] legacy `Client`:
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// use http_body_util::Empty;
/// use hyper::body::Bytes;
/// use hyper_util::client::legacy::Client;
/// use hyper_util::rt::TokioExecutor;
///
/// let transport = proxy_transport::ProxyTransport::from_url("socks5h://127.0.0.1:1080")?;
/// let client = Client::builder(TokioExecutor::new()).build::<_, Empty<Bytes>>(transport);
///
/// let res = client.get("http://example.com/".parse()?).await?;
/// assert!(res.status().is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ProxyTransport {
    connector: Connector,
}

impl ProxyTransport {
    /// Wrap a configured `Connector`.
    pub fn new(connector: Connector) -> ProxyTransport {
        ProxyTransport { connector }
    }

    /// A transport through the proxy at `url`, with default settings.
    ///
    /// See [`Proxy::from_url`] for the supported URLs.
    pub fn from_url<U: IntoUrl>(url: U) -> crate::Result<ProxyTransport> {
        Ok(ProxyTransport::new(Connector::new(Proxy::from_url(url)?)?))
    }

    /// The underlying connector.
    pub fn connector(&self) -> &Connector {
        &self.connector
    }
}

impl From<Connector> for ProxyTransport {
    fn from(connector: Connector) -> ProxyTransport {
        ProxyTransport::new(connector)
    }
}

impl Service<Uri> for ProxyTransport {
    type Response = ProxyStream;
    type Error = crate::Error;
    type Future = Connecting;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        log::debug!("starting new proxied connection: {dst:?}");
        let connector = self.connector.clone();
        Box::pin(async move {
            let dst = Destination::from_uri(&dst)?;
            connector.connect(&dst).await
        })
    }
}

/// The future returned by [`ProxyTransport`]'s `Service::call`.
pub type Connecting = Pin<Box<dyn Future<Output = crate::Result<ProxyStream>> + Send>>;
