//! Origin servers for the integration tests.

use std::convert::Infallible;
use std::future::Future;
use std::net;
use std::sync::mpsc as std_mpsc;
#[cfg(feature = "rustls-tls")]
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime;
use tokio::sync::oneshot;

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

#[cfg(feature = "rustls-tls")]
type Tls = Option<Arc<rustls::ServerConfig>>;
#[cfg(not(feature = "rustls-tls"))]
type Tls = Option<std::convert::Infallible>;

/// An HTTP/1 server answering every request with `func`.
pub fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<String>> + Send + 'static,
{
    spawn(func, None)
}

/// Like [`http`], but behind TLS with a certificate for `localhost`.
#[cfg(feature = "rustls-tls")]
pub fn https<F, Fut>(config: Arc<rustls::ServerConfig>, func: F) -> Server
where
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<String>> + Send + 'static,
{
    spawn(func, Some(config))
}

/// A raw TCP server writing back everything it reads.
pub fn echo() -> Server {
    serve_raw(|mut io| async move {
        let mut buf = [0u8; 1024];
        loop {
            match io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn<F, Fut>(func: F, tls: Tls) -> Server
where
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<String>> + Send + 'static,
{
    serve_raw(move |io| {
        let func = func.clone();
        let tls = tls.clone();
        async move {
            match tls {
                #[cfg(feature = "rustls-tls")]
                Some(config) => {
                    let acceptor = tokio_rustls::TlsAcceptor::from(config);
                    match acceptor.accept(io).await {
                        Ok(io) => serve_http(io, func).await,
                        Err(err) => eprintln!("support server tls error: {err}"),
                    }
                }
                #[cfg(not(feature = "rustls-tls"))]
                Some(never) => match never {},
                None => serve_http(io, func).await,
            }
        }
    })
}

async fn serve_http<I, F, Fut>(io: I, func: F)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<String>> + Send + 'static,
{
    let svc = hyper::service::service_fn(move |req| {
        let fut = func(req);
        async move { Ok::<_, Infallible>(fut.await) }
    });
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), svc)
        .await
    {
        eprintln!("support server connection error: {err}");
    }
}

fn serve_raw<H, Fut>(handler: H) -> Server
where
    H: Fn(tokio::net::TcpStream) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let test_name = thread::current()
        .name()
        .unwrap_or("<unknown>")
        .to_string();

    // spawn new runtime in thread to prevent reactor execution context conflict
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async move {
            TcpListener::bind(&std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let tname = format!("test({test_name})-support-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => {
                                break;
                            }
                            accepted = listener.accept() => {
                                let (io, _) = accepted.expect("accepted");
                                tokio::spawn(handler.clone()(io));
                            }
                        }
                    }
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            shutdown_tx: Some(shutdown_tx),
        }
    })
    .join()
    .unwrap()
}
