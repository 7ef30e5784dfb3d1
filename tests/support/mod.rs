#![allow(dead_code)]

pub mod proxy;
pub mod server;
#[cfg(feature = "rustls-tls")]
pub mod tls;

use std::net::SocketAddr;

use proxy_transport::dns::{Name, Resolve, Resolving};

/// Points `localhost` at IPv4 loopback, so SOCKS4 can reach it too.
pub fn localhost_v4() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A resolver that never answers.
pub struct Unresponsive;

impl Resolve for Unresponsive {
    fn resolve(&self, _name: Name) -> Resolving {
        Box::pin(std::future::pending())
    }
}
