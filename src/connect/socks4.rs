//! SOCKS4, and the SOCKS4A extension for letting the proxy resolve names.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::handshake::Handshake;
use super::TargetAddr;
use crate::error::{self, Rejection};
use crate::proxy::ProxyType;

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

const GRANTED: u8 = 0x5a;

// 0.0.0.x with x != 0 tells a SOCKS4A proxy a hostname follows.
const SOCKS4A_MARKER: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

pub(super) async fn negotiate<S>(
    hs: &mut Handshake<'_, S>,
    user_id: &str,
    target: &TargetAddr,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(user_id, target)?;
    hs.send(&request).await?;

    let mut reply = [0u8; 8];
    hs.recv_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(error::proxy(Rejection::new(
            ProxyType::Socks4,
            format!("unexpected version {:#04x} in reply", reply[0]),
        )));
    }

    let status = reply[1];
    if status != GRANTED {
        let rejection = Rejection::new(ProxyType::Socks4, reply_reason(status))
            .with_code(status.into());
        let rejection = if status == 0x5d {
            rejection.auth()
        } else {
            rejection
        };
        return Err(error::proxy(rejection));
    }

    log::debug!("socks4 tunnel to {target} established");
    Ok(())
}

fn connect_request(user_id: &str, target: &TargetAddr) -> crate::Result<BytesMut> {
    if user_id.as_bytes().contains(&0) {
        return Err(error::builder("socks4 user id contains a NUL byte"));
    }

    let mut buf = BytesMut::with_capacity(9 + user_id.len());
    buf.put_u8(VERSION);
    buf.put_u8(CMD_CONNECT);

    match *target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            buf.put_u16(addr.port());
            buf.put_slice(&addr.ip().octets());
            buf.put_slice(user_id.as_bytes());
            buf.put_u8(0);
        }
        TargetAddr::Ip(SocketAddr::V6(_)) => {
            return Err(error::builder("socks4 cannot address IPv6 destinations"));
        }
        TargetAddr::Domain(ref host, port) => {
            if host.is_empty() {
                return Err(error::builder("socks4 destination host is empty"));
            }
            if host.as_bytes().contains(&0) {
                return Err(error::builder("socks4 destination host contains a NUL byte"));
            }
            buf.put_u16(port);
            buf.put_slice(&SOCKS4A_MARKER.octets());
            buf.put_slice(user_id.as_bytes());
            buf.put_u8(0);
            buf.put_slice(host.as_bytes());
            buf.put_u8(0);
        }
    }
    Ok(buf)
}

fn reply_reason(status: u8) -> &'static str {
    match status {
        0x5b => "request rejected or failed",
        0x5c => "request rejected because the proxy cannot connect to identd on the client",
        0x5d => "request rejected because identd reported a different user id",
        _ => "unknown error",
    }
}
