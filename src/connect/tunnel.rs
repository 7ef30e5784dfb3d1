//! HTTP `CONNECT` tunneling.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, HOST, PROXY_AUTHORIZATION};
use tokio::io::{AsyncRead, AsyncWrite};

use super::handshake::Handshake;
use crate::error::{self, Rejection};
use crate::proxy::ProxyType;

// A proxy response head larger than this is treated as a broken proxy.
const MAX_HEAD: usize = 8192;

/// Sends the `CONNECT` request and waits for a 2xx.
///
/// Returns whatever the proxy already sent past the end of the response
/// head; those bytes belong to the tunnel.
pub(super) async fn negotiate<S>(
    hs: &mut Handshake<'_, S>,
    host: &str,
    port: u16,
    auth: Option<HeaderValue>,
    headers: &HeaderMap,
) -> crate::Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(host, port, auth, headers)?;
    hs.send(&request).await?;

    let mut buf = BytesMut::with_capacity(1024);
    let end = loop {
        if hs.recv_buf(&mut buf).await? == 0 {
            return Err(error::connect("unexpected eof while tunneling"));
        }
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() >= MAX_HEAD {
            return Err(error::connect("proxy response head too large"));
        }
    };

    let head = buf.split_to(end);
    let status_line = head[..].split(|&b| b == b'\r').next().unwrap_or_default();
    let status = parse_status(status_line)
        .ok_or_else(|| error::connect("invalid proxy response status line"))?;

    if (200..300).contains(&status) {
        log::debug!("tunnel to {} established", crate::util::authority(host, port));
        return Ok(buf.freeze());
    }

    let line = String::from_utf8_lossy(status_line).into_owned();
    let rejection = Rejection::new(ProxyType::Http, line).with_code(status);
    let rejection = if status == 407 {
        rejection.auth()
    } else {
        rejection
    };
    Err(error::proxy(rejection))
}

fn connect_request(
    host: &str,
    port: u16,
    auth: Option<HeaderValue>,
    headers: &HeaderMap,
) -> crate::Result<BytesMut> {
    if host.is_empty() {
        return Err(error::builder("tunnel destination host is empty"));
    }
    let authority = crate::util::authority(host, port);
    if authority.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(error::builder("invalid tunnel destination host"));
    }

    let mut buf = BytesMut::with_capacity(64 + authority.len() * 2);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(authority.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nHost: ");
    buf.put_slice(authority.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(value) = auth {
        put_header(&mut buf, PROXY_AUTHORIZATION.as_str(), &value);
    }
    for (name, value) in headers {
        // these two are owned by the tunnel itself
        if name == HOST || name == PROXY_AUTHORIZATION {
            continue;
        }
        put_header(&mut buf, name.as_str(), value);
    }

    buf.put_slice(b"\r\n");
    Ok(buf)
}

fn put_header(buf: &mut BytesMut, name: &str, value: &HeaderValue) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// `HTTP/1.x NNN ...`
fn parse_status(line: &[u8]) -> Option<u16> {
    let rest = line.strip_prefix(b"HTTP/1.")?;
    let (&minor, rest) = rest.split_first()?;
    let rest = rest.strip_prefix(b" ")?;
    if !minor.is_ascii_digit() || rest.len() < 3 {
        return None;
    }
    let (code, tail) = rest.split_at(3);
    if !code.iter().all(u8::is_ascii_digit) || !(tail.is_empty() || tail[0] == b' ') {
        return None;
    }
    Some(code.iter().fold(0, |n, d| n * 10 + u16::from(d - b'0')))
}
