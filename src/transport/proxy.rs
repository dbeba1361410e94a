//! HTTP CONNECT tunnelling.
//!
//! The only proxy flavour the engine supports; the tunnel is established
//! before any protocol byte is written, after which the stream behaves like
//! a direct TCP connection. UDP transport cannot cross this proxy type, so
//! the connection layer forces TCP whenever a proxy is configured.

use base64::prelude::{Engine, BASE64_STANDARD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};

/// Proxy endpoint and optional basic-auth credentials.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Longest status line + headers we are willing to read from the proxy.
const MAX_RESPONSE: usize = 8 * 1024;

/// Open a tunnel to `host:port` through the proxy and return the stream
/// positioned right past the proxy's response headers.
pub async fn connect_via(proxy: &ProxySettings, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| ProtocolError::Proxy(format!("{}:{}: {e}", proxy.host, proxy.port)))?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n"
    );
    if let Some(user) = &proxy.username {
        let pass = proxy.password.as_deref().unwrap_or("");
        let cred = BASE64_STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {cred}\r\n"));
    }
    request.push_str("\r\n");

    debug!(proxy = %proxy.host, target = %host, port, "sending CONNECT");
    stream.write_all(request.as_bytes()).await?;

    let response = read_headers(&mut stream).await?;
    let status = response
        .lines()
        .next()
        .ok_or_else(|| ProtocolError::Proxy("empty proxy response".into()))?;

    // "HTTP/1.x 200 ..." is the only acceptable answer.
    let code = status.split_whitespace().nth(1).unwrap_or("");
    if code != "200" {
        return Err(ProtocolError::Proxy(format!("CONNECT refused: {status}")));
    }

    info!(proxy = %proxy.host, target = %host, "tunnel established");
    Ok(stream)
}

/// Read byte-by-byte until the blank line ending the headers. The proxy may
/// pipeline tunnel bytes right behind them, so we must not over-read.
async fn read_headers(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_RESPONSE {
            return Err(ProtocolError::Proxy("oversized proxy response".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::Proxy("proxy closed during CONNECT".into()));
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::Proxy("non-ascii proxy response".into()))
}
