//! HTTP `CONNECT` tunnelling for outbound client sockets.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};

/// Upper bound on the proxy's response head.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// An HTTP proxy that accepts `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` of the proxy
    pub address: String,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl ProxyConfig {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            basic_auth: None,
        }
    }

    pub fn with_basic_auth<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    fn connect_request(&self, host: &str, port: u16) -> String {
        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some(auth) = &self.basic_auth {
            let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        request
    }
}

/// Open a tunnel to `host:port` through `proxy`.
///
/// The returned socket carries the tunnelled stream and is used exactly
/// like a direct connection.
#[instrument(level = "debug", skip(proxy), fields(proxy = %proxy.address))]
pub async fn connect_via_proxy(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(&proxy.address)
        .await
        .map_err(|e| ProtocolError::ProxyError(format!("failed to reach proxy {}: {e}", proxy.address)))?;

    stream
        .write_all(proxy.connect_request(host, port).as_bytes())
        .await?;
    stream.flush().await?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = parse_status(status_line)?;
    if !(200..300).contains(&status) {
        return Err(ProtocolError::ProxyError(format!(
            "proxy refused CONNECT: {status_line}"
        )));
    }

    debug!(%host, port, status, "Proxy tunnel established");
    Ok(stream)
}

// Byte at a time: the peer may start talking right behind the head, and
// those bytes belong to the tunnel.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    loop {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProtocolError::ProxyError(format!(
                "proxy response head exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            ProtocolError::ProxyError(format!("proxy closed before completing response: {e}"))
        })?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    String::from_utf8(head)
        .map_err(|_| ProtocolError::ProxyError("proxy response head is not UTF-8".into()))
}

fn parse_status(status_line: &str) -> Result<u16> {
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| ProtocolError::ProxyError(format!("bad proxy status line: {status_line}"))),
        _ => Err(ProtocolError::ProxyError(format!(
            "bad proxy status line: {status_line}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_auth() {
        let proxy = ProxyConfig::new("127.0.0.1:8080");
        assert_eq!(
            proxy.connect_request("example.org", 3982),
            "CONNECT example.org:3982 HTTP/1.1\r\nHost: example.org:3982\r\n\r\n"
        );
    }

    #[test]
    fn request_with_basic_auth() {
        let proxy = ProxyConfig::new("127.0.0.1:8080").with_basic_auth("user", "pass");
        let request = proxy.connect_request("example.org", 1);
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established").unwrap(), 200);
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Authentication Required").unwrap(), 407);
        assert!(parse_status("SSH-2.0-OpenSSH").is_err());
        assert!(parse_status("").is_err());
    }
}
