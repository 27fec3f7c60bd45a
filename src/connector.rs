//! Outbound connections through an HTTP forward proxy using `CONNECT`.
//!
//! The handshake is performed on the raw socket: the proxy's response head is
//! read one byte at a time so that nothing past the blank line is consumed,
//! leaving the stream positioned at the first byte coming from the target.

use crate::config::ConnectorConfig;
use crate::error::{ProxyError, Result};
use crate::net;
use base64::{Engine as _, engine::general_purpose};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

/// Largest response head accepted from a proxy before giving up.
pub const MAX_RESPONSE_HEAD: usize = 1024;

static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HTTP/\S+\s(\d+)\s.*$").expect("valid status line pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    Direct,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub proxy_type: ProxyType,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn direct() -> Self {
        Self {
            proxy_type: ProxyType::Direct,
            address: String::new(),
            port: 0,
            username: None,
            password: None,
        }
    }

    pub fn http(address: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type: ProxyType::Http,
            address: address.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parses `http://[user[:pass]@]host[:port]`, or `direct://`.
    ///
    /// The port defaults to 8080 when the URL does not carry one.
    pub fn from_url(proxy_url: &str) -> Result<Self> {
        let url = Url::parse(proxy_url)?;

        match url.scheme() {
            "direct" => Ok(Self::direct()),
            "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| ProxyError::Config(format!("Proxy URL missing host: {}", proxy_url)))?;
                let mut endpoint = Self::http(host, url.port().unwrap_or(8080));

                if !url.username().is_empty() {
                    let username = percent_decode_str(url.username()).decode_utf8_lossy().into_owned();
                    let password = url
                        .password()
                        .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
                        .unwrap_or_default();
                    endpoint = endpoint.with_credentials(username, password);
                }
                Ok(endpoint)
            }
            other => Err(ProxyError::Config(format!("Unsupported proxy scheme: {}", other))),
        }
    }

    /// `Basic` credentials for the `Proxy-Authorization` header, if a username is set.
    pub fn basic_auth(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        Some(format!("Basic {}", general_purpose::STANDARD.encode(credentials.as_bytes())))
    }
}

/// Builds the exact `CONNECT` request sent to the proxy.
pub fn connect_request(proxy: &ProxyEndpoint, host: &str, port: u16) -> String {
    let hostport = format!("{}:{}", host, port);
    let auth_line = proxy
        .basic_auth()
        .map(|auth| format!("Proxy-Authorization: {}\r\n", auth))
        .unwrap_or_default();

    format!("CONNECT {hostport} HTTP/1.1\r\nHost: {hostport}\r\n{auth_line}\r\n")
}

/// Socket factory that reaches any target through the configured proxy.
#[derive(Debug, Clone)]
pub struct HttpProxyConnector {
    proxy: ProxyEndpoint,
    connect_timeout: Duration,
}

impl HttpProxyConnector {
    pub fn new(proxy: ProxyEndpoint, connect_timeout: Duration) -> Self {
        Self { proxy, connect_timeout }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.proxy.clone(),
            Duration::from_millis(config.connect_timeout_millis),
        )
    }

    pub fn proxy(&self) -> &ProxyEndpoint {
        &self.proxy
    }

    /// Returns a socket that behaves as if directly connected to `host:port`.
    pub fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match self.proxy.proxy_type {
            ProxyType::Direct => net::connect(host, port, Some(self.connect_timeout)).map_err(|source| {
                ProxyError::ProxyConnectFailed {
                    address: format!("{}:{}", host, port),
                    source,
                }
            }),
            ProxyType::Http => self.connect_http(host, port),
        }
    }

    pub fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
        self.connect(&addr.ip().to_string(), addr.port())
    }

    fn connect_http(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut stream = net::connect(&self.proxy.address, self.proxy.port, Some(self.connect_timeout))
            .map_err(|source| ProxyError::ProxyConnectFailed {
                address: format!("{}:{}", self.proxy.address, self.proxy.port),
                source,
            })?;

        match handshake(&mut stream, &self.proxy, host, port) {
            Ok(()) => {
                log::debug!(
                    "CONNECT tunnel to {}:{} established via {}:{}",
                    host, port, self.proxy.address, self.proxy.port
                );
                Ok(stream)
            }
            Err(e) => {
                net::close_quietly(stream);
                Err(e)
            }
        }
    }
}

fn handshake<S: Read + Write>(stream: &mut S, proxy: &ProxyEndpoint, host: &str, port: u16) -> Result<()> {
    stream.write_all(connect_request(proxy, host, port).as_bytes())?;
    stream.flush()?;

    let head = read_response_head(stream)?;
    let code = parse_status_code(&head)?;
    if code != 200 {
        return Err(ProxyError::ProxyRejected(code));
    }
    Ok(())
}

/// Reads up to and including the first `\r\n\r\n`.
pub(crate) fn read_response_head<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(100);
    let mut byte = [0u8; 1];
    let mut state = 0u8;

    while state != 4 {
        let n = match reader.read(&mut byte) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(ProxyError::MalformedResponse(
                "connection closed before end of response header".to_string(),
            ));
        }

        head.push(byte[0]);
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::HeaderTooLong);
        }

        state = match (state, byte[0]) {
            (0, b'\r') | (2, b'\r') | (1, b'\n') | (3, b'\n') => state + 1,
            _ => 0,
        };
    }

    Ok(head)
}

pub(crate) fn parse_status_code(head: &[u8]) -> Result<u16> {
    // one char per byte, same as the proxy sent it
    let text: String = head.iter().map(|&b| b as char).collect();
    let status_line = text.split(['\r', '\n']).next().unwrap_or("");

    let captures = STATUS_LINE
        .captures(status_line)
        .ok_or_else(|| ProxyError::MalformedResponse(format!("unexpected status line: {:?}", status_line)))?;

    captures[1]
        .parse::<u16>()
        .map_err(|_| ProxyError::MalformedResponse(format!("invalid status code in {:?}", status_line)))
}
