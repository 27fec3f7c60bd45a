//! Minimal blocking HTTP/1.x request and response messages.
//!
//! Only what the relay needs: parse one message from a stream, let the caller
//! rewrite it, and serialize it back. Bodies are always fully buffered;
//! chunked bodies are decoded on read.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use std::io::{BufRead, Read, Write};
use url::Url;

/// Largest accepted header block, request or status line included.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;

/// Largest decoded chunked body. Chunk sizes are peer-controlled.
pub const MAX_CHUNKED_BODY_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    path: String,
    version: Version,
    host: String,
    port: u16,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::HTTP_11,
            host: String::new(),
            port: 80,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Reads one request. The target host and port are taken from an
    /// absolute-form request target if present, otherwise from `Host`.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let head = read_head(reader)?;

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw_headers);
        match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Parse("incomplete request header".to_string()));
            }
            Err(e) => return Err(ProxyError::Parse(format!("invalid request header: {}", e))),
        }

        let method = req
            .method
            .ok_or_else(|| ProxyError::Parse("missing method".to_string()))
            .and_then(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|e| ProxyError::Parse(format!("invalid method: {}", e)))
            })?;
        let target = req.path.ok_or_else(|| ProxyError::Parse("missing request target".to_string()))?;
        let version = version_from_httparse(req.version);
        let headers = header_map_from_httparse(req.headers)?;

        let mut request = Self {
            method,
            path: target.to_string(),
            version,
            host: String::new(),
            port: 80,
            headers,
            body: None,
        };

        if target.starts_with("http://") || target.starts_with("https://") {
            let url = Url::parse(target)?;
            request.host = url.host_str().unwrap_or_default().to_string();
            request.port = url.port_or_known_default().unwrap_or(80);
            request.path = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
        } else if let Some(host) = request.header(HOST.as_str()).map(str::to_string) {
            let (host, port) = split_host_port(&host, 80);
            request.host = host;
            request.port = port;
        }

        request.body = if is_chunked(&request.headers) {
            Some(read_chunked_body(reader)?)
        } else if let Some(len) = content_length(&request.headers)? {
            Some(read_exact_body(reader, len)?)
        } else {
            None
        };

        Ok(request)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Rewrites `Host` from the current host and port.
    pub fn regenerate_host_header(&mut self) {
        let value = format!("{}:{}", self.host, self.port);
        if let Ok(value) = HeaderValue::from_str(&value) {
            self.headers.insert(HOST, value);
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_set(&mut self, name: &str, value: &str) -> Result<()> {
        set_header(&mut self.headers, name, value)
    }

    pub fn header_remove(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    pub fn body_raw(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Replaces the body and its `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers.remove(TRANSFER_ENCODING);
        self.set_content_length(body.len() as u64);
        self.body = Some(body);
    }

    pub fn send_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut wire = format!("{} {} {}\r\n", self.method, self.path, version_str(self.version)).into_bytes();
        write_headers(&mut wire, &self.headers);
        if let Some(body) = &self.body {
            wire.extend_from_slice(body);
        }
        out.write_all(&wire)?;
        out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: Version,
    status: u16,
    reason: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: reason.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Reads one response. Without `Content-Length` or chunked framing the
    /// body runs to the end of the stream.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        Self::read_body_framed(reader, true)
    }

    /// Reads the response to a request sent with `method`. Responses to
    /// `HEAD` never carry a body, whatever their framing headers say.
    pub fn read_for_request<R: BufRead>(reader: &mut R, method: &Method) -> Result<Self> {
        Self::read_body_framed(reader, *method != Method::HEAD)
    }

    fn read_body_framed<R: BufRead>(reader: &mut R, body_allowed: bool) -> Result<Self> {
        let head = read_head(reader)?;

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut raw_headers);
        match resp.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Parse("incomplete response header".to_string()));
            }
            Err(e) => return Err(ProxyError::Parse(format!("invalid response header: {}", e))),
        }

        let status = resp.code.ok_or_else(|| ProxyError::Parse("missing status code".to_string()))?;
        let reason = resp.reason.unwrap_or_default().to_string();
        let version = version_from_httparse(resp.version);
        let headers = header_map_from_httparse(resp.headers)?;

        let body = if !body_allowed || !status_has_body(status) {
            None
        } else if is_chunked(&headers) {
            Some(read_chunked_body(reader)?)
        } else if let Some(len) = content_length(&headers)? {
            Some(read_exact_body(reader, len)?)
        } else {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            Some(Bytes::from(body))
        };

        Ok(Self {
            version,
            status,
            reason,
            headers,
            body,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_set(&mut self, name: &str, value: &str) -> Result<()> {
        set_header(&mut self.headers, name, value)
    }

    pub fn header_remove(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    pub fn body_raw(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers.remove(TRANSFER_ENCODING);
        self.set_content_length(body.len() as u64);
        self.body = Some(body);
    }

    pub fn send_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut wire = format!("{} {} {}\r\n", version_str(self.version), self.status, self.reason).into_bytes();
        write_headers(&mut wire, &self.headers);
        if let Some(body) = &self.body {
            wire.extend_from_slice(body);
        }
        out.write_all(&wire)?;
        out.flush()?;
        Ok(())
    }
}

/// Reads lines up to and including the blank line ending the header block.
fn read_head<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);

    loop {
        let start = head.len();
        let n = reader
            .by_ref()
            .take((MAX_HEADER_SIZE + 1 - start) as u64)
            .read_until(b'\n', &mut head)?;

        if n == 0 {
            return Err(ProxyError::Parse(if head.is_empty() {
                "connection closed before message".to_string()
            } else {
                "connection closed inside header block".to_string()
            }));
        }
        if head.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::Parse(format!(
                "header block exceeds {} bytes",
                MAX_HEADER_SIZE
            )));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // leading empty lines before the start line are tolerated
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

fn read_exact_body<R: Read>(reader: &mut R, len: u64) -> Result<Bytes> {
    let mut body = Vec::new();
    let read = reader.take(len).read_to_end(&mut body)?;
    if (read as u64) < len {
        return Err(ProxyError::Parse(format!(
            "body ended after {} of {} bytes",
            read, len
        )));
    }
    Ok(Bytes::from(body))
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Bytes> {
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(ProxyError::Parse("connection closed inside chunked body".to_string()));
        }

        let size_field = line.trim().split(';').next().unwrap_or("").trim();
        let chunk_size = u64::from_str_radix(size_field, 16)
            .map_err(|e| ProxyError::Parse(format!("invalid chunk size {:?}: {}", size_field, e)))?;

        if chunk_size == 0 {
            // trailer section, discarded
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 || line.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        let decoded = (body.len() as u64)
            .checked_add(chunk_size)
            .filter(|&total| total <= MAX_CHUNKED_BODY_SIZE)
            .ok_or_else(|| {
                ProxyError::Parse(format!("chunked body exceeds {} bytes", MAX_CHUNKED_BODY_SIZE))
            })?;

        // the buffer only grows with bytes that actually arrive
        let read = reader.by_ref().take(chunk_size).read_to_end(&mut body)?;
        if (body.len() as u64) < decoded {
            return Err(ProxyError::Parse(format!(
                "chunk ended after {} of {} bytes",
                read, chunk_size
            )));
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if &crlf != b"\r\n" {
            return Err(ProxyError::Parse("missing CRLF after chunk".to_string()));
        }
    }

    Ok(Bytes::from(body))
}

fn header_map_from_httparse(raw: &[httparse::Header]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ProxyError::Parse(format!("invalid header name '{}': {}", h.name, e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| ProxyError::Parse(format!("invalid value for '{}': {}", h.name, e)))?;
        map.append(name, value);
    }
    Ok(map)
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ProxyError::Parse(format!("invalid header name '{}': {}", name, e)))?;
    let value =
        HeaderValue::from_str(value).map_err(|e| ProxyError::Parse(format!("invalid header value: {}", e)))?;
    headers.insert(name, value);
    Ok(())
}

fn write_headers(wire: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        wire.extend_from_slice(name.as_str().as_bytes());
        wire.extend_from_slice(b": ");
        wire.extend_from_slice(value.as_bytes());
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"\r\n");
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ProxyError::Parse(format!("invalid Content-Length: {:?}", value))),
    }
}

fn status_has_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}

fn version_from_httparse(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}

/// Splits `host[:port]`, keeping bracketed IPv6 literals intact.
pub fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (value.to_string(), default_port),
        },
        _ => (value.to_string(), default_port),
    }
}
