//! HTTP/1.x message reading and writing for the proxy.
//!
//! Bodies are always buffered in full (vSphere SOAP messages are small) so
//! they can be inspected before the response is relayed. Messages are
//! re-encoded with an explicit `Content-Length` and without hop-by-hop headers.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{PermDumpError, Result};
use crate::flow::{FlowRequest, FlowResponse, Headers};

/// Limit for a request/status line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Limit for a single message body.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Headers that apply to one connection only and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "content-length",
];

/// Request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Whether the client expects the connection to stay open after the response.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close")
            || self.headers.has_token("proxy-connection", "close")
        {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("connection", "keep-alive")
                || self.headers.has_token("proxy-connection", "keep-alive");
        }
        true
    }
}

/// Status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Read a request head. Returns `None` if the peer closed the connection
/// before sending anything.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = read_head_lines(reader).await? else {
        return Ok(None);
    };
    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(PermDumpError::Http(format!(
            "Invalid request line: {:?}",
            lines[0]
        )));
    }
    Ok(Some(RequestHead {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers: parse_headers(&lines[1..]),
    }))
}

/// Read a response head, skipping interim `100 Continue` responses.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let lines = read_head_lines(reader)
            .await?
            .ok_or_else(|| PermDumpError::Http("Upstream closed before responding".to_string()))?;

        let mut parts = lines[0].splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(PermDumpError::Http(format!(
                "Invalid status line: {:?}",
                lines[0]
            )));
        }
        let status_code: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PermDumpError::Http(format!("Invalid status line: {:?}", lines[0])))?;
        if status_code == 100 {
            continue;
        }
        return Ok(ResponseHead {
            version: version.to_string(),
            status_code,
            reason: parts.next().unwrap_or_default().trim().to_string(),
            headers: parse_headers(&lines[1..]),
        });
    }
}

/// Read a request body framed by `Transfer-Encoding: chunked` or `Content-Length`.
pub async fn read_request_body<R>(reader: &mut R, headers: &Headers) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if headers.has_token("transfer-encoding", "chunked") {
        return read_chunked(reader).await;
    }
    match content_length(headers)? {
        Some(len) => read_exact_body(reader, len).await,
        None => Ok(Vec::new()),
    }
}

/// Read a response body. Without explicit framing the body runs to EOF.
pub async fn read_response_body<R>(
    reader: &mut R,
    request_method: &str,
    head: &ResponseHead,
) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let status = head.status_code;
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(Vec::new());
    }
    if head.headers.has_token("transfer-encoding", "chunked") {
        return read_chunked(reader).await;
    }
    if let Some(len) = content_length(&head.headers)? {
        return read_exact_body(reader, len).await;
    }

    let mut body = Vec::new();
    (&mut *reader)
        .take(MAX_BODY_SIZE as u64 + 1)
        .read_to_end(&mut body)
        .await?;
    if body.len() > MAX_BODY_SIZE {
        return Err(body_too_large());
    }
    Ok(body)
}

/// Serialize a request for the upstream server in origin form.
///
/// The upstream connection is not reused, so `Connection: close` is always sent.
pub fn encode_request(req: &FlowRequest) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, req.path);
    if !req.headers.contains("host") {
        out.push_str(&format!("Host: {}\r\n", host_header(req)));
    }
    for (name, value) in forwardable(&req.headers) {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    let method = req.method.to_ascii_uppercase();
    if !req.content.is_empty() || matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
        out.push_str(&format!("Content-Length: {}\r\n", req.content.len()));
    }
    out.push_str("Connection: close\r\n\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&req.content);
    bytes
}

/// Serialize a response for the client.
///
/// 1xx and 204 responses carry no `Content-Length`. Responses to `HEAD` and
/// 304 responses keep the upstream's value.
pub fn encode_response(resp: &FlowResponse, request_method: &str, keep_alive: bool) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", resp.status_code, resp.reason);
    for (name, value) in forwardable(&resp.headers) {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    let status = resp.status_code;
    let length = if (100..200).contains(&status) || status == 204 {
        None
    } else if request_method.eq_ignore_ascii_case("HEAD") || status == 304 {
        resp.headers
            .get("content-length")
            .map(|len| len.trim().to_string())
    } else {
        Some(resp.content.len().to_string())
    };
    if let Some(length) = length {
        out.push_str(&format!("Content-Length: {}\r\n", length));
    }
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&resp.content);
    bytes
}

/// A bodiless error response that closes the connection.
pub fn error_response(status_code: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status_code, reason
    )
    .into_bytes()
}

fn host_header(req: &FlowRequest) -> String {
    let default_port = if req.scheme == "https" { 443 } else { 80 };
    if req.port == default_port {
        req.host.clone()
    } else {
        format!("{}:{}", req.host, req.port)
    }
}

fn forwardable(headers: &Headers) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name)))
}

fn parse_headers(lines: &[String]) -> Headers {
    lines
        .iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn content_length(headers: &Headers) -> Result<Option<usize>> {
    match headers.get("content-length") {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PermDumpError::Http(format!("Invalid Content-Length: {:?}", value))),
    }
}

fn body_too_large() -> PermDumpError {
    PermDumpError::Http(format!("Body exceeds {} bytes", MAX_BODY_SIZE))
}

async fn read_exact_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if len > MAX_BODY_SIZE {
        return Err(body_too_large());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| PermDumpError::Http("EOF in chunked body".to_string()))?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| PermDumpError::Http(format!("Invalid chunk size: {:?}", line)))?;
        if size == 0 {
            // Trailers end with an empty line (or EOF from sloppy servers)
            while let Some(trailer) = read_line(reader).await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if size > MAX_BODY_SIZE - body.len() {
            return Err(body_too_large());
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        read_line(reader).await?;
    }
}

/// Read one CRLF/LF terminated line without the terminator.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEAD_SIZE as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") && n as u64 == MAX_HEAD_SIZE as u64 {
        return Err(PermDumpError::Http("Line too long".to_string()));
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read a start line plus headers. Leading blank lines are tolerated.
async fn read_head_lines<R>(reader: &mut R) -> Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines: Vec<String> = Vec::new();
    let mut total = 0usize;
    loop {
        let Some(line) = read_line(reader).await? else {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(PermDumpError::Http("EOF in message head".to_string()));
        };
        total += line.len() + 2;
        if total > MAX_HEAD_SIZE {
            return Err(PermDumpError::Http(
                "Headers size exceeds maximum allowed".to_string(),
            ));
        }
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Ok(Some(lines));
        }
        lines.push(line);
    }
}
