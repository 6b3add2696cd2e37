use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn query_flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.query.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if v == "true" || v == "1" => Ok(true),
            Some(v) if v == "false" || v == "0" => Ok(false),
            Some(v) => Err(anyhow!("query parameter '{key}' must be true or false, got '{v}'")),
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// Request failures that map to a specific status code.
#[derive(Error, Debug)]
pub(crate) enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("content-length required")]
    LengthRequired,
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            RequestError::Malformed(_) => 400,
            RequestError::LengthRequired => 411,
            RequestError::TooLarge { .. } => 413,
        }
    }
}

/// First line of the request without consuming it from the socket.
pub(crate) fn peek_request_line(stream: &std::net::TcpStream) -> Result<String> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 512];
    let n = stream.peek(&mut buf)?;
    let head = String::from_utf8_lossy(&buf[..n]);
    Ok(head.split("\r\n").next().unwrap_or_default().to_string())
}

/// Read a full request: headers, then exactly `Content-Length` body bytes.
pub(crate) fn read_request<S: Read>(
    stream: &mut S,
    max_body_bytes: usize,
) -> std::result::Result<HttpRequest, RequestError> {
    let malformed = |reason: &str| RequestError::Malformed(reason.to_string());
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream
            .read(&mut buf)
            .map_err(|e| RequestError::Malformed(e.to_string()))?;
        if n == 0 {
            return Err(malformed("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(malformed("headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| malformed("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| malformed("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| malformed("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };

    let mut body = data.split_off(header_end + 4);
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| malformed("invalid content-length"))?,
        None if method == "POST" => return Err(RequestError::LengthRequired),
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(RequestError::TooLarge {
            limit: max_body_bytes,
        });
    }
    if body.len() < content_length {
        let mut rest = (&mut *stream).take((content_length - body.len()) as u64);
        rest.read_to_end(&mut body)
            .map_err(|e| RequestError::Malformed(e.to_string()))?;
        if body.len() < content_length {
            return Err(malformed("body shorter than content-length"));
        }
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub(crate) fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let mut header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line(status),
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn write_json<W: Write, T: serde::Serialize>(stream: &mut W, status: u16, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &[], &body)
}

pub(crate) fn write_error<W: Write>(stream: &mut W, status: u16, message: &str) -> Result<()> {
    write_json(
        stream,
        status,
        &serde_json::json!({ "success": false, "error": message }),
    )
}
