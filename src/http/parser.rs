//! HTTP message parsing
//!
//! Both parsers are incremental: feed them whatever arrived from the wire
//! and they return a message once the head and the `Content-Length` body are
//! complete. Bytes past the end of a message stay buffered, so a pipelined
//! follow-up request is returned by the next call even with no new input.

use super::{
    Error, Headers, HttpRequest, HttpResponse, Method, Result, Status, Version,
    DEFAULT_MAX_BODY_SIZE, MAX_HEAD_SIZE,
};
use bytes::{Bytes, BytesMut};

/// Find the end of the header section (the blank line)
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    Ok((
        parts[0].parse::<Method>()?,
        parts[1].to_string(),
        parts[2].parse::<Version>()?,
    ))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS [REASON]
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = parts[0].parse::<Version>()?;
    let code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(code)?;
    let reason = match parts.get(2) {
        Some(reason) => reason.to_string(),
        None => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// A parsed message head waiting for its body
struct Head {
    start_line: String,
    headers: Headers,
    body_len: usize,
}

/// Splits a byte stream into (head, body) frames
struct Framer {
    buffer: BytesMut,
    head: Option<Head>,
    max_body: usize,
}

impl Framer {
    fn new(max_body: usize) -> Self {
        Framer {
            buffer: BytesMut::with_capacity(8192),
            head: None,
            max_body,
        }
    }

    fn next(&mut self, data: &[u8]) -> Result<Option<(Head, Bytes)>> {
        self.buffer.extend_from_slice(data);

        if self.head.is_none() {
            let Some(end) = find_head_end(&self.buffer) else {
                if self.buffer.len() > MAX_HEAD_SIZE {
                    return Err(Error::Parse("Header section too large".to_string()));
                }
                return Ok(None);
            };

            let raw = self.buffer.split_to(end + 4);
            let text = String::from_utf8_lossy(&raw[..end]);
            let mut lines = text.split("\r\n");
            let start_line = lines.next().unwrap_or_default().to_string();

            let mut headers = Headers::new();
            for line in lines {
                let (name, value) = Headers::parse_header_line(line)?;
                headers.insert(name, value);
            }

            if headers
                .get("Transfer-Encoding")
                .is_some_and(|te| !te.eq_ignore_ascii_case("identity"))
            {
                return Err(Error::Protocol(
                    "Transfer-Encoding is not supported, use Content-Length".to_string(),
                ));
            }

            let body_len = headers.content_length()?.unwrap_or(0);
            if body_len > self.max_body {
                return Err(Error::BodyTooLarge {
                    declared: body_len,
                    limit: self.max_body,
                });
            }

            self.head = Some(Head {
                start_line,
                headers,
                body_len,
            });
        }

        let ready = matches!(&self.head, Some(head) if self.buffer.len() >= head.body_len);
        if !ready {
            return Ok(None);
        }

        match self.head.take() {
            Some(head) => {
                let body = self.buffer.split_to(head.body_len).freeze();
                Ok(Some((head, body)))
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.head = None;
    }
}

/// HTTP request parser
pub struct RequestParser {
    framer: Framer,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a parser that rejects bodies declared larger than `max_body`
    pub fn with_max_body(max_body: usize) -> Self {
        RequestParser {
            framer: Framer::new(max_body),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    /// An oversized body is reported as soon as the head is complete,
    /// before any of the body is buffered.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpRequest>> {
        let Some((head, body)) = self.framer.next(data)? else {
            return Ok(None);
        };

        let (method, uri, version) = parse_request_line(&head.start_line)?;
        Ok(Some(
            HttpRequest::builder()
                .method(method)
                .uri(uri)
                .version(version)
                .headers(head.headers)
                .body(body)
                .build(),
        ))
    }

    /// Drop any buffered input
    pub fn reset(&mut self) {
        self.framer.reset();
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP response parser
pub struct ResponseParser {
    framer: Framer,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        ResponseParser {
            framer: Framer::new(max_body),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(response)) when a complete response is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        let Some((head, body)) = self.framer.next(data)? else {
            return Ok(None);
        };

        let (version, status, reason) = parse_status_line(&head.start_line)?;
        Ok(Some(
            HttpResponse::builder()
                .version(version)
                .status(status)
                .reason(reason)
                .headers(head.headers)
                .body(body)
                .build(),
        ))
    }

    pub fn reset(&mut self) {
        self.framer.reset();
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
