// Minimal HTTP/1.1 framing over the TCP layer
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::checksum::find_pattern;
use crate::error::{NetError, Result};

const HEADER_END: &[u8] = b"\r\n\r\n";
const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub verb: String,
    pub path: String,
    pub protocol: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(verb: &str, host: &str, path: &str) -> Self {
        Self {
            verb: String::from(verb),
            path: String::from(path),
            protocol: String::from(HTTP_VERSION),
            host: String::from(host),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(host: &str, path: &str) -> Self {
        Self::new("GET", host, path)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((String::from(name), String::from(value)));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Splits a received segment into request line, headers and body.
    /// Header lines without a colon are skipped.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = split_head(data)?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (verb, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(verb), Some(target), Some(protocol)) => (verb, target, protocol),
            _ => return Err(NetError::Malformed("bad request line")),
        };
        if !protocol.starts_with("HTTP/") {
            return Err(NetError::Malformed("bad protocol"));
        }

        let headers = parse_headers(lines);
        let body = bounded_body(&headers, body);
        Ok(Self {
            verb: String::from(verb),
            path: percent_decode(target),
            protocol: String::from(protocol),
            host: find_header(&headers, "Host").unwrap_or_default().to_string(),
            headers,
            body,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\nHost: {}\r\n", self.verb, percent_encode(&self.path), self.protocol, self.host);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() || self.verb == "POST" {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: String::from(reason_phrase(status)),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(content_type: &str, body: &[u8]) -> Self {
        Self::new(200).with_header("Content-Type", content_type).with_body(body)
    }

    pub fn not_found() -> Self {
        Self::new(404)
            .with_header("Content-Type", "text/plain")
            .with_body(b"404 Not Found")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((String::from(name), String::from(value)));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Status line and headers, including Content-Length, up to the blank line.
    pub fn header_block(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", HTTP_VERSION, self.status, self.reason);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()));
        head.into_bytes()
    }

    pub fn body_chunks(&self, chunk: usize) -> core::slice::Chunks<'_, u8> {
        self.body.chunks(chunk.max(1))
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = split_head(data)?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let protocol = parts.next().unwrap_or_default();
        if !protocol.starts_with("HTTP/") {
            return Err(NetError::Malformed("bad status line"));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or(NetError::Malformed("bad status code"))?;
        let reason = parts.next().unwrap_or_default();

        let headers = parse_headers(lines);
        let body = bounded_body(&headers, body);
        Ok(Self {
            status,
            reason: String::from(reason),
            headers,
            body,
        })
    }

    /// Whether `data` holds a full response: the header block plus
    /// Content-Length bytes of body. Without a length the peer's FIN ends it.
    pub fn is_complete(data: &[u8]) -> bool {
        let end = match find_pattern(data, HEADER_END) {
            Some(end) => end,
            None => return false,
        };
        let head = match core::str::from_utf8(&data[..end]) {
            Ok(head) => head,
            Err(_) => return false,
        };
        let headers = parse_headers(head.split("\r\n").skip(1));
        match content_length(&headers) {
            Some(length) => data.len() - end - HEADER_END.len() >= length,
            None => false,
        }
    }
}

fn split_head(data: &[u8]) -> Result<(&str, &[u8])> {
    let end = find_pattern(data, HEADER_END).ok_or(NetError::Malformed("incomplete header"))?;
    let head = core::str::from_utf8(&data[..end]).map_err(|_| NetError::Malformed("header not UTF-8"))?;
    Ok((head, &data[end + HEADER_END.len()..]))
}

fn parse_headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((String::from(name), String::from(value.trim())))
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    find_header(headers, "Content-Length")?.parse().ok()
}

fn bounded_body(headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    match content_length(headers) {
        Some(length) if length < body.len() => body[..length].to_vec(),
        _ => body.to_vec(),
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Decodes %XX escapes. Invalid escapes are kept literally.
pub fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push((hex_value(bytes[i + 1]) << 4) | hex_value(bytes[i + 2]));
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Escapes bytes outside the unreserved set, leaving path separators and
/// query punctuation intact.
pub fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b'?' | b'=' | b'&' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
