//! Reconstructed HTTP/1.1 message heads for WARC records.
//!
//! The HTTP client owns the actual wire, so the recorder gets a faithful
//! reconstruction built from the typed request and response: request line or
//! status line, then header fields in order, each line CRLF-terminated, with
//! a blank line closing the block.

use reqwest::header::HeaderMap;

use crate::urlnorm::UrlInfo;

/// The request as it will appear on the wire.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub url: UrlInfo,
    /// Header fields in send order, `Host` first.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireRequest {
    pub fn new(method: &str, url: &UrlInfo) -> Self {
        Self {
            method: method.to_string(),
            url: url.clone(),
            headers: vec![("Host".to_string(), url.host_header())],
            body: Vec::new(),
        }
    }

    pub fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Request target: path plus query.
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn header_block(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Build the response head block from the typed response parts.
pub fn response_header_block(
    version: reqwest::Version,
    status: u16,
    reason: Option<&str>,
    headers: &HeaderMap,
) -> Vec<u8> {
    let version = match version {
        reqwest::Version::HTTP_10 => "HTTP/1.0",
        reqwest::Version::HTTP_2 => "HTTP/2",
        reqwest::Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    };

    let mut out = Vec::with_capacity(256);
    match reason {
        Some(reason) if !reason.is_empty() => {
            out.extend_from_slice(format!("{version} {status} {reason}\r\n").as_bytes());
        }
        _ => {
            out.extend_from_slice(format!("{version} {status}\r\n").as_bytes());
        }
    }

    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_block() {
        let url = UrlInfo::parse("http://example.com/a/b?x=1").unwrap();
        let mut request = WireRequest::new("GET", &url);
        request.header("User-Agent", "webarc");

        let block = String::from_utf8(request.header_block()).unwrap();
        assert!(block.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(block.contains("Host: example.com\r\n"));
        assert!(block.contains("User-Agent: webarc\r\n"));
        assert!(block.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_host_header_with_port() {
        let url = UrlInfo::parse("http://example.com:8080/").unwrap();
        let request = WireRequest::new("GET", &url);
        assert_eq!(request.headers[0].1, "example.com:8080");
    }

    #[test]
    fn test_response_block() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());

        let block = response_header_block(reqwest::Version::HTTP_11, 200, Some("OK"), &headers);
        let text = String::from_utf8(block).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/html\r\n"));
    }

    #[test]
    fn test_remove_header_case_insensitive() {
        let url = UrlInfo::parse("http://example.com/").unwrap();
        let mut request = WireRequest::new("GET", &url);
        request.header("Authorization", "Basic xyz");
        assert!(request.has_header("authorization"));
        request.remove_header("AUTHORIZATION");
        assert!(!request.has_header("authorization"));
    }
}
