//! One HTTP exchange, end to end.
//!
//! The fetcher assembles the request (headers, cookies, conditional and
//! Range headers, POST body), drives the redirect loop, and streams the
//! response body chunk by chunk into the WARC session and the body spool
//! while pacing reads for `--limit-rate`. It never buffers a body whole.
//!
//! Outcomes are a sum type the scheduler switches on: a completed response
//! (any status — the engine classifies status codes), a retryable error, or
//! a fatal one.

pub mod body;
pub mod client;
pub mod redirect;
mod wire;

pub use body::{Body, BodySink};
pub use client::{build_client, ClientOptions, SecureProtocol};
pub use redirect::{RedirectAction, RedirectTracker};
pub use wire::{response_header_block, WireRequest};

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, LOCATION, SET_COOKIE};
use reqwest::{Client, Method};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cookies::CookieJar;
use crate::frontier::Frontier;
use crate::stats::{ErrorClass, Statistics};
use crate::urlnorm::UrlInfo;
use crate::warc::{CdxMeta, WarcRecorder, WarcSession};

/// Everything that can go wrong with a fetch.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("network error: {0}")]
    Network(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("DNS lookup failed: {0}")]
    DnsNotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("TLS verification failed: {0}")]
    SslVerification(String),

    #[error("timed out")]
    TimedOut,

    #[error("body exceeded declared length ({actual} > {declared})")]
    TooLarge { actual: u64, declared: u64 },

    #[error("too many redirects ({0})")]
    TooManyRedirects(u32),

    #[error("redirect cycle at {0}")]
    RedirectCycle(String),

    #[error("redirect target {0} rejected by filters")]
    RedirectFiltered(String),

    #[error("disallowed by robots.txt")]
    RobotsDisallowed,

    #[error("robots.txt temporarily unavailable")]
    RobotsUnavailable,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("hook error: {0}")]
    Hook(String),
}

impl ErrorKind {
    /// Whether the scheduler should requeue, given the retry policy.
    pub fn is_retryable(&self, retry_connrefused: bool, retry_dns_error: bool) -> bool {
        match self {
            ErrorKind::Network(_)
            | ErrorKind::Protocol(_)
            | ErrorKind::TimedOut
            | ErrorKind::TooLarge { .. }
            | ErrorKind::RobotsUnavailable => true,
            ErrorKind::ConnectionRefused(_) => retry_connrefused,
            ErrorKind::DnsNotFound(_) => retry_dns_error,
            ErrorKind::SslVerification(_)
            | ErrorKind::TooManyRedirects(_)
            | ErrorKind::RedirectCycle(_)
            | ErrorKind::RedirectFiltered(_)
            | ErrorKind::RobotsDisallowed
            | ErrorKind::Io(_)
            | ErrorKind::Hook(_) => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Network(_)
            | ErrorKind::ConnectionRefused(_)
            | ErrorKind::DnsNotFound(_)
            | ErrorKind::TimedOut => ErrorClass::Network,
            ErrorKind::Protocol(_)
            | ErrorKind::TooLarge { .. }
            | ErrorKind::TooManyRedirects(_)
            | ErrorKind::RedirectCycle(_)
            | ErrorKind::RedirectFiltered(_) => ErrorClass::Protocol,
            ErrorKind::SslVerification(_) => ErrorClass::Ssl,
            ErrorKind::RobotsDisallowed | ErrorKind::RobotsUnavailable => ErrorClass::Protocol,
            ErrorKind::Io(_) => ErrorClass::Io,
            ErrorKind::Hook(_) => ErrorClass::Protocol,
        }
    }
}

/// Result of one logical fetch.
pub enum FetchOutcome {
    Completed(FetchedResponse),
    Retryable(ErrorKind),
    Fatal(ErrorKind),
}

/// A finished response with its spooled body.
pub struct FetchedResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    /// URL after redirects.
    pub final_url: UrlInfo,
    pub redirect_count: u32,
    pub ip: Option<IpAddr>,
    pub body: Body,
    pub duration: Duration,
}

impl FetchedResponse {
    /// Bare MIME type from Content-Type, parameters stripped.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Per-URL fetch parameters assembled by the engine.
pub struct FetchRequest {
    pub url: UrlInfo,
    pub method: String,
    pub post_data: Option<String>,
    pub referer: Option<String>,
    /// Headers added by the writer session (Range, If-Modified-Since).
    pub extra_headers: Vec<(String, String)>,
    /// Veto for redirect targets; None follows everything.
    pub redirect_filter: Option<Arc<dyn Fn(&UrlInfo) -> bool + Send + Sync>>,
}

impl FetchRequest {
    pub fn get(url: UrlInfo) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            post_data: None,
            referer: None,
            extra_headers: Vec::new(),
            redirect_filter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub user_agent: String,
    /// `--header` values, sent on every request.
    pub custom_headers: Vec<(String, String)>,
    /// `--referer`: fallback Referer when the URL has no parent.
    pub default_referer: Option<String>,
    pub max_redirects: u32,
    /// Bytes per second; None is unlimited.
    pub limit_rate: Option<u64>,
    pub ignore_length: bool,
    pub http_compression: bool,
    pub retry_connrefused: bool,
    pub retry_dns_error: bool,
    pub temp_dir: Option<PathBuf>,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("webarc/{}", env!("CARGO_PKG_VERSION")),
            custom_headers: Vec::new(),
            default_referer: None,
            max_redirects: 20,
            limit_rate: None,
            ignore_length: false,
            http_compression: false,
            retry_connrefused: false,
            retry_dns_error: false,
            temp_dir: None,
        }
    }
}

/// Executes HTTP exchanges over the shared client.
pub struct Fetcher {
    client: Client,
    options: FetcherOptions,
    cookies: Option<Arc<Mutex<CookieJar>>>,
    stats: Arc<Statistics>,
}

impl Fetcher {
    pub fn new(
        client: Client,
        options: FetcherOptions,
        cookies: Option<Arc<Mutex<CookieJar>>>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            client,
            options,
            cookies,
            stats,
        }
    }

    /// Run one logical request, following redirects, recording each hop.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        recorder: Option<&Arc<WarcRecorder>>,
        frontier: Option<&Frontier>,
    ) -> FetchOutcome {
        let started = Instant::now();
        let origin = request.url.origin_key();
        let mut tracker = RedirectTracker::new(self.options.max_redirects, &request.url);
        let mut current_url = request.url.clone();
        let mut method = request.method.clone();
        let mut post_body: Option<Vec<u8>> =
            request.post_data.as_ref().map(|d| d.as_bytes().to_vec());

        loop {
            let wire = match self
                .assemble(request, &current_url, &method, &post_body, &origin)
                .await
            {
                Ok(wire) => wire,
                Err(kind) => return self.outcome(kind),
            };

            let mut warc_session = recorder.map(|r| r.session());

            let hop = self
                .execute_hop(&wire, &current_url, warc_session.as_mut())
                .await;

            let hop = match hop {
                Ok(hop) => hop,
                Err(kind) => {
                    if let Some(session) = warc_session.as_mut() {
                        if let Err(warc_error) =
                            session.record_failure(current_url.fetch_url(), &kind.to_string())
                        {
                            warn!(error = %warc_error, "failed to record fetch error");
                        }
                    }
                    return self.outcome(kind);
                }
            };

            // The hop's records are complete; decide whether to follow.
            let action = tracker.handle(&current_url, hop.status, hop.location.as_deref());

            if let Some(session) = warc_session.as_mut() {
                let cdx_meta = CdxMeta {
                    url: current_url.fetch_url().to_string(),
                    mime_type: bare_mime(&hop.headers),
                    status_code: Some(hop.status),
                    payload_digest: None,
                    redirect_target: hop.location.clone(),
                };
                if let Err(warc_error) = session.end_response(frontier, Some(cdx_meta)) {
                    warn!(error = %warc_error, "failed to finish WARC response record");
                    return self.outcome(ErrorKind::Io(warc_error.to_string()));
                }
            }

            match action {
                Err(kind) => return self.outcome(kind),
                Ok(RedirectAction::Finished) => {
                    return FetchOutcome::Completed(FetchedResponse {
                        status: hop.status,
                        headers: hop.headers,
                        final_url: current_url,
                        redirect_count: tracker.count(),
                        ip: hop.ip,
                        body: hop.body,
                        duration: started.elapsed(),
                    });
                }
                Ok(RedirectAction::Follow {
                    url,
                    rewrite_to_get,
                }) => {
                    if let Some(filter) = &request.redirect_filter {
                        if !filter(&url) {
                            return self
                                .outcome(ErrorKind::RedirectFiltered(url.fetch_url().to_string()));
                        }
                    }
                    debug!(from = current_url.fetch_url(), to = url.fetch_url(), "redirect");
                    if rewrite_to_get && method != "GET" {
                        method = "GET".to_string();
                        post_body = None;
                    }
                    current_url = url;
                }
            }
        }
    }

    /// Build the wire request for one hop.
    async fn assemble(
        &self,
        request: &FetchRequest,
        url: &UrlInfo,
        method: &str,
        post_body: &Option<Vec<u8>>,
        origin: &(String, String, u16),
    ) -> Result<WireRequest, ErrorKind> {
        let mut wire = WireRequest::new(method, url);
        wire.header("User-Agent", &self.options.user_agent);
        wire.header("Accept", "*/*");
        if self.options.http_compression {
            wire.header("Accept-Encoding", "gzip, br");
        }

        let cross_origin = url.origin_key() != *origin;
        for (name, value) in &self.options.custom_headers {
            if cross_origin && name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            wire.header(name, value);
        }

        if let Some(referer) = request
            .referer
            .as_ref()
            .or(self.options.default_referer.as_ref())
        {
            wire.header("Referer", referer);
        }
        for (name, value) in &request.extra_headers {
            wire.header(name, value);
        }

        if let Some(jar) = &self.cookies {
            let mut jar = jar.lock().await;
            if let Some(cookie_header) = jar.header_for(url) {
                wire.header("Cookie", &cookie_header);
            }
        }

        if let Some(body) = post_body {
            if !wire.has_header("content-type") {
                wire.header("Content-Type", "application/x-www-form-urlencoded");
            }
            wire.header("Content-Length", &body.len().to_string());
            wire.body = body.clone();
        }

        Ok(wire)
    }

    /// Send one request and stream the response through the observers.
    async fn execute_hop(
        &self,
        wire: &WireRequest,
        url: &UrlInfo,
        mut warc_session: Option<&mut WarcSession>,
    ) -> Result<HopResult, ErrorKind> {
        let method = Method::from_bytes(wire.method.as_bytes())
            .map_err(|e| ErrorKind::Protocol(e.to_string()))?;

        let mut builder = self.client.request(method, url.fetch_url());
        // Host is reconstructed for the record; reqwest sets the real one.
        for (name, value) in wire.headers.iter().skip(1) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !wire.body.is_empty() {
            builder = builder.body(wire.body.clone());
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let reason = response.status().canonical_reason().map(|s| s.to_string());
        let version = response.version();
        let ip = response.remote_addr().map(|addr| addr.ip());
        let headers = response.headers().clone();

        if let Some(jar) = &self.cookies {
            let mut jar = jar.lock().await;
            for value in headers.get_all(SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    jar.store(url, value);
                }
            }
        }

        let header_block = wire.header_block();
        self.stats
            .add_uploaded((header_block.len() + wire.body.len()) as u64);

        if let Some(session) = warc_session.as_mut() {
            session
                .record_request(url.fetch_url(), ip, &header_block, &wire.body)
                .map_err(|e| ErrorKind::Io(e.to_string()))?;
            session
                .begin_response(&response_header_block(
                    version,
                    status,
                    reason.as_deref(),
                    &headers,
                ))
                .map_err(|e| ErrorKind::Io(e.to_string()))?;
        }

        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let declared_length: Option<u64> = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .filter(|_| !self.options.http_compression);

        let mut sink = Body::sink(self.options.temp_dir.as_deref());
        let mut received = 0u64;
        let pacing_started = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(&e))?;
            received += chunk.len() as u64;

            if let Some(session) = warc_session.as_mut() {
                session
                    .response_data(&chunk)
                    .map_err(|e| ErrorKind::Io(e.to_string()))?;
            }
            sink.write(&chunk).map_err(|e| ErrorKind::Io(e.to_string()))?;
            self.stats.add_body_bytes(chunk.len() as u64);

            if !self.options.ignore_length {
                if let Some(declared) = declared_length {
                    if received > declared {
                        return Err(ErrorKind::TooLarge {
                            actual: received,
                            declared,
                        });
                    }
                }
            }

            if let Some(limit) = self.options.limit_rate {
                let expected = received as f64 / limit as f64;
                let elapsed = pacing_started.elapsed().as_secs_f64();
                if expected > elapsed {
                    tokio::time::sleep(Duration::from_secs_f64(expected - elapsed)).await;
                }
            }
        }

        if !self.options.ignore_length {
            if let Some(declared) = declared_length {
                if received < declared {
                    return Err(ErrorKind::Protocol(format!(
                        "body shorter than declared length ({received} < {declared})"
                    )));
                }
            }
        }

        Ok(HopResult {
            status,
            headers,
            ip,
            location,
            body: sink.finish(),
        })
    }

    fn outcome(&self, kind: ErrorKind) -> FetchOutcome {
        if kind.is_retryable(
            self.options.retry_connrefused,
            self.options.retry_dns_error,
        ) {
            FetchOutcome::Retryable(kind)
        } else {
            FetchOutcome::Fatal(kind)
        }
    }
}

struct HopResult {
    status: u16,
    headers: reqwest::header::HeaderMap,
    ip: Option<IpAddr>,
    location: Option<String>,
    body: Body,
}

fn bare_mime(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// Map a transport error onto the taxonomy.
fn classify(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::TimedOut;
    }

    let chain = error_chain_text(error);

    if chain.contains("certificate") || chain.contains("ssl") || chain.contains("tls") {
        return ErrorKind::SslVerification(chain);
    }
    if error.is_connect() {
        if chain.contains("refused") {
            return ErrorKind::ConnectionRefused(chain);
        }
        if chain.contains("dns") || chain.contains("resolve") || chain.contains("name") {
            return ErrorKind::DnsNotFound(chain);
        }
        return ErrorKind::Network(chain);
    }
    if error.is_body() || error.is_decode() {
        return ErrorKind::Protocol(chain);
    }
    ErrorKind::Network(chain)
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string().to_ascii_lowercase());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_matrix() {
        assert!(ErrorKind::TimedOut.is_retryable(false, false));
        assert!(ErrorKind::Network("reset".into()).is_retryable(false, false));
        assert!(ErrorKind::Protocol("framing".into()).is_retryable(false, false));

        assert!(!ErrorKind::ConnectionRefused("x".into()).is_retryable(false, false));
        assert!(ErrorKind::ConnectionRefused("x".into()).is_retryable(true, false));
        assert!(!ErrorKind::DnsNotFound("x".into()).is_retryable(false, false));
        assert!(ErrorKind::DnsNotFound("x".into()).is_retryable(false, true));

        assert!(!ErrorKind::SslVerification("bad cert".into()).is_retryable(true, true));
        assert!(!ErrorKind::RedirectCycle("u".into()).is_retryable(true, true));
        assert!(!ErrorKind::RobotsDisallowed.is_retryable(true, true));
        assert!(ErrorKind::RobotsUnavailable.is_retryable(false, false));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(ErrorKind::TimedOut.class(), ErrorClass::Network);
        assert_eq!(
            ErrorKind::SslVerification("x".into()).class(),
            ErrorClass::Ssl
        );
        assert_eq!(
            ErrorKind::RedirectCycle("u".into()).class(),
            ErrorClass::Protocol
        );
    }

    #[test]
    fn test_fetch_request_defaults() {
        let request = FetchRequest::get(UrlInfo::parse("http://h/a").unwrap());
        assert_eq!(request.method, "GET");
        assert!(request.post_data.is_none());
        assert!(request.extra_headers.is_empty());
    }
}
