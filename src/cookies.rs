//! Cookie storage per RFC 6265, with wget-compatible cookies.txt files.
//!
//! The jar caps each cookie at 4 KiB and each registrable domain at 50
//! cookies, evicting the least recently created. Expired cookies are purged
//! when looked up. `Cookie` headers list matches by path length (longest
//! first) and then creation time, as the RFC requires.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tracing::debug;

use crate::urlnorm::UrlInfo;

/// name + value byte budget per cookie.
const MAX_COOKIE_BYTES: usize = 4096;
/// Cookies per registrable domain.
const MAX_COOKIES_PER_DOMAIN: usize = 50;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie file error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Effective domain, without a leading dot.
    pub domain: String,
    /// True when the Domain attribute was absent: exact host match only.
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// None for session cookies.
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Cookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    fn domain_matches(&self, host: &str) -> bool {
        if self.host_only {
            return host == self.domain;
        }
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if request_path.starts_with(&self.path) {
            return self.path.ends_with('/')
                || request_path.as_bytes().get(self.path.len()) == Some(&b'/');
        }
        false
    }
}

/// In-memory cookie store.
pub struct CookieJar {
    // Keyed by (domain, path, name).
    cookies: HashMap<(String, String, String), Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            cookies: HashMap::new(),
        }
    }

    /// Store cookies from a `Set-Cookie` header value.
    pub fn store(&mut self, url: &UrlInfo, header_value: &str) {
        let Some(cookie) = parse_set_cookie(url, header_value) else {
            return;
        };

        if cookie.name.len() + cookie.value.len() > MAX_COOKIE_BYTES {
            debug!(name = %cookie.name, "cookie over size cap, dropped");
            return;
        }

        let key = (
            cookie.domain.clone(),
            cookie.path.clone(),
            cookie.name.clone(),
        );

        // Deleting via Max-Age=0 / past Expires.
        if cookie.is_expired(Utc::now()) {
            self.cookies.remove(&key);
            return;
        }

        self.cookies.insert(key, cookie.clone());
        self.enforce_domain_cap(&cookie.domain);
    }

    fn enforce_domain_cap(&mut self, domain: &str) {
        let reg_domain = registrable_domain(domain);
        let mut owned: Vec<(String, String, String)> = self
            .cookies
            .iter()
            .filter(|(_, c)| registrable_domain(&c.domain) == reg_domain)
            .map(|(k, _)| k.clone())
            .collect();

        if owned.len() <= MAX_COOKIES_PER_DOMAIN {
            return;
        }

        owned.sort_by_key(|k| self.cookies[k].created_at);
        let excess = owned.len() - MAX_COOKIES_PER_DOMAIN;
        for key in owned.into_iter().take(excess) {
            self.cookies.remove(&key);
        }
    }

    /// Build a `Cookie` header value for a request, or None when no cookie
    /// matches. Expired cookies encountered on the way are purged.
    pub fn header_for(&mut self, url: &UrlInfo) -> Option<String> {
        let now = Utc::now();
        let host = url.host().to_string();
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let secure_channel = url.scheme() == "https";

        self.cookies.retain(|_, c| !c.is_expired(now));

        let mut matches: Vec<&Cookie> = self
            .cookies
            .values()
            .filter(|c| c.domain_matches(&host))
            .filter(|c| c.path_matches(path))
            .filter(|c| !c.secure || secure_channel)
            .collect();

        if matches.is_empty() {
            return None;
        }

        matches.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });

        Some(
            matches
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Load a Mozilla cookies.txt file, merging into the jar.
    pub fn load_cookies_txt(&mut self, path: &Path) -> Result<usize, CookieError> {
        let text = fs::read_to_string(path)?;
        let mut loaded = 0;

        for line in text.lines() {
            let (line, http_only) = match line.strip_prefix("#HttpOnly_") {
                Some(rest) => (rest, true),
                None => (line, false),
            };

            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                continue;
            }

            let domain_field = fields[0];
            let host_only = !domain_field.starts_with('.');
            let domain = domain_field.trim_start_matches('.').to_string();
            let expiry: i64 = fields[4].parse().unwrap_or(0);

            let cookie = Cookie {
                name: fields[5].to_string(),
                value: fields[6].to_string(),
                domain: domain.clone(),
                host_only,
                path: fields[2].to_string(),
                secure: fields[3] == "TRUE",
                http_only,
                expires: if expiry > 0 {
                    Utc.timestamp_opt(expiry, 0).single()
                } else {
                    None
                },
                created_at: Utc::now(),
            };

            let key = (cookie.domain.clone(), cookie.path.clone(), cookie.name.clone());
            self.cookies.insert(key, cookie);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Write the jar as cookies.txt. Session cookies are kept only when
    /// `keep_session` is set.
    pub fn save_cookies_txt(&self, path: &Path, keep_session: bool) -> Result<(), CookieError> {
        let now = Utc::now();
        let mut file = fs::File::create(path)?;
        writeln!(file, "# Netscape HTTP Cookie File")?;
        writeln!(file, "# Generated by webarc. Edit at your own risk.")?;
        writeln!(file)?;

        let mut cookies: Vec<&Cookie> = self.cookies.values().collect();
        cookies.sort_by(|a, b| (&a.domain, &a.path, &a.name).cmp(&(&b.domain, &b.path, &b.name)));

        for cookie in cookies {
            if cookie.is_expired(now) {
                continue;
            }
            if cookie.expires.is_none() && !keep_session {
                continue;
            }

            let domain_field = if cookie.host_only {
                cookie.domain.clone()
            } else {
                format!(".{}", cookie.domain)
            };

            let prefix = if cookie.http_only { "#HttpOnly_" } else { "" };
            writeln!(
                file,
                "{}{}\t{}\t{}\t{}\t{}\t{}\t{}",
                prefix,
                domain_field,
                if cookie.host_only { "FALSE" } else { "TRUE" },
                cookie.path,
                if cookie.secure { "TRUE" } else { "FALSE" },
                cookie.expires.map(|e| e.timestamp()).unwrap_or(0),
                cookie.name,
                cookie.value,
            )?;
        }

        Ok(())
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one `Set-Cookie` value in the context of the request URL.
///
/// Returns None for malformed values and for Domain attributes a public
/// server could use to poison sibling sites (no embedded dot, or not a
/// suffix of the request host).
fn parse_set_cookie(url: &UrlInfo, value: &str) -> Option<Cookie> {
    let mut parts = value.split(';');
    let pair = parts.next()?;
    let (name, cookie_value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let cookie_value = cookie_value.trim().trim_matches('"');

    let host = url.host().to_string();
    let mut domain = host.clone();
    let mut host_only = true;
    let mut path = default_path(url.path());
    let mut secure = false;
    let mut http_only = false;
    let mut expires: Option<DateTime<Utc>> = None;
    let mut max_age: Option<i64> = None;

    for attr in parts {
        let attr = attr.trim();
        let (key, attr_value) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr, ""),
        };

        match key.to_ascii_lowercase().as_str() {
            "domain" => {
                let requested = attr_value.trim_start_matches('.').to_ascii_lowercase();
                if requested.is_empty() {
                    continue;
                }
                // Reject registry-wide domains and unrelated hosts.
                if !requested.contains('.') && requested != host {
                    return None;
                }
                if host != requested && !host.ends_with(&format!(".{requested}")) {
                    return None;
                }
                domain = requested;
                host_only = false;
            }
            "path" => {
                if attr_value.starts_with('/') {
                    path = attr_value.to_string();
                }
            }
            "secure" => secure = true,
            "httponly" => http_only = true,
            "max-age" => {
                max_age = attr_value.parse().ok();
            }
            "expires" => {
                expires = parse_cookie_date(attr_value);
            }
            _ => {}
        }
    }

    // Max-Age wins over Expires.
    if let Some(seconds) = max_age {
        expires = Some(if seconds <= 0 {
            DateTime::UNIX_EPOCH
        } else {
            Utc::now() + chrono::Duration::seconds(seconds)
        });
    }

    Some(Cookie {
        name: name.to_string(),
        value: cookie_value.to_string(),
        domain,
        host_only,
        path,
        secure,
        http_only,
        expires,
        created_at: Utc::now(),
    })
}

/// RFC 6265 default-path computation.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    for format in [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%a, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    None
}

/// Last two labels of a hostname, as an approximation of the registrable
/// domain for the per-domain cookie cap.
fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.rsplit('.').take(2).collect();
    labels
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(".")
}
