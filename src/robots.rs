//! robots.txt exclusion cache.
//!
//! One entry per `(scheme, host, port)` with a 24-hour TTL. The cache never
//! fetches on its own: the engine asks [`RobotsCache::evaluate`] and, when a
//! fetch is needed, retrieves `/robots.txt` through the normal fetcher
//! (bypassing the filter chain and quota) and hands the result back via
//! [`RobotsCache::load`]. Errors resolve permissively: 4xx and repeated
//! network failures allow everything; 5xx stays undecided so the caller can
//! requeue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use robotstxt::DefaultMatcher;
use tracing::debug;

use crate::urlnorm::UrlInfo;

const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Network failures tolerated before treating the host as allow-all.
const MAX_FETCH_ATTEMPTS: u32 = 3;

type OriginKey = (String, String, u16);

#[derive(Debug, Clone)]
enum Outcome {
    AllowAll,
    Rules(String),
}

#[derive(Debug)]
struct Entry {
    outcome: Outcome,
    fetched_at: Instant,
}

/// What the engine should do about a URL.
#[derive(Debug)]
pub enum RobotsCheck {
    /// Cache has an answer.
    Decided(bool),
    /// Fetch this robots.txt URL, then call `load` and re-evaluate.
    NeedsFetch(UrlInfo),
    /// robots.txt itself is failing with a server error; retry the URL later.
    Unavailable,
}

/// Result of the robots.txt fetch handed back by the engine.
#[derive(Debug)]
pub enum RobotsFetchResult {
    /// 2xx with body text.
    Fetched(String),
    /// Definitive 4xx: no robots restrictions.
    NotFound,
    /// 5xx: transient, host stays undecided.
    ServerError,
    /// DNS/connect/read failure.
    NetworkError,
}

pub struct RobotsCache {
    user_agent: String,
    entries: Mutex<HashMap<OriginKey, Entry>>,
    failed_attempts: Mutex<HashMap<OriginKey, u32>>,
}

impl RobotsCache {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            entries: Mutex::new(HashMap::new()),
            failed_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Check a URL against the cache.
    pub fn evaluate(&self, url: &UrlInfo) -> RobotsCheck {
        let key = url.origin_key();

        let entries = self.entries.lock().expect("robots cache poisoned");
        if let Some(entry) = entries.get(&key) {
            if entry.fetched_at.elapsed() < ENTRY_TTL {
                return RobotsCheck::Decided(self.allowed_by(&entry.outcome, url));
            }
        }
        drop(entries);

        match url.with_path("/robots.txt") {
            Ok(robots_url) => RobotsCheck::NeedsFetch(robots_url),
            // A URL that cannot carry /robots.txt cannot be restricted by it.
            Err(_) => RobotsCheck::Decided(true),
        }
    }

    /// Store the outcome of a robots.txt fetch for the URL's origin.
    pub fn load(&self, url: &UrlInfo, result: RobotsFetchResult) -> RobotsCheck {
        let key = url.origin_key();

        let outcome = match result {
            RobotsFetchResult::Fetched(body) => {
                debug!(host = url.host(), bytes = body.len(), "robots.txt loaded");
                Some(Outcome::Rules(body))
            }
            RobotsFetchResult::NotFound => Some(Outcome::AllowAll),
            RobotsFetchResult::ServerError => None,
            RobotsFetchResult::NetworkError => {
                let mut attempts = self.failed_attempts.lock().expect("robots cache poisoned");
                let count = attempts.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count >= MAX_FETCH_ATTEMPTS {
                    debug!(host = url.host(), "robots.txt unreachable, allowing all");
                    Some(Outcome::AllowAll)
                } else {
                    None
                }
            }
        };

        match outcome {
            Some(outcome) => {
                let allowed = self.allowed_by(&outcome, url);
                self.entries.lock().expect("robots cache poisoned").insert(
                    key,
                    Entry {
                        outcome,
                        fetched_at: Instant::now(),
                    },
                );
                RobotsCheck::Decided(allowed)
            }
            None => RobotsCheck::Unavailable,
        }
    }

    fn allowed_by(&self, outcome: &Outcome, url: &UrlInfo) -> bool {
        match outcome {
            Outcome::AllowAll => true,
            Outcome::Rules(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, &self.user_agent, url.fetch_url())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    #[test]
    fn test_needs_fetch_then_decides() {
        let cache = RobotsCache::new("webarc");
        let page = url("http://example.com/x/y");

        let robots_url = match cache.evaluate(&page) {
            RobotsCheck::NeedsFetch(u) => u,
            other => panic!("expected NeedsFetch, got {other:?}"),
        };
        assert_eq!(robots_url.fetch_url(), "http://example.com/robots.txt");

        cache.load(
            &page,
            RobotsFetchResult::Fetched("User-agent: *\nDisallow: /x/".to_string()),
        );

        assert!(matches!(cache.evaluate(&page), RobotsCheck::Decided(false)));
        assert!(matches!(
            cache.evaluate(&url("http://example.com/y")),
            RobotsCheck::Decided(true)
        ));
    }

    #[test]
    fn test_not_found_allows_all() {
        let cache = RobotsCache::new("webarc");
        let page = url("http://example.com/secret");

        cache.load(&page, RobotsFetchResult::NotFound);
        assert!(matches!(cache.evaluate(&page), RobotsCheck::Decided(true)));
    }

    #[test]
    fn test_server_error_stays_undecided() {
        let cache = RobotsCache::new("webarc");
        let page = url("http://example.com/a");

        assert!(matches!(
            cache.load(&page, RobotsFetchResult::ServerError),
            RobotsCheck::Unavailable
        ));
        assert!(matches!(cache.evaluate(&page), RobotsCheck::NeedsFetch(_)));
    }

    #[test]
    fn test_network_errors_eventually_allow() {
        let cache = RobotsCache::new("webarc");
        let page = url("http://example.com/a");

        assert!(matches!(
            cache.load(&page, RobotsFetchResult::NetworkError),
            RobotsCheck::Unavailable
        ));
        assert!(matches!(
            cache.load(&page, RobotsFetchResult::NetworkError),
            RobotsCheck::Unavailable
        ));
        assert!(matches!(
            cache.load(&page, RobotsFetchResult::NetworkError),
            RobotsCheck::Decided(true)
        ));
    }

    #[test]
    fn test_origins_are_independent() {
        let cache = RobotsCache::new("webarc");
        cache.load(
            &url("http://example.com/a"),
            RobotsFetchResult::Fetched("User-agent: *\nDisallow: /".to_string()),
        );

        assert!(matches!(
            cache.evaluate(&url("http://example.com/b")),
            RobotsCheck::Decided(false)
        ));
        assert!(matches!(
            cache.evaluate(&url("https://example.com/b")),
            RobotsCheck::NeedsFetch(_)
        ));
        assert!(matches!(
            cache.evaluate(&url("http://other.com/b")),
            RobotsCheck::NeedsFetch(_)
        ));
    }
}
