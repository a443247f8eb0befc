//! Redirect hop tracking for one logical request.

use std::collections::HashSet;

use super::ErrorKind;
use crate::urlnorm::UrlInfo;

/// Codes where the next request becomes a GET.
const REWRITE_CODES: &[u16] = &[301, 302, 303];
/// Codes where the method and body must be repeated.
const REPEAT_CODES: &[u16] = &[307, 308];

/// What to do with a response, redirect-wise.
#[derive(Debug)]
pub enum RedirectAction {
    /// Not a redirect; the response is final.
    Finished,
    /// Follow to this URL, optionally downgrading the method to GET.
    Follow { url: UrlInfo, rewrite_to_get: bool },
}

/// Counts hops and detects loops across one logical request.
pub struct RedirectTracker {
    max_redirects: u32,
    count: u32,
    visited: HashSet<String>,
}

impl RedirectTracker {
    pub fn new(max_redirects: u32, origin: &UrlInfo) -> Self {
        let mut visited = HashSet::new();
        visited.insert(origin.key().to_string());
        Self {
            max_redirects,
            count: 0,
            visited,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Classify a response and, for redirects, compute the next hop.
    pub fn handle(
        &mut self,
        current: &UrlInfo,
        status: u16,
        location: Option<&str>,
    ) -> Result<RedirectAction, ErrorKind> {
        if !REWRITE_CODES.contains(&status) && !REPEAT_CODES.contains(&status) {
            return Ok(RedirectAction::Finished);
        }

        let Some(location) = location else {
            // 3xx without Location is delivered as a final response.
            return Ok(RedirectAction::Finished);
        };

        self.count += 1;
        if self.count > self.max_redirects {
            return Err(ErrorKind::TooManyRedirects(self.count));
        }

        let next = current
            .join(location)
            .map_err(|e| ErrorKind::Protocol(format!("bad Location header: {e}")))?;

        if !self.visited.insert(next.key().to_string()) {
            return Err(ErrorKind::RedirectCycle(next.fetch_url().to_string()));
        }

        Ok(RedirectAction::Follow {
            url: next,
            rewrite_to_get: REWRITE_CODES.contains(&status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    #[test]
    fn test_not_a_redirect() {
        let origin = url("http://h/a");
        let mut tracker = RedirectTracker::new(5, &origin);
        assert!(matches!(
            tracker.handle(&origin, 200, None),
            Ok(RedirectAction::Finished)
        ));
    }

    #[test]
    fn test_follow_and_rewrite() {
        let origin = url("http://h/a");
        let mut tracker = RedirectTracker::new(5, &origin);

        match tracker.handle(&origin, 301, Some("/b")).unwrap() {
            RedirectAction::Follow {
                url,
                rewrite_to_get,
            } => {
                assert_eq!(url.fetch_url(), "http://h/b");
                assert!(rewrite_to_get);
            }
            other => panic!("expected Follow, got {other:?}"),
        }

        match tracker.handle(&url("http://h/b"), 307, Some("/c")).unwrap() {
            RedirectAction::Follow { rewrite_to_get, .. } => assert!(!rewrite_to_get),
            other => panic!("expected Follow, got {other:?}"),
        }
    }

    #[test]
    fn test_loop_detection() {
        let origin = url("http://h/a");
        let mut tracker = RedirectTracker::new(5, &origin);

        tracker.handle(&origin, 302, Some("/b")).unwrap();
        let result = tracker.handle(&url("http://h/b"), 302, Some("/a"));
        assert!(matches!(result, Err(ErrorKind::RedirectCycle(_))));
    }

    #[test]
    fn test_hop_budget() {
        let origin = url("http://h/0");
        let mut tracker = RedirectTracker::new(2, &origin);

        tracker.handle(&url("http://h/0"), 302, Some("/1")).unwrap();
        tracker.handle(&url("http://h/1"), 302, Some("/2")).unwrap();
        let result = tracker.handle(&url("http://h/2"), 302, Some("/3"));
        assert!(matches!(result, Err(ErrorKind::TooManyRedirects(_))));
    }

    #[test]
    fn test_missing_location_is_final() {
        let origin = url("http://h/a");
        let mut tracker = RedirectTracker::new(5, &origin);
        assert!(matches!(
            tracker.handle(&origin, 301, None),
            Ok(RedirectAction::Finished)
        ));
    }
}
