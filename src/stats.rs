//! Crawl counters and bandwidth accounting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Broad error classes tallied for the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    Protocol,
    Ssl,
    Authentication,
    Server,
    Io,
}

/// Process-wide crawl statistics. All counters are atomic; the engine shares
/// one instance with the filters and the CLI summary.
pub struct Statistics {
    started: Instant,
    urls_queued: AtomicU64,
    urls_dequeued: AtomicU64,
    files_saved: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    done: AtomicU64,
    errored: AtomicU64,
    skipped: AtomicU64,
    network_errors: AtomicU64,
    protocol_errors: AtomicU64,
    ssl_errors: AtomicU64,
    auth_errors: AtomicU64,
    server_errors: AtomicU64,
    io_errors: AtomicU64,
    bandwidth: Mutex<BandwidthMeter>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            urls_queued: AtomicU64::new(0),
            urls_dequeued: AtomicU64::new(0),
            files_saved: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            done: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            ssl_errors: AtomicU64::new(0),
            auth_errors: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
            bandwidth: Mutex::new(BandwidthMeter::new(Duration::from_secs(10))),
        }
    }

    pub fn add_queued(&self, count: u64) {
        self.urls_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dequeued(&self) {
        self.urls_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_file(&self, size: u64) {
        self.files_saved.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(size, Ordering::Relaxed);
        if let Ok(mut meter) = self.bandwidth.lock() {
            meter.feed(size);
        }
    }

    pub fn add_body_bytes(&self, count: u64) {
        if let Ok(mut meter) = self.bandwidth.lock() {
            meter.feed(count);
        }
    }

    pub fn add_uploaded(&self, count: u64) {
        self.bytes_uploaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Network => &self.network_errors,
            ErrorClass::Protocol => &self.protocol_errors,
            ErrorClass::Ssl => &self.ssl_errors,
            ErrorClass::Authentication => &self.auth_errors,
            ErrorClass::Server => &self.server_errors,
            ErrorClass::Io => &self.io_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, class: ErrorClass) -> u64 {
        let counter = match class {
            ErrorClass::Network => &self.network_errors,
            ErrorClass::Protocol => &self.protocol_errors,
            ErrorClass::Ssl => &self.ssl_errors,
            ErrorClass::Authentication => &self.auth_errors,
            ErrorClass::Server => &self.server_errors,
            ErrorClass::Io => &self.io_errors,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn urls_queued(&self) -> u64 {
        self.urls_queued.load(Ordering::Relaxed)
    }

    pub fn urls_dequeued(&self) -> u64 {
        self.urls_dequeued.load(Ordering::Relaxed)
    }

    pub fn files_saved(&self) -> u64 {
        self.files_saved.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current download rate in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
            .lock()
            .map(|meter| meter.rate())
            .unwrap_or(0.0)
    }

    /// Whether the byte quota has been reached.
    pub fn quota_exceeded(&self, quota: u64) -> bool {
        quota > 0 && self.bytes_downloaded() >= quota
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters, for structured logging and the
/// `finish_statistics` hook.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub urls_queued: u64,
    pub urls_dequeued: u64,
    pub files_saved: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub done: u64,
    pub errors: u64,
    pub skipped: u64,
    pub duration_secs: f64,
}

impl Statistics {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            urls_queued: self.urls_queued(),
            urls_dequeued: self.urls_dequeued(),
            files_saved: self.files_saved(),
            bytes_downloaded: self.bytes_downloaded(),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            done: self.done(),
            errors: self.errored(),
            skipped: self.skipped(),
            duration_secs: self.duration().as_secs_f64(),
        }
    }
}

/// Sliding-window byte rate meter.
struct BandwidthMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl BandwidthMeter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn feed(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        let cutoff = now - self.window;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self) -> f64 {
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let span = match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) => last.duration_since(*first),
            _ => return 0.0,
        };
        if span.is_zero() {
            return total as f64;
        }
        total as f64 / span.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.add_queued(3);
        stats.add_dequeued();
        stats.add_file(100);
        stats.add_file(50);
        stats.mark_done();

        assert_eq!(stats.urls_queued(), 3);
        assert_eq!(stats.urls_dequeued(), 1);
        assert_eq!(stats.files_saved(), 2);
        assert_eq!(stats.bytes_downloaded(), 150);
        assert_eq!(stats.done(), 1);
    }

    #[test]
    fn test_quota() {
        let stats = Statistics::new();
        assert!(!stats.quota_exceeded(0));
        stats.add_file(10);
        assert!(!stats.quota_exceeded(11));
        assert!(stats.quota_exceeded(10));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Statistics::new();
        stats.add_queued(2);
        stats.add_file(10);

        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"urls_queued\":2"));
        assert!(json.contains("\"bytes_downloaded\":10"));
    }

    #[test]
    fn test_error_classes() {
        let stats = Statistics::new();
        stats.add_error(ErrorClass::Network);
        stats.add_error(ErrorClass::Network);
        stats.add_error(ErrorClass::Ssl);
        assert_eq!(stats.error_count(ErrorClass::Network), 2);
        assert_eq!(stats.error_count(ErrorClass::Ssl), 1);
        assert_eq!(stats.error_count(ErrorClass::Server), 0);
    }
}
