//! The crawl scheduler.
//!
//! A bounded number of tasks drain the frontier: each claims a URL, runs it
//! through the filter chain, the robots gate, the per-host politeness lock,
//! the fetcher, the writer, and the scraper, then enqueues the children and
//! checks the record back in. The crawl ends when the frontier has no TODO
//! rows and nothing is in flight.
//!
//! Requests to one host are serialized on that host's lock; ordering across
//! hosts is unspecified. The first stop signal blocks new claims and lets
//! in-flight tasks finish; the second aborts them, after which claimed rows
//! are released back to TODO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::fetch::{ErrorKind, FetchOutcome, FetchRequest, Fetcher};
use crate::filters::FilterChain;
use crate::frontier::Frontier;
use crate::hooks::{HookAction, HookRegistry, ResponseInfo};
use crate::models::{CheckIn, LinkType, NewUrl, Status, UrlRecord};
use crate::robots::{RobotsCache, RobotsCheck, RobotsFetchResult};
use crate::scrape::{LinkKind, ScrapeDispatcher};
use crate::stats::Statistics;
use crate::urlnorm::UrlInfo;
use crate::waiter::Waiter;
use crate::warc::WarcRecorder;
use crate::writer::{SaveDecision, Writer};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("frontier error: {0}")]
    Frontier(#[from] crate::frontier::FrontierError),

    #[error("archive error: {0}")]
    Warc(#[from] crate::warc::WarcError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub concurrent: usize,
    pub tries: u32,
    /// Byte quota; 0 is unlimited. Exceeding it stops the crawl gracefully.
    pub quota: u64,
    pub robots_enabled: bool,
    pub sitemaps: bool,
    pub wait: Duration,
    pub random_wait: bool,
    pub waitretry: Duration,
    /// Redirect targets bypass host-scoped filters.
    pub strong_redirects: bool,
    /// Save 4xx/5xx bodies instead of discarding them.
    pub content_on_error: bool,
    pub ignore_fatal_errors: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrent: 1,
            tries: 20,
            quota: 0,
            robots_enabled: true,
            sitemaps: false,
            wait: Duration::ZERO,
            random_wait: false,
            waitretry: Duration::from_secs(10),
            strong_redirects: true,
            content_on_error: false,
            ignore_fatal_errors: false,
        }
    }
}

/// Cooperative stop signal shared with the signal handler.
#[derive(Default)]
pub struct StopState {
    graceful: AtomicBool,
    immediate: AtomicBool,
    fatal: AtomicBool,
}

#[derive(Clone, Default)]
pub struct StopHandle(Arc<StopState>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// First signal: finish in-flight work, claim nothing new.
    pub fn request_graceful(&self) {
        self.0.graceful.store(true, Ordering::SeqCst);
    }

    /// Second signal: abort everything now.
    pub fn request_immediate(&self) {
        self.0.graceful.store(true, Ordering::SeqCst);
        self.0.immediate.store(true, Ordering::SeqCst);
    }

    pub fn is_graceful(&self) -> bool {
        self.0.graceful.load(Ordering::SeqCst)
    }

    pub fn is_immediate(&self) -> bool {
        self.0.immediate.load(Ordering::SeqCst)
    }

    fn mark_fatal(&self) {
        self.0.fatal.store(true, Ordering::SeqCst);
        self.request_graceful();
    }

    pub fn had_fatal_error(&self) -> bool {
        self.0.fatal.load(Ordering::SeqCst)
    }
}

struct HostState {
    waiter: Waiter,
    last_request: Option<Instant>,
}

pub struct Engine {
    frontier: Arc<Frontier>,
    filters: Arc<FilterChain>,
    fetcher: Arc<Fetcher>,
    writer: Arc<Writer>,
    scraper: Arc<ScrapeDispatcher>,
    robots: Arc<RobotsCache>,
    recorder: Option<Arc<WarcRecorder>>,
    hooks: Arc<HookRegistry>,
    stats: Arc<Statistics>,
    options: EngineOptions,
    hosts: StdMutex<HashMap<String, Arc<Mutex<HostState>>>>,
    stop: StopHandle,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontier: Arc<Frontier>,
        filters: Arc<FilterChain>,
        fetcher: Arc<Fetcher>,
        writer: Arc<Writer>,
        scraper: Arc<ScrapeDispatcher>,
        robots: Arc<RobotsCache>,
        recorder: Option<Arc<WarcRecorder>>,
        hooks: Arc<HookRegistry>,
        stats: Arc<Statistics>,
        options: EngineOptions,
        stop: StopHandle,
    ) -> Self {
        Self {
            frontier,
            filters,
            fetcher,
            writer,
            scraper,
            robots,
            recorder,
            hooks,
            stats,
            options,
            hosts: StdMutex::new(HashMap::new()),
            stop,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Put the seed URLs into the frontier at level 0.
    ///
    /// `post_data` turns the seed requests into POSTs; it is stored on the
    /// rows so a resumed run repeats the same request.
    pub fn seed(&self, seeds: &[UrlInfo], post_data: Option<&str>) -> Result<usize, EngineError> {
        let new_urls: Vec<NewUrl> = seeds
            .iter()
            .map(|seed| NewUrl {
                post_data: post_data.map(|d| d.to_string()),
                ..NewUrl::seed(seed)
            })
            .collect();
        let added = self.frontier.add_many(&new_urls)?;
        self.stats.add_queued(added as u64);
        for seed in seeds {
            self.hooks.queued_url(seed);
        }
        Ok(added)
    }

    /// Drive the crawl to completion (or stop).
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let released = self.frontier.release_in_progress()?;
        if released > 0 {
            info!(count = released, "recovered interrupted URLs back to queue");
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrent.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if self.options.quota > 0 && self.stats.quota_exceeded(self.options.quota) {
                info!(quota = self.options.quota, "download quota reached, stopping");
                self.stop.request_graceful();
            }
            if self.stop.is_graceful() {
                break;
            }

            // Reap whatever already finished.
            while tasks.try_join_next().is_some() {}

            // Bounded wait so stop signals are noticed even while every
            // permit is busy.
            let permit = match tokio::time::timeout(
                Duration::from_millis(250),
                Arc::clone(&semaphore).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => continue,
            };

            match self.frontier.check_out() {
                Ok(Some(record)) => {
                    self.stats.add_dequeued();
                    if let Ok(url) = UrlInfo::parse(&record.url) {
                        self.hooks.dequeued_url(&url, &record);
                    }
                    let engine = Arc::clone(&self);
                    tasks.spawn(async move {
                        engine.process(record).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if tasks.is_empty() {
                        // Termination: no TODO, nothing in flight.
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(db_error) => {
                    drop(permit);
                    error!(error = %db_error, "frontier check-out failed");
                    if !self.options.ignore_fatal_errors {
                        self.stop.mark_fatal();
                    } else {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        if self.stop.is_immediate() {
            warn!("immediate stop: aborting in-flight downloads");
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        // Nothing may stay IN_PROGRESS after shutdown.
        self.frontier.release_in_progress()?;

        self.hooks.finish_statistics(&self.stats);
        Ok(())
    }

    fn host_state(&self, host: &str) -> Arc<Mutex<HostState>> {
        let mut hosts = self.hosts.lock().expect("host table poisoned");
        hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(HostState {
                    waiter: Waiter::new(
                        self.options.wait,
                        self.options.random_wait,
                        self.options.waitretry,
                    ),
                    last_request: None,
                }))
            })
            .clone()
    }

    /// The per-URL pipeline.
    async fn process(self: &Arc<Self>, record: UrlRecord) {
        let url = match UrlInfo::parse(&record.url) {
            Ok(url) => url,
            Err(parse_error) => {
                self.check_in_terminal(
                    &record,
                    Status::Error,
                    CheckIn {
                        increment_try_count: true,
                        error: Some(parse_error.to_string()),
                        ..CheckIn::default()
                    },
                );
                return;
            }
        };

        // Filter chain, with the hook getting the last word.
        let verdict = self.filters.test(&url, &record);
        if !verdict.verdict {
            debug!(url = %url, failed = ?verdict.failed, "rejected by filters");
        }
        if !self.hooks.accept_url(&url, &record, verdict.verdict) {
            self.stats.mark_skipped();
            self.check_in_terminal(
                &record,
                Status::Skipped,
                CheckIn {
                    error: (!verdict.failed.is_empty())
                        .then(|| format!("filters: {}", verdict.failed.join(","))),
                    ..CheckIn::default()
                },
            );
            return;
        }

        // Robots gate. The robots fetch itself bypasses the chain.
        if self.options.robots_enabled && record.link_type != Some(LinkType::Robots) {
            match self.check_robots(&url, &record).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(url = %url, "disallowed by robots.txt");
                    self.stats.mark_skipped();
                    self.check_in_terminal(
                        &record,
                        Status::Skipped,
                        CheckIn {
                            error: Some(ErrorKind::RobotsDisallowed.to_string()),
                            ..CheckIn::default()
                        },
                    );
                    return;
                }
                Err(kind) => {
                    // Only RobotsUnavailable comes back here; it is
                    // transient by definition.
                    self.finish_with_error(&record, kind, true, None).await;
                    return;
                }
            }
        }

        // One request at a time per host, politeness included.
        let host_state = self.host_state(url.host());
        let mut host = host_state.lock().await;

        let delay = self.hooks.wait_time(host.waiter.get(), &record);
        if let Some(last) = host.last_request {
            let since = last.elapsed();
            if delay > since {
                tokio::time::sleep(delay - since).await;
            }
        }

        if let Some(recorder) = &self.recorder {
            if let Err(warc_error) = recorder.maybe_rotate() {
                error!(error = %warc_error, "WARC rotation failed");
                if !self.options.ignore_fatal_errors {
                    self.stop.mark_fatal();
                    self.check_in_terminal(
                        &record,
                        Status::Error,
                        CheckIn {
                            increment_try_count: true,
                            error: Some(warc_error.to_string()),
                            ..CheckIn::default()
                        },
                    );
                    return;
                }
            }
        }

        let mut writer_session = self.writer.session(&url);
        let request = self.build_request(&url, &record, writer_session.request_headers());

        let outcome = self
            .fetcher
            .fetch(&request, self.recorder.as_ref(), Some(&self.frontier))
            .await;
        host.last_request = Some(Instant::now());

        match outcome {
            FetchOutcome::Completed(response) => {
                match self.hooks.handle_pre_response(&record, response.status) {
                    HookAction::Stop => {
                        self.stop.request_graceful();
                        self.requeue(&record, "stopped by hook").await;
                        return;
                    }
                    HookAction::Retry => {
                        self.requeue(&record, "retry requested by hook").await;
                        return;
                    }
                    HookAction::Finish => {
                        self.stats.mark_done();
                        self.check_in_terminal(
                            &record,
                            Status::Done,
                            CheckIn {
                                increment_try_count: true,
                                status_code: Some(response.status),
                                ..CheckIn::default()
                            },
                        );
                        return;
                    }
                    HookAction::Normal => {}
                }

                host.waiter.reset();
                drop(host);
                self.handle_response(&record, &url, response, writer_session)
                    .await;
            }
            FetchOutcome::Retryable(kind) => {
                host.waiter.increment();
                drop(host);
                self.finish_with_error(&record, kind, true, Some(&writer_session))
                    .await;
            }
            FetchOutcome::Fatal(kind) => {
                drop(host);
                writer_session.discard();
                self.finish_with_error(&record, kind, false, None).await;
            }
        }
    }

    fn build_request(
        &self,
        url: &UrlInfo,
        record: &UrlRecord,
        extra_headers: Vec<(String, String)>,
    ) -> FetchRequest {
        let filters = Arc::clone(&self.filters);
        let redirect_record = record.clone();
        let strong = self.options.strong_redirects;

        FetchRequest {
            url: url.clone(),
            method: if record.post_data.is_some() {
                "POST".to_string()
            } else {
                "GET".to_string()
            },
            post_data: record.post_data.clone(),
            referer: record.referer.clone(),
            extra_headers,
            redirect_filter: Some(Arc::new(move |target: &UrlInfo| {
                if strong {
                    filters.test_for_redirect(target, &redirect_record).verdict
                } else {
                    filters.test(target, &redirect_record).verdict
                }
            })),
        }
    }

    /// Response pipeline: classify status, save, scrape, enqueue children.
    async fn handle_response(
        self: &Arc<Self>,
        record: &UrlRecord,
        url: &UrlInfo,
        mut response: crate::fetch::FetchedResponse,
        writer_session: crate::writer::WriterSession,
    ) {
        let status = response.status;

        // Status taxonomy: 2xx success, 3xx unresolvable redirect, 4xx
        // terminal, 5xx and 429 transient.
        if status >= 500 || status == 429 {
            self.stats.add_error(crate::stats::ErrorClass::Server);
            self.bump_host_backoff(url).await;
            self.finish_with_error(
                record,
                ErrorKind::Protocol(format!("HTTP {status}")),
                true,
                None,
            )
            .await;
            return;
        }

        // 304 is handled by the writer; other 3xx arriving here had no
        // usable Location.
        if (300..400).contains(&status) && status != 304 {
            self.finish_with_error(
                record,
                ErrorKind::Protocol(format!("HTTP {status} without usable Location")),
                true,
                None,
            )
            .await;
            return;
        }

        let is_error_status = status >= 400;
        if is_error_status {
            self.stats.add_error(if status == 401 || status == 407 {
                crate::stats::ErrorClass::Authentication
            } else {
                crate::stats::ErrorClass::Server
            });
        }

        // Writer phase.
        let mut saved_filename: Option<String> = None;
        let save_body = !is_error_status || self.options.content_on_error;

        if save_body {
            match writer_session.decide(status, response.last_modified()) {
                Ok(SaveDecision::SkipNotModified) => {
                    debug!(url = %url, "not modified, keeping local file");
                }
                Ok(SaveDecision::SkipLocalNewer) => {
                    debug!(url = %url, "local file newer, skipping download");
                }
                Ok(decision) => match writer_session.open(&decision) {
                    Ok(mut file) => {
                        let copy_result = response.body.copy_to(&mut file);
                        drop(file);
                        let save_result = copy_result.map_err(|e| e.to_string()).and_then(|_| {
                            writer_session
                                .finish(response.last_modified())
                                .map_err(|e| e.to_string())
                        });
                        match save_result {
                            Ok(_) => {
                                saved_filename = Some(
                                    writer_session.path().to_string_lossy().into_owned(),
                                );
                                self.stats.add_file(response.body.len());
                            }
                            Err(save_error) => {
                                error!(url = %url, error = %save_error, "disk write failed");
                                writer_session.discard();
                                if !self.options.ignore_fatal_errors {
                                    self.stop.mark_fatal();
                                }
                                self.finish_with_error(
                                    record,
                                    ErrorKind::Io(save_error),
                                    false,
                                    None,
                                )
                                .await;
                                return;
                            }
                        }
                    }
                    Err(writer_error) => {
                        error!(url = %url, error = %writer_error, "cannot open output file");
                        if !self.options.ignore_fatal_errors {
                            self.stop.mark_fatal();
                        }
                        self.finish_with_error(
                            record,
                            ErrorKind::Io(writer_error.to_string()),
                            false,
                            None,
                        )
                        .await;
                        return;
                    }
                },
                Err(writer_error) => {
                    // A server that ignored the Range request will ignore
                    // the next one too.
                    self.finish_with_error(
                        record,
                        ErrorKind::Protocol(writer_error.to_string()),
                        false,
                        None,
                    )
                    .await;
                    return;
                }
            }
        }

        let response_info = ResponseInfo {
            status,
            body_len: response.body.len(),
            filename: saved_filename.clone(),
        };
        match self.hooks.handle_response(record, &response_info) {
            HookAction::Stop => {
                self.stop.request_graceful();
            }
            HookAction::Retry => {
                self.requeue(record, "retry requested by hook").await;
                return;
            }
            _ => {}
        }

        // Scrape phase, on the final URL so relative links resolve right.
        let mut children: Vec<NewUrl> = Vec::new();
        let content_type = response.content_type();
        let scrape_base = response.final_url.clone();

        if (!is_error_status || self.options.content_on_error)
            && self
                .scraper
                .wants(&scrape_base, content_type.as_deref(), record.link_type)
        {
            match response.body.to_vec() {
                Ok(bytes) => {
                    let links = self.scraper.scrape(
                        &scrape_base,
                        content_type.as_deref(),
                        record.link_type,
                        &bytes,
                    );
                    children = self.child_records(record, links);
                }
                Err(io_error) => {
                    warn!(url = %url, error = %io_error, "could not read body for scraping");
                }
            }
        }

        for hook_url in self.hooks.get_urls(record, saved_filename.as_deref()) {
            if let Ok(info) = UrlInfo::parse(&hook_url.url) {
                children.push(NewUrl {
                    url: info.fetch_url().to_string(),
                    url_key: info.key().to_string(),
                    parent_url: Some(record.url.clone()),
                    root_url: record.root_url.clone(),
                    level: record.level + 1,
                    inline_level: if hook_url.inline {
                        record.inline_level + 1
                    } else {
                        0
                    },
                    link_type: None,
                    post_data: hook_url.post_data,
                    referer: Some(record.url.clone()),
                });
            }
        }

        self.enqueue(children).await;

        let final_status = if is_error_status {
            self.stats.mark_error();
            Status::Error
        } else {
            self.stats.mark_done();
            Status::Done
        };

        self.check_in_terminal(
            record,
            final_status,
            CheckIn {
                increment_try_count: true,
                status_code: Some(status),
                filename: saved_filename,
                error: is_error_status.then(|| format!("HTTP {status}")),
            },
        );
    }

    /// Turn extracted links into frontier rows, requisites first, applying
    /// the filter chain so out-of-policy children never enter the queue.
    fn child_records(
        &self,
        parent: &UrlRecord,
        links: Vec<crate::scrape::ExtractedLink>,
    ) -> Vec<NewUrl> {
        let mut requisites = Vec::new();
        let mut linked = Vec::new();

        for link in links {
            let inline = link.kind.is_inline();
            let candidate = UrlRecord {
                id: 0,
                url: link.url.fetch_url().to_string(),
                url_key: link.url.key().to_string(),
                parent_url: Some(parent.url.clone()),
                root_url: if parent.root_url.is_empty() {
                    parent.url.clone()
                } else {
                    parent.root_url.clone()
                },
                status: Status::Todo,
                try_count: 0,
                level: parent.level + 1,
                inline_level: if inline { parent.inline_level + 1 } else { 0 },
                link_type: link.link_type,
                post_data: None,
                referer: Some(parent.url.clone()),
                status_code: None,
                filename: None,
                last_error: None,
                discovered_at: chrono::Utc::now(),
                completed_at: None,
            };

            if !self.filters.test(&link.url, &candidate).verdict {
                continue;
            }

            let new_url = NewUrl {
                url: candidate.url,
                url_key: candidate.url_key,
                parent_url: candidate.parent_url,
                root_url: candidate.root_url,
                level: candidate.level,
                inline_level: candidate.inline_level,
                link_type: candidate.link_type,
                post_data: None,
                referer: candidate.referer,
            };

            if link.kind == LinkKind::SitemapEntry || !inline {
                linked.push(new_url);
            } else {
                requisites.push(new_url);
            }
        }

        // Requisites first so a saved page is renderable as soon as
        // possible.
        requisites.extend(linked);
        requisites
    }

    async fn enqueue(&self, children: Vec<NewUrl>) {
        if children.is_empty() {
            return;
        }
        match self.frontier.add_many(&children) {
            Ok(added) => {
                if added > 0 {
                    debug!(count = added, "enqueued children");
                    self.stats.add_queued(added as u64);
                    for child in &children {
                        if let Ok(url) = UrlInfo::parse(&child.url) {
                            self.hooks.queued_url(&url);
                        }
                    }
                }
            }
            Err(db_error) => {
                error!(error = %db_error, "enqueue failed");
                if !self.options.ignore_fatal_errors {
                    self.stop.mark_fatal();
                }
            }
        }
    }

    /// Resolve robots permission, fetching robots.txt if the cache is cold.
    async fn check_robots(
        &self,
        url: &UrlInfo,
        record: &UrlRecord,
    ) -> Result<bool, ErrorKind> {
        loop {
            match self.robots.evaluate(url) {
                RobotsCheck::Decided(allowed) => return Ok(allowed),
                RobotsCheck::Unavailable => return Err(ErrorKind::RobotsUnavailable),
                RobotsCheck::NeedsFetch(robots_url) => {
                    debug!(url = %robots_url, "fetching robots.txt");
                    let request = FetchRequest::get(robots_url.clone());
                    let outcome = self
                        .fetcher
                        .fetch(&request, self.recorder.as_ref(), Some(&self.frontier))
                        .await;

                    let result = match outcome {
                        FetchOutcome::Completed(mut response) => {
                            if response.is_success() {
                                let body = response.body.to_vec().unwrap_or_default();
                                let text = String::from_utf8_lossy(&body).into_owned();
                                if self.options.sitemaps {
                                    self.enqueue_robots_sitemaps(&text, record).await;
                                }
                                RobotsFetchResult::Fetched(text)
                            } else if response.status >= 500 {
                                RobotsFetchResult::ServerError
                            } else {
                                RobotsFetchResult::NotFound
                            }
                        }
                        FetchOutcome::Retryable(_) | FetchOutcome::Fatal(_) => {
                            RobotsFetchResult::NetworkError
                        }
                    };

                    match self.robots.load(&robots_url, result) {
                        RobotsCheck::Decided(allowed) => return Ok(allowed),
                        RobotsCheck::Unavailable => return Err(ErrorKind::RobotsUnavailable),
                        RobotsCheck::NeedsFetch(_) => continue,
                    }
                }
            }
        }
    }

    async fn enqueue_robots_sitemaps(&self, robots_body: &str, record: &UrlRecord) {
        let children: Vec<NewUrl> = crate::scrape::sitemaps_in_robots(robots_body)
            .into_iter()
            .filter_map(|raw| UrlInfo::parse(&raw).ok())
            .map(|info| NewUrl {
                url: info.fetch_url().to_string(),
                url_key: info.key().to_string(),
                parent_url: Some(record.url.clone()),
                root_url: record.root_url.clone(),
                level: record.level,
                inline_level: 0,
                link_type: Some(LinkType::Sitemap),
                post_data: None,
                referer: None,
            })
            .collect();
        self.enqueue(children).await;
    }

    async fn bump_host_backoff(&self, url: &UrlInfo) {
        let host_state = self.host_state(url.host());
        let mut host = host_state.lock().await;
        host.waiter.increment();
    }

    /// Route an error through the hooks, then requeue or finalize.
    ///
    /// `retryable` is the fetcher's classification (it owns the retry
    /// policy, including `--retry-connrefused`/`--retry-dns-error`); the
    /// engine only enforces the try budget on top of it.
    async fn finish_with_error(
        &self,
        record: &UrlRecord,
        kind: ErrorKind,
        retryable: bool,
        writer_session: Option<&crate::writer::WriterSession>,
    ) {
        if let Some(session) = writer_session {
            session.discard();
        }

        self.stats.add_error(kind.class());

        let action = self.hooks.handle_error(record, &kind.to_string());
        match action {
            HookAction::Stop => {
                self.stop.request_graceful();
                self.requeue(record, &kind.to_string()).await;
                return;
            }
            HookAction::Finish => {
                self.stats.mark_done();
                self.check_in_terminal(
                    record,
                    Status::Done,
                    CheckIn {
                        increment_try_count: true,
                        ..CheckIn::default()
                    },
                );
                return;
            }
            HookAction::Retry => {
                self.requeue(record, &kind.to_string()).await;
                return;
            }
            HookAction::Normal => {}
        }

        let next_try = record.try_count + 1;
        let budget_left = self.options.tries == 0 || next_try < self.options.tries;

        if retryable && budget_left {
            debug!(url = %record.url, try_count = next_try, error = %kind, "requeueing");
            self.requeue(record, &kind.to_string()).await;
        } else {
            warn!(url = %record.url, error = %kind, "giving up");
            self.stats.mark_error();
            self.check_in_terminal(
                record,
                Status::Error,
                CheckIn {
                    increment_try_count: true,
                    error: Some(kind.to_string()),
                    ..CheckIn::default()
                },
            );
        }
    }

    /// Back to TODO with the try counter bumped.
    async fn requeue(&self, record: &UrlRecord, reason: &str) {
        let result = self.frontier.check_in(
            &record.url_key,
            Status::Todo,
            &CheckIn {
                increment_try_count: true,
                error: Some(reason.to_string()),
                ..CheckIn::default()
            },
        );
        if let Err(db_error) = result {
            error!(error = %db_error, "requeue failed");
            if !self.options.ignore_fatal_errors {
                self.stop.mark_fatal();
            }
        }
    }

    fn check_in_terminal(&self, record: &UrlRecord, status: Status, fields: CheckIn) {
        if let Err(db_error) = self.frontier.check_in(&record.url_key, status, &fields) {
            error!(error = %db_error, "frontier check-in failed");
            if !self.options.ignore_fatal_errors {
                self.stop.mark_fatal();
            }
        }
    }
}
