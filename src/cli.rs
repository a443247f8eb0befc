//! Command-line interface and crawl assembly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use console::style;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{parse_header, parse_seconds, parse_size, Config};
use crate::cookies::CookieJar;
use crate::engine::{Engine, EngineOptions, StopHandle};
use crate::fetch::{build_client, ClientOptions, Fetcher, FetcherOptions, SecureProtocol};
use crate::filters::{
    DirectoriesFilter, DomainsFilter, FilenameSuffixFilter, FilterChain, HostnamesFilter,
    HttpsOnlyFilter, LevelFilter, ParentFilter, QuotaFilter, RecursiveFilter, RegexFilter,
    SchemeFilter, SpanHostsAllow, SpanHostsFilter, TriesFilter, UrlFilter,
};
use crate::frontier::Frontier;
use crate::hooks::HookRegistry;
use crate::robots::RobotsCache;
use crate::scrape::ScrapeDispatcher;
use crate::stats::{ErrorClass, Statistics};
use crate::urlnorm::UrlInfo;
use crate::warc::{LogBuffer, WarcOptions, WarcRecorder};
use crate::writer::{ClobberMode, DirectoryPolicy, RestrictModes, Writer, WriterOptions};

#[derive(Parser)]
#[command(name = "webarc")]
#[command(about = "Recursive web archiver with WARC output and a resumable crawl queue")]
#[command(version)]
pub struct Cli {
    /// Seed URLs to crawl
    #[arg(required = true)]
    urls: Vec<String>,

    // --- Recursion -------------------------------------------------------
    /// Follow links in downloaded documents
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Maximum recursion depth (0 = unlimited)
    #[arg(short = 'l', long, default_value = "5")]
    level: u32,

    /// Also download page requisites (images, stylesheets, scripts)
    #[arg(short = 'p', long)]
    page_requisites: bool,

    /// Separate recursion budget for page requisites
    #[arg(long, default_value = "5")]
    page_requisites_level: u32,

    /// Follow links to other hosts
    #[arg(short = 'H', long)]
    span_hosts: bool,

    /// Families allowed off-host: page-requisites, linked-pages
    #[arg(long, value_delimiter = ',')]
    span_hosts_allow: Vec<String>,

    /// Only follow hosts with these domain suffixes
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// Never follow hosts with these domain suffixes
    #[arg(long, value_delimiter = ',')]
    exclude_domains: Vec<String>,

    /// Only follow these exact hostnames
    #[arg(long, value_delimiter = ',')]
    hostnames: Vec<String>,

    /// Never follow these exact hostnames
    #[arg(long, value_delimiter = ',')]
    exclude_hostnames: Vec<String>,

    /// Only download filenames matching these suffixes/globs
    #[arg(short = 'A', long, value_delimiter = ',')]
    accept: Vec<String>,

    /// Skip filenames matching these suffixes/globs
    #[arg(short = 'R', long, value_delimiter = ',')]
    reject: Vec<String>,

    /// Only download URLs matching this regex
    #[arg(long)]
    accept_regex: Option<String>,

    /// Skip URLs matching this regex
    #[arg(long)]
    reject_regex: Option<String>,

    /// Only follow paths inside these directories
    #[arg(short = 'I', long, value_delimiter = ',')]
    include_directories: Vec<String>,

    /// Never follow paths inside these directories
    #[arg(short = 'X', long, value_delimiter = ',')]
    exclude_directories: Vec<String>,

    /// Do not ascend above the seed directory
    #[arg(long)]
    no_parent: bool,

    /// Only these HTML tags contribute followed links
    #[arg(long, value_delimiter = ',')]
    follow_tags: Vec<String>,

    /// HTML tags whose links are ignored
    #[arg(long, value_delimiter = ',')]
    ignore_tags: Vec<String>,

    /// Discover URLs through sitemaps announced in robots.txt
    #[arg(long)]
    sitemaps: bool,

    /// Only fetch HTTPS URLs
    #[arg(long)]
    https_only: bool,

    // --- Timing & retries ------------------------------------------------
    /// Seconds to wait between requests to one host
    #[arg(short = 'w', long, default_value = "0")]
    wait: String,

    /// Randomly perturb the wait time (0.5x to 1.5x)
    #[arg(long)]
    random_wait: bool,

    /// Cap in seconds for retry backoff
    #[arg(long, default_value = "10")]
    waitretry: String,

    /// Timeout in seconds applied to DNS, connect and read phases
    #[arg(short = 'T', long)]
    timeout: Option<String>,

    /// DNS resolution timeout in seconds (folds into the connect phase)
    #[arg(long)]
    dns_timeout: Option<String>,

    /// TCP connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<String>,

    /// Socket read timeout in seconds
    #[arg(long)]
    read_timeout: Option<String>,

    /// Whole-exchange timeout in seconds
    #[arg(long)]
    session_timeout: Option<String>,

    /// Download rate cap, bytes per second (k/m suffixes allowed)
    #[arg(long)]
    limit_rate: Option<String>,

    /// Attempts per URL before giving up (0 = unlimited)
    #[arg(short = 't', long, default_value = "20")]
    tries: u32,

    /// Treat "connection refused" as retryable
    #[arg(long)]
    retry_connrefused: bool,

    /// Treat DNS failures as retryable
    #[arg(long)]
    retry_dns_error: bool,

    /// Stop after this many downloaded bytes (k/m/g suffixes allowed)
    #[arg(short = 'Q', long)]
    quota: Option<String>,

    /// Concurrent downloads
    #[arg(long, default_value = "1")]
    concurrent: usize,

    // --- Output ----------------------------------------------------------
    /// Directory to save files under
    #[arg(short = 'P', long, default_value = ".")]
    directory_prefix: PathBuf,

    /// Save all files directly into the prefix
    #[arg(long)]
    no_directories: bool,

    /// Always create the full directory hierarchy
    #[arg(long)]
    force_directories: bool,

    /// Omit the hostname directory
    #[arg(long)]
    no_host_directories: bool,

    /// Prepend a scheme directory (http/https)
    #[arg(long)]
    protocol_directories: bool,

    /// Drop this many leading path components
    #[arg(long, default_value = "0")]
    cut_dirs: u32,

    /// Filename restrictions: unix,windows,nocontrol,ascii,lowercase,uppercase
    #[arg(long)]
    restrict_file_names: Option<String>,

    /// Longest filename component to generate
    #[arg(long, default_value = "160")]
    max_filename_length: usize,

    /// Never overwrite: number colliding files .1, .2, ...
    #[arg(long, conflicts_with_all = ["continue_", "timestamping"])]
    no_clobber: bool,

    /// Resume partial downloads with Range requests
    #[arg(short = 'c', long = "continue", conflicts_with = "timestamping")]
    continue_: bool,

    /// Skip downloads when the local file is as new as the server's
    #[arg(short = 'N', long)]
    timestamping: bool,

    /// Delete each file once it has been processed
    #[arg(long)]
    delete_after: bool,

    /// Write every body to this one file
    #[arg(short = 'O', long)]
    output_document: Option<PathBuf>,

    // --- WARC ------------------------------------------------------------
    /// Record the crawl into PREFIX.warc.gz
    #[arg(long, value_name = "PREFIX")]
    warc_file: Option<PathBuf>,

    /// Append to an existing WARC file instead of overwriting
    #[arg(long)]
    warc_append: bool,

    /// Start a new WARC file once the current one reaches this size
    #[arg(long)]
    warc_max_size: Option<String>,

    /// Write revisit records for payloads already archived
    #[arg(long)]
    warc_dedup: bool,

    /// Maintain a CDX index alongside the WARC
    #[arg(long)]
    warc_cdx: bool,

    /// Extra warcinfo field, NAME: VALUE (repeatable)
    #[arg(long, value_name = "HEADER")]
    warc_header: Vec<String>,

    /// Store records uncompressed
    #[arg(long)]
    no_warc_compression: bool,

    /// Skip SHA-1 digests in WARC records
    #[arg(long)]
    no_warc_digests: bool,

    /// Directory for spooling record bodies
    #[arg(long)]
    warc_tempdir: Option<PathBuf>,

    /// Move finished WARC/CDX files into this directory
    #[arg(long)]
    warc_move: Option<PathBuf>,

    // --- Protocol --------------------------------------------------------
    /// User-Agent header
    #[arg(short = 'U', long)]
    user_agent: Option<String>,

    /// Extra request header, NAME: VALUE (repeatable)
    #[arg(long, value_name = "HEADER")]
    header: Vec<String>,

    /// Referer header for seed requests
    #[arg(long)]
    referer: Option<String>,

    /// Send seeds as POST with this body
    #[arg(long, conflicts_with = "post_file")]
    post_data: Option<String>,

    /// Send seeds as POST with this file as body
    #[arg(long)]
    post_file: Option<PathBuf>,

    /// Close the connection after every request
    #[arg(long)]
    no_http_keep_alive: bool,

    /// Ask for and decode gzip/brotli transfer compression
    #[arg(long)]
    http_compression: bool,

    /// Maximum redirect hops per request
    #[arg(long, default_value = "20")]
    max_redirect: u32,

    /// Do not let redirect targets bypass the host filters
    #[arg(long = "no-strong-redirects", action = clap::ArgAction::SetFalse)]
    strong_redirects: bool,

    /// Ignore robots.txt
    #[arg(long = "no-robots", action = clap::ArgAction::SetFalse)]
    robots: bool,

    /// Keep response bodies of 4xx/5xx answers
    #[arg(long)]
    content_on_error: bool,

    /// Ignore the Content-Length header
    #[arg(long)]
    ignore_length: bool,

    /// Keep crawling after disk or database errors
    #[arg(long)]
    ignore_fatal_errors: bool,

    // --- Cookies ---------------------------------------------------------
    /// Disable the cookie jar
    #[arg(long = "no-cookies", action = clap::ArgAction::SetFalse)]
    cookies: bool,

    /// Load cookies from a cookies.txt file
    #[arg(long)]
    load_cookies: Option<PathBuf>,

    /// Save cookies to a cookies.txt file at exit
    #[arg(long)]
    save_cookies: Option<PathBuf>,

    /// Persist session cookies too
    #[arg(long)]
    keep_session_cookies: bool,

    // --- TLS -------------------------------------------------------------
    /// TLS floor: auto, TLSv1_2, TLSv1_3
    #[arg(long, default_value = "auto")]
    secure_protocol: String,

    /// Skip TLS certificate verification
    #[arg(long = "no-check-certificate", action = clap::ArgAction::SetFalse)]
    check_certificate: bool,

    /// Client certificate (PEM)
    #[arg(long)]
    certificate: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Extra trusted CA certificate (PEM)
    #[arg(long)]
    ca_certificate: Option<PathBuf>,

    /// Directory of extra trusted CA certificates (PEM files)
    #[arg(long)]
    ca_directory: Option<PathBuf>,

    /// Local address to bind sockets to
    #[arg(long)]
    bind_address: Option<std::net::IpAddr>,

    // --- Misc ------------------------------------------------------------
    /// Crawl state database file
    #[arg(long, default_value = "webarc.db")]
    database: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

/// Check if quiet mode is enabled (for early logging setup).
pub fn is_quiet() -> bool {
    std::env::args().any(|arg| arg == "-q" || arg == "--quiet")
}

/// Check if a WARC file was requested (the log capture layer needs to exist
/// before the subscriber is installed).
pub fn wants_warc() -> bool {
    std::env::args().any(|arg| arg == "--warc-file" || arg.starts_with("--warc-file="))
}

/// Parse arguments, run the crawl, and return the process exit code.
pub async fn run(log_buffer: Option<LogBuffer>) -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let seeds = parse_seeds(&cli.urls)?;
    let config = build_config(&cli).map_err(|e| anyhow::anyhow!(e))?;

    run_crawl(cli, config, seeds, log_buffer).await
}

fn parse_seeds(urls: &[String]) -> anyhow::Result<Vec<UrlInfo>> {
    let mut seeds = Vec::with_capacity(urls.len());
    for raw in urls {
        // Bare hostnames are accepted the way downloaders traditionally do.
        let candidate = if raw.contains("://") {
            raw.clone()
        } else {
            format!("http://{raw}")
        };
        let info = UrlInfo::parse(&candidate)
            .with_context(|| format!("invalid seed URL {raw:?}"))?;
        seeds.push(info);
    }
    Ok(seeds)
}

fn build_config(cli: &Cli) -> Result<Config, String> {
    let timeout = cli.timeout.as_deref().map(parse_seconds).transpose()?;
    let connect_timeout = cli
        .connect_timeout
        .as_deref()
        .map(parse_seconds)
        .transpose()?
        .or(timeout)
        .unwrap_or(Duration::from_secs(30));
    // No separate resolver phase: the DNS budget rides on the connect
    // timeout.
    let dns_timeout = cli
        .dns_timeout
        .as_deref()
        .map(parse_seconds)
        .transpose()?;
    let connect_timeout = match dns_timeout {
        Some(dns) => connect_timeout.max(dns),
        None => connect_timeout,
    };
    let read_timeout = cli
        .read_timeout
        .as_deref()
        .map(parse_seconds)
        .transpose()?
        .or(timeout)
        .unwrap_or(Duration::from_secs(30));
    let session_timeout = cli
        .session_timeout
        .as_deref()
        .map(parse_seconds)
        .transpose()?;

    let secure_protocol = SecureProtocol::parse(&cli.secure_protocol)
        .ok_or_else(|| format!("unknown --secure-protocol {:?}", cli.secure_protocol))?;

    let user_agent = cli
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("webarc/{}", env!("CARGO_PKG_VERSION")));

    let custom_headers = cli
        .header
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>, _>>()?;

    let restrict = match &cli.restrict_file_names {
        Some(spec) => RestrictModes::parse(spec)
            .ok_or_else(|| format!("unknown --restrict-file-names {spec:?}"))?,
        None => RestrictModes::default(),
    };

    let clobber = if cli.no_clobber {
        ClobberMode::NoClobber
    } else if cli.continue_ {
        ClobberMode::Continue
    } else if cli.timestamping {
        ClobberMode::Timestamping
    } else {
        ClobberMode::Overwrite
    };

    let warc = match &cli.warc_file {
        Some(prefix) => Some(WarcOptions {
            prefix: prefix.clone(),
            compress: !cli.no_warc_compression,
            digests: !cli.no_warc_digests,
            appending: cli.warc_append,
            cdx: cli.warc_cdx,
            dedup: cli.warc_dedup,
            max_size: cli
                .warc_max_size
                .as_deref()
                .map(parse_size)
                .transpose()?,
            move_to: cli.warc_move.clone(),
            temp_dir: cli.warc_tempdir.clone(),
            extra_fields: cli
                .warc_header
                .iter()
                .map(|h| parse_header(h))
                .collect::<Result<Vec<_>, _>>()?,
            software: format!("webarc/{}", env!("CARGO_PKG_VERSION")),
            log: true,
        }),
        None => None,
    };

    Ok(Config {
        database: cli.database.clone(),
        engine: EngineOptions {
            concurrent: cli.concurrent.max(1),
            tries: cli.tries,
            quota: cli.quota.as_deref().map(parse_size).transpose()?.unwrap_or(0),
            robots_enabled: cli.robots,
            sitemaps: cli.sitemaps,
            wait: parse_seconds(&cli.wait)?,
            random_wait: cli.random_wait,
            waitretry: parse_seconds(&cli.waitretry)?,
            strong_redirects: cli.strong_redirects,
            content_on_error: cli.content_on_error,
            ignore_fatal_errors: cli.ignore_fatal_errors,
        },
        client: ClientOptions {
            user_agent: user_agent.clone(),
            connect_timeout,
            read_timeout,
            session_timeout,
            pool_per_host: cli.concurrent.max(1),
            pool_idle_timeout: Duration::from_secs(60),
            keep_alive: !cli.no_http_keep_alive,
            http_compression: cli.http_compression,
            secure_protocol,
            check_certificate: cli.check_certificate,
            certificate: cli.certificate.clone(),
            private_key: cli.private_key.clone(),
            ca_certificate: cli.ca_certificate.clone(),
            ca_directory: cli.ca_directory.clone(),
            bind_address: cli.bind_address,
        },
        fetcher: FetcherOptions {
            user_agent,
            custom_headers,
            default_referer: cli.referer.clone(),
            max_redirects: cli.max_redirect,
            limit_rate: cli.limit_rate.as_deref().map(parse_size).transpose()?,
            ignore_length: cli.ignore_length,
            http_compression: cli.http_compression,
            retry_connrefused: cli.retry_connrefused,
            retry_dns_error: cli.retry_dns_error,
            temp_dir: cli.warc_tempdir.clone(),
        },
        writer: WriterOptions {
            prefix: cli.directory_prefix.clone(),
            directories: DirectoryPolicy {
                no_directories: cli.no_directories,
                force_directories: cli.force_directories,
                no_host_directories: cli.no_host_directories,
                protocol_directories: cli.protocol_directories,
                cut_dirs: cli.cut_dirs,
            },
            restrict,
            max_filename_length: cli.max_filename_length,
            clobber,
            delete_after: cli.delete_after,
            output_document: cli.output_document.clone(),
        },
        warc,
        cookies_enabled: cli.cookies,
        load_cookies: cli.load_cookies.clone(),
        save_cookies: cli.save_cookies.clone(),
        keep_session_cookies: cli.keep_session_cookies,
    })
}

async fn run_crawl(
    cli: Cli,
    config: Config,
    seeds: Vec<UrlInfo>,
    log_buffer: Option<LogBuffer>,
) -> anyhow::Result<i32> {
    let stats = Arc::new(Statistics::new());

    let frontier = Arc::new(
        Frontier::open(&config.database)
            .with_context(|| format!("opening frontier database {:?}", config.database))?,
    );

    // Cookie jar.
    let cookies = if config.cookies_enabled {
        let mut jar = CookieJar::new();
        if let Some(path) = &config.load_cookies {
            let loaded = jar
                .load_cookies_txt(path)
                .with_context(|| format!("loading cookies from {path:?}"))?;
            info!(count = loaded, file = %path.display(), "cookies loaded");
        }
        Some(Arc::new(Mutex::new(jar)))
    } else {
        None
    };

    // WARC recorder.
    let recorder = match &config.warc {
        Some(options) => Some(Arc::new(
            WarcRecorder::new(options.clone(), log_buffer).context("opening WARC output")?,
        )),
        None => None,
    };

    // Post data for seeds.
    let mut post_data = cli.post_data.clone();
    if let Some(path) = &cli.post_file {
        post_data = Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading --post-file {path:?}"))?,
        );
    }

    // Filter chain in evaluation order.
    let mut filters: Vec<Box<dyn UrlFilter>> = vec![
        Box::new(SchemeFilter::default()),
        Box::new(RecursiveFilter::new(cli.recursive, cli.page_requisites)),
        Box::new(LevelFilter::new(
            if cli.recursive { cli.level } else { 0 },
            cli.page_requisites_level,
        )),
        Box::new(TriesFilter::new(cli.tries)),
        Box::new(SpanHostsFilter::new(
            &seeds,
            cli.span_hosts,
            &parse_span_allow(&cli.span_hosts_allow)?,
        )),
    ];
    if !cli.domains.is_empty() || !cli.exclude_domains.is_empty() {
        filters.push(Box::new(DomainsFilter::new(
            cli.domains.clone(),
            cli.exclude_domains.clone(),
        )));
    }
    if !cli.hostnames.is_empty() || !cli.exclude_hostnames.is_empty() {
        filters.push(Box::new(HostnamesFilter::new(
            cli.hostnames.clone(),
            cli.exclude_hostnames.clone(),
        )));
    }
    if cli.accept_regex.is_some() || cli.reject_regex.is_some() {
        let accept = cli
            .accept_regex
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .context("--accept-regex")?;
        let reject = cli
            .reject_regex
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .context("--reject-regex")?;
        filters.push(Box::new(RegexFilter::new(accept, reject)));
    }
    if !cli.include_directories.is_empty() || !cli.exclude_directories.is_empty() {
        filters.push(Box::new(DirectoriesFilter::new(
            cli.include_directories.clone(),
            cli.exclude_directories.clone(),
        )));
    }
    if !cli.accept.is_empty() || !cli.reject.is_empty() {
        filters.push(Box::new(FilenameSuffixFilter::new(
            cli.accept.clone(),
            cli.reject.clone(),
        )));
    }
    if cli.no_parent {
        filters.push(Box::new(ParentFilter));
    }
    if cli.https_only {
        filters.push(Box::new(HttpsOnlyFilter));
    }
    if config.engine.quota > 0 {
        filters.push(Box::new(QuotaFilter::new(
            Arc::clone(&stats),
            config.engine.quota,
        )));
    }
    let filters = Arc::new(FilterChain::new(filters));

    // HTTP stack.
    let client = build_client(&config.client).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let fetcher = Arc::new(Fetcher::new(
        client,
        config.fetcher.clone(),
        cookies.clone(),
        Arc::clone(&stats),
    ));

    let writer = Arc::new(Writer::new(config.writer.clone()));
    let scraper = Arc::new(ScrapeDispatcher::new(
        (!cli.follow_tags.is_empty()).then(|| cli.follow_tags.clone()),
        cli.ignore_tags.clone(),
    ));
    let robots = Arc::new(RobotsCache::new(&config.fetcher.user_agent));
    let hooks = Arc::new(HookRegistry::new());

    let stop = StopHandle::new();
    let engine = Arc::new(Engine::new(
        frontier,
        filters,
        fetcher,
        writer,
        scraper,
        robots,
        recorder.clone(),
        hooks.clone(),
        Arc::clone(&stats),
        config.engine.clone(),
        stop.clone(),
    ));

    // Seeds, with POST data when requested.
    let seeded = engine.seed(&seeds, post_data.as_deref())?;

    // Ctrl-C: first graceful, second immediate.
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!(
                    "{} stopping gracefully; press Ctrl-C again to abort",
                    style("!").yellow()
                );
                stop.request_graceful();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} aborting in-flight downloads", style("!").red());
                stop.request_immediate();
            }
        });
    }

    info!(seeds = seeds.len(), added = seeded, "starting crawl");

    // Live progress line while the engine runs.
    let progress = (!cli.quiet).then(|| {
        let bar = indicatif::ProgressBar::new_spinner();
        bar.set_style(
            indicatif::ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("static template"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        let bar_handle = bar.clone();
        let stats = Arc::clone(&stats);
        let ticker = tokio::spawn(async move {
            loop {
                bar_handle.set_message(format!(
                    "{} done, {} queued, {} bytes ({}/s)",
                    stats.done(),
                    stats.urls_queued().saturating_sub(stats.urls_dequeued()),
                    stats.bytes_downloaded(),
                    human_rate(stats.bytes_downloaded(), stats.duration()),
                ));
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        (bar, ticker)
    });

    let run_result = Arc::clone(&engine).run().await;

    if let Some((bar, ticker)) = progress {
        ticker.abort();
        bar.finish_and_clear();
    }

    // Shutdown bookkeeping, even after an engine error.
    if let Some(jar) = &cookies {
        if let Some(path) = &config.save_cookies {
            let jar = jar.lock().await;
            if let Err(cookie_error) = jar.save_cookies_txt(path, config.keep_session_cookies) {
                warn!(error = %cookie_error, "could not save cookies");
            }
        }
    }
    if let Some(recorder) = &recorder {
        if let Err(warc_error) = recorder.close() {
            warn!(error = %warc_error, "could not close WARC output cleanly");
        }
    }

    run_result?;

    if let Ok(snapshot) = serde_json::to_string(&stats.snapshot()) {
        tracing::debug!(stats = %snapshot, "final statistics");
    }
    print_summary(&stats);

    let code = exit_code(&stats, &stop);
    Ok(hooks.exit_status(code))
}

fn parse_span_allow(values: &[String]) -> anyhow::Result<Vec<SpanHostsAllow>> {
    values
        .iter()
        .map(|value| match value.as_str() {
            "page-requisites" => Ok(SpanHostsAllow::PageRequisites),
            "linked-pages" => Ok(SpanHostsAllow::LinkedPages),
            other => bail!("unknown --span-hosts-allow value {other:?}"),
        })
        .collect()
}

fn print_summary(stats: &Statistics) {
    let duration = stats.duration();
    println!();
    println!(
        "{} {} files, {} bytes in {:.1}s ({}/s)",
        style("✓").green(),
        stats.files_saved(),
        stats.bytes_downloaded(),
        duration.as_secs_f64(),
        human_rate(stats.bytes_downloaded(), duration),
    );
    println!(
        "  queued {}  done {}  errors {}  skipped {}",
        stats.urls_queued(),
        stats.done(),
        stats.errored(),
        stats.skipped(),
    );
}

fn human_rate(bytes: u64, duration: Duration) -> String {
    let secs = duration.as_secs_f64().max(0.001);
    let rate = bytes as f64 / secs;
    if rate >= 1024.0 * 1024.0 {
        format!("{:.1}M", rate / (1024.0 * 1024.0))
    } else if rate >= 1024.0 {
        format!("{:.1}k", rate / 1024.0)
    } else {
        format!("{rate:.0}")
    }
}

/// Exit code per the documented contract: 1 fatal, 6 TLS, 7 authentication,
/// 8 server error responses, 4 network errors, 0 clean.
fn exit_code(stats: &Statistics, stop: &StopHandle) -> i32 {
    if stop.had_fatal_error() {
        1
    } else if stats.error_count(ErrorClass::Ssl) > 0 {
        6
    } else if stats.error_count(ErrorClass::Authentication) > 0 {
        7
    } else if stats.error_count(ErrorClass::Server) > 0 {
        8
    } else if stats.error_count(ErrorClass::Network) > 0 {
        4
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_seeds_adds_scheme() {
        let seeds = parse_seeds(&["example.com".to_string()]).unwrap();
        assert_eq!(seeds[0].fetch_url(), "http://example.com/");
        assert!(parse_seeds(&["ftp://example.com/".to_string()]).is_err());
    }

    #[test]
    fn test_exit_code_priority() {
        let stats = Statistics::new();
        let stop = StopHandle::new();
        assert_eq!(exit_code(&stats, &stop), 0);

        stats.add_error(ErrorClass::Network);
        assert_eq!(exit_code(&stats, &stop), 4);

        stats.add_error(ErrorClass::Server);
        assert_eq!(exit_code(&stats, &stop), 8);

        stats.add_error(ErrorClass::Ssl);
        assert_eq!(exit_code(&stats, &stop), 6);

        stop.request_graceful();
        assert_eq!(exit_code(&stats, &stop), 6);
    }

    #[test]
    fn test_build_config_defaults() {
        let cli = Cli::parse_from(["webarc", "http://example.com/"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.engine.concurrent, 1);
        assert_eq!(config.engine.tries, 20);
        assert!(config.engine.robots_enabled);
        assert!(config.engine.strong_redirects);
        assert!(config.warc.is_none());
        assert!(config.cookies_enabled);
    }

    #[test]
    fn test_build_config_warc() {
        let cli = Cli::parse_from([
            "webarc",
            "--warc-file",
            "archive",
            "--warc-cdx",
            "--warc-dedup",
            "--warc-max-size",
            "1g",
            "--no-warc-compression",
            "http://example.com/",
        ]);
        let config = build_config(&cli).unwrap();
        let warc = config.warc.unwrap();
        assert!(!warc.compress);
        assert!(warc.cdx);
        assert!(warc.dedup);
        assert_eq!(warc.max_size, Some(1024 * 1024 * 1024));
    }

    #[test]
    fn test_negative_flags() {
        let cli = Cli::parse_from([
            "webarc",
            "--no-robots",
            "--no-check-certificate",
            "--no-cookies",
            "--no-strong-redirects",
            "http://example.com/",
        ]);
        let config = build_config(&cli).unwrap();
        assert!(!config.engine.robots_enabled);
        assert!(!config.client.check_certificate);
        assert!(!config.cookies_enabled);
        assert!(!config.engine.strong_redirects);
    }
}
