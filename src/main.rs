use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use webarc::{cli, warc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "webarc=debug"
    } else if cli::is_quiet() {
        "webarc=warn"
    } else {
        "webarc=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // With WARC output the crawl log is also captured into a buffer that
    // becomes the archive's final resource record.
    let log_buffer = cli::wants_warc().then(warc::LogBuffer::new);

    let capture_layer = log_buffer.clone().map(|buffer| {
        tracing_subscriber::fmt::layer()
            .with_writer(buffer)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::INFO)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(capture_layer)
        .init();

    // Run the crawl and propagate its exit code.
    let code = cli::run(log_buffer).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
