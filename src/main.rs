//! CLI entry point: flag parsing, wiring and run lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use hyper::{Method, Uri};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use plow::aggregator::Aggregator;
use plow::charts;
use plow::client;
use plow::config::{self, BodySource, ConfigError, Rate, RunConfig};
use plow::printer::{Printer, PrinterConfig};
use plow::record::RecordPool;
use plow::worker::{self, WorkerContext};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    config::parse_duration(s)
}

/// A high-performance HTTP benchmarking tool with a real-time web UI and
/// terminal display.
#[derive(Debug, Parser)]
#[command(name = "plow", version)]
struct Args {
    /// Target URL
    url: String,

    /// Number of connections to run concurrently
    #[arg(short = 'c', long, default_value_t = 1, env = "PLOW_CONCURRENCY")]
    concurrency: u64,

    /// Number of requests per second (forms: N, N/unit, N/duration, infinity)
    #[arg(long, default_value = "infinity", env = "PLOW_RATE")]
    rate: Rate,

    /// Number of requests to run (-1 means unbounded)
    #[arg(short = 'n', long, default_value_t = -1, env = "PLOW_REQUESTS")]
    requests: i64,

    /// Duration of the test (e.g. 10s, 3m)
    #[arg(short = 'd', long, value_parser = parse_duration_arg, env = "PLOW_DURATION")]
    duration: Option<Duration>,

    /// Print interval of the summary (0s prints only the final block)
    #[arg(short = 'i', long, default_value = "200ms", value_parser = parse_duration_arg, env = "PLOW_INTERVAL")]
    interval: Duration,

    /// Print durations in seconds
    #[arg(long, env = "PLOW_SECONDS")]
    seconds: bool,

    /// Print the report as one JSON object per tick
    #[arg(long, env = "PLOW_JSON")]
    json: bool,

    /// Request body, or @path to read it from a file
    #[arg(short = 'b', long, default_value = "", env = "PLOW_BODY")]
    body: String,

    /// Stream a @path body file per request instead of loading it once
    #[arg(long, env = "PLOW_STREAM")]
    stream: bool,

    /// HTTP method
    #[arg(short = 'm', long, default_value = "GET", env = "PLOW_METHOD")]
    method: String,

    /// Custom header in 'K: V' form (repeatable)
    #[arg(short = 'H', long = "header", value_parser = config::parse_header)]
    headers: Vec<(String, String)>,

    /// Override the Host header
    #[arg(long, env = "PLOW_HOST")]
    host: Option<String>,

    /// Content-Type of the request body
    #[arg(short = 'T', long = "content", env = "PLOW_CONTENT")]
    content: Option<String>,

    /// Path to the client TLS certificate (PEM)
    #[arg(long, env = "PLOW_CERT")]
    cert: Option<PathBuf>,

    /// Path to the client TLS private key (PEM)
    #[arg(long, env = "PLOW_KEY")]
    key: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long, env = "PLOW_INSECURE")]
    insecure: bool,

    /// Chart server listen address
    #[arg(long, default_value = ":18888", env = "PLOW_LISTEN")]
    listen: String,

    /// Per-request timeout covering issue and body drain
    #[arg(long, value_parser = parse_duration_arg, env = "PLOW_TIMEOUT")]
    timeout: Option<Duration>,

    /// Connection dial timeout
    #[arg(long = "dial-timeout", value_parser = parse_duration_arg, env = "PLOW_DIAL_TIMEOUT")]
    dial_timeout: Option<Duration>,

    /// Request write timeout
    #[arg(long = "req-timeout", value_parser = parse_duration_arg, env = "PLOW_REQ_TIMEOUT")]
    req_timeout: Option<Duration>,

    /// Response read timeout
    #[arg(long = "resp-timeout", value_parser = parse_duration_arg, env = "PLOW_RESP_TIMEOUT")]
    resp_timeout: Option<Duration>,

    /// SOCKS5 proxy address (ip:port)
    #[arg(long, env = "PLOW_SOCKS5")]
    socks5: Option<String>,

    /// Open the chart page in a browser after start
    #[arg(long = "auto-open-browser", env = "PLOW_AUTO_OPEN_BROWSER")]
    auto_open_browser: bool,

    /// Erase the histogram bars on the final print (default)
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "no_clean")]
    clean: bool,

    /// Keep the histogram bars on the final print
    #[arg(long = "no-clean", action = ArgAction::SetTrue, overrides_with = "clean")]
    no_clean: bool,

    /// Suppress per-tick printing, keep only the final summary
    #[arg(long, env = "PLOW_SUMMARY")]
    summary: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("plow: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), ConfigError> {
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())
        .map_err(|_| ConfigError::InvalidMethod(args.method.clone()))?;
    let url: Uri = args.url.parse().map_err(|e| ConfigError::InvalidUrl {
        url: args.url.clone(),
        message: format!("{}", e),
    })?;
    let body = build_body_source(&args)?;
    let requests = if args.requests < 0 {
        0
    } else {
        args.requests as u64
    };

    let config = RunConfig {
        url,
        method,
        headers: args.headers.clone(),
        body,
        cert_path: args.cert.clone(),
        key_path: args.key.clone(),
        insecure: args.insecure,
        concurrency: args.concurrency,
        requests,
        duration: args.duration,
        rate: args.rate,
        request_timeout: args.timeout,
        dial_timeout: args.dial_timeout,
        read_timeout: args.resp_timeout,
        write_timeout: args.req_timeout,
        socks5: args.socks5.clone(),
        host_header: args.host.clone(),
        content_type: args.content.clone(),
    };
    config.validate()?;

    let listen = charts::parse_listen_addr(&args.listen)?;
    let start = Instant::now();
    let (http_client, counters) = client::build_client(&config)?;
    let template = client::build_template(&config)?;
    let aggregator = Arc::new(Aggregator::new(start));

    let (chart_addr, chart_fut) = charts::serve(listen, aggregator.clone())?;
    tokio::spawn(chart_fut);

    let bound = match (config.requests, config.duration) {
        (0, None) => "until interrupted".to_string(),
        (0, Some(d)) => format!("for {}", config::format_duration(d)),
        (n, None) => format!("with {} request(s)", n),
        (n, Some(d)) => format!("with {} request(s) or {}", n, config::format_duration(d)),
    };
    eprintln!(
        "Benchmarking {} {} using {} connection(s).",
        args.url, bound, config.concurrency
    );
    eprintln!("Real-time charts is listening on http://{}", chart_addr);
    if args.auto_open_browser {
        charts::open_browser(&format!("http://{}", chart_addr));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            debug!("termination signal received");
            cancel.cancel();
        });
    }
    if let Some(d) = config.duration {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(d).await;
            debug!("duration elapsed");
            cancel.cancel();
        });
    }

    let (tx, rx) = mpsc::channel(config.queue_capacity());
    let pool = RecordPool::new();
    let aggregator_task = tokio::spawn({
        let aggregator = aggregator.clone();
        let pool = pool.clone();
        async move { aggregator.run(rx, pool).await }
    });
    let printer = Printer::new(PrinterConfig {
        interval: args.interval,
        json: args.json,
        seconds: args.seconds,
        clean: args.clean || !args.no_clean,
        summary_only: args.summary,
        requests: config.requests,
        duration: config.duration,
    });
    let printer_task = tokio::spawn(printer.run(aggregator.clone(), aggregator.done()));

    let ctx = WorkerContext {
        client: http_client,
        template,
        body: config.body.clone(),
        counters,
        cancel: cancel.clone(),
        limiter: worker::build_limiter(&config.rate),
        remaining: (config.requests > 0)
            .then(|| Arc::new(AtomicI64::new(config.requests as i64))),
        pool: pool.clone(),
        start,
        request_timeout: config.request_timeout,
    };
    worker::run_pool(ctx, config.concurrency, tx).await;

    // All senders are gone: the aggregator drains the queue, signals done,
    // and the printer renders the final block.
    let _ = aggregator_task.await;
    let _ = printer_task.await;
    Ok(())
}

fn build_body_source(args: &Args) -> Result<BodySource, ConfigError> {
    if args.body.is_empty() {
        return Ok(BodySource::None);
    }
    match args.body.strip_prefix('@') {
        Some(path) => {
            if args.stream {
                Ok(BodySource::File(PathBuf::from(path)))
            } else {
                let bytes = std::fs::read(path).map_err(|e| ConfigError::BodyFile {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;
                Ok(BodySource::Bytes(bytes.into()))
            }
        }
        None => Ok(BodySource::Bytes(hyper::body::Bytes::from(
            args.body.clone(),
        ))),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
