use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portsweep::optimize::{self, BenchmarkConfig, BenchmarkReport, OptimizeConfig, Recommendation};
use portsweep::ports::{self, PortRange};
use portsweep::probe::ProbeStrategy;
use portsweep::scanner::ScanDispatcher;
use portsweep::sockopt::SocketOptions;
use portsweep::timeouts::AdaptiveTimeoutEstimator;
use portsweep::types::{PortSelection, ScanReport, ScanRequest, DEFAULT_CONCURRENCY};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// portsweep — concurrent TCP connect port scanner with adaptive per-host timeouts.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portsweep",
    version,
    about = "Concurrent TCP connect port scanner with adaptive per-host timeouts.",
    long_about = None
)]
struct Cli {
    /// Host name or IP address to scan.
    host: String,

    /// Port range (`1-1024`) or list (`22,80,8000-8010`).
    #[arg(long, default_value = "1-1024", conflicts_with = "common")]
    ports: String,

    /// Quick scan of the common well-known ports.
    #[arg(long, default_value_t = false)]
    common: bool,

    /// Max concurrent probes (and open sockets).
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Per-probe connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 500)]
    timeout_ms: u64,

    /// Probe strategy: blocking or nonblocking.
    #[arg(long, default_value = "blocking")]
    strategy: ProbeStrategy,

    /// Apply tuned socket options (reuse, nodelay, keepalive) to probe sockets.
    #[arg(long, default_value_t = false)]
    advanced: bool,

    /// Derive probe timeouts from observed response times instead of --timeout-ms.
    #[arg(long, default_value_t = false)]
    adaptive: bool,

    /// Stop the scan after this many milliseconds and report what finished.
    #[arg(long = "deadline-ms")]
    deadline_ms: Option<u64>,

    /// Recommend scan settings for the host instead of scanning.
    #[arg(long, default_value_t = false, conflicts_with = "benchmark")]
    optimize: bool,

    /// Time both strategies, sequential and concurrent, over the selected ports.
    #[arg(long, default_value_t = false)]
    benchmark: bool,

    /// Scans per method when benchmarking.
    #[arg(long, default_value_t = 2)]
    iterations: usize,

    /// Write the report as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let request = build_request(&cli)?;
    let dispatcher = ScanDispatcher::new(Arc::new(AdaptiveTimeoutEstimator::default()));

    if cli.optimize {
        let rec = optimize::auto_optimize(&dispatcher, &cli.host, &OptimizeConfig::default()).await?;
        print_recommendation(&rec);
        return write_output(cli.output.as_deref(), &rec);
    }
    if cli.benchmark {
        let config = BenchmarkConfig {
            ports: request.ports.to_vec(),
            timeout: request.fixed_timeout(),
            iterations: cli.iterations,
            concurrency: request.effective_concurrency(),
        };
        let report = optimize::benchmark(&dispatcher, &cli.host, &config).await?;
        print_benchmark(&report);
        return write_output(cli.output.as_deref(), &report);
    }

    // Ctrl-C cancels the scan; whatever finished is still reported.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_ctrlc.cancel();
        }
    });

    let report = dispatcher.scan_with_cancel(&request, cancel).await?;
    print_report(&report);
    write_output(cli.output.as_deref(), &report)
}

fn write_output<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    if let Some(path) = path {
        write_json(path, value)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON report to {}", path.display());
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_request(cli: &Cli) -> Result<ScanRequest> {
    let selection = if cli.common {
        PortSelection::List(ports::common_ports())
    } else if cli.ports.contains(',') {
        PortSelection::List(ports::parse_ports_str(&cli.ports)?)
    } else {
        PortSelection::Range(cli.ports.parse::<PortRange>()?)
    };

    let mut request = ScanRequest::for_selection(cli.host.clone(), selection)
        .with_timeout(Duration::from_millis(cli.timeout_ms))
        .with_concurrency(cli.concurrency)
        .with_strategy(cli.strategy)
        .with_adaptive(cli.adaptive);
    if cli.advanced {
        request = request.with_socket_options(SocketOptions::tuned());
    }
    if let Some(ms) = cli.deadline_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }
    Ok(request)
}

fn print_report(report: &ScanReport) {
    println!(
        "\n{} ({}): {} open of {} scanned in {:.2}s [{}]{}",
        report.host,
        report.address,
        report.open_port_count,
        report.total_ports_scanned,
        report.elapsed.as_secs_f64(),
        report.strategy,
        if report.cancelled { " (cancelled)" } else { "" },
    );

    let mut service_w = "service".len();
    for r in &report.open_ports {
        service_w = service_w.max(r.service.as_deref().unwrap_or("").len());
    }
    let port_w = 5usize;
    let rt_w = "response_ms".len();

    println!(
        "{:>port_w$}  {:<service_w$}  {:>rt_w$}",
        "port",
        "service",
        "response_ms",
        port_w = port_w,
        service_w = service_w,
        rt_w = rt_w
    );
    println!(
        "{:-<port_w$}  {:-<service_w$}  {:-<rt_w$}",
        "",
        "",
        "",
        port_w = port_w,
        service_w = service_w,
        rt_w = rt_w
    );
    for r in &report.open_ports {
        let ms = r
            .response_time
            .map(|d| format!("{:.2}", d.as_secs_f64() * 1000.0))
            .unwrap_or_default();
        println!(
            "{:>port_w$}  {:<service_w$}  {:>rt_w$}",
            r.port,
            r.service.as_deref().unwrap_or(""),
            ms,
            port_w = port_w,
            service_w = service_w,
            rt_w = rt_w
        );
    }

    if let Some(stats) = &report.timeout_stats {
        println!("\nAdaptive timeout stats:");
        println!("  samples       : {}", stats.count);
        println!("  avg response  : {:.3}s", stats.avg_response_time.as_secs_f64());
        println!("  success rate  : {:.1}%", stats.success_rate * 100.0);
        println!("  final timeout : {:.3}s", stats.current_timeout.as_secs_f64());
    }
}

fn print_recommendation(rec: &Recommendation) {
    println!("\nRecommended settings for {}:", rec.host);
    println!("  timeout       : {:.3}s", rec.timeout.as_secs_f64());
    println!("  concurrency   : {}", rec.concurrency);
    println!("  strategy      : {}", rec.strategy);
    println!("  adaptive      : {}", rec.adaptive);
    println!(
        "  blocking {:.3}s vs nonblocking {:.3}s",
        rec.scores.blocking_time.as_secs_f64(),
        rec.scores.nonblocking_time.as_secs_f64()
    );
}

fn print_benchmark(report: &BenchmarkReport) {
    println!(
        "\nBenchmark of {}: {} ports, {:.3}s timeout, {} run(s) per method",
        report.host,
        report.ports_tested,
        report.timeout.as_secs_f64(),
        report.iterations
    );
    let name_w = report
        .methods
        .iter()
        .map(|m| m.method.len())
        .max()
        .unwrap_or(0)
        .max("method".len());
    println!(
        "{:<name_w$}  {:>8}  {:>8}  {:>8}  {:>7}  {:>6}",
        "method", "avg_s", "min_s", "max_s", "success", "ratio",
        name_w = name_w
    );
    for m in &report.methods {
        println!(
            "{:<name_w$}  {:>8.3}  {:>8.3}  {:>8.3}  {:>6.1}%  {:>5.2}x",
            m.method,
            m.avg_time.as_secs_f64(),
            m.min_time.as_secs_f64(),
            m.max_time.as_secs_f64(),
            m.success_rate * 100.0,
            m.speed_ratio,
            name_w = name_w
        );
    }
    println!("fastest: {}", report.fastest);
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
