//! Scan parameter tuning against a live target.
//!
//! [`auto_optimize`] runs short scans over a few common ports and
//! recommends scan settings for one host.
//! [`benchmark`] times sequential and concurrent scans under both
//! strategies so they can be compared side by side.
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ScanError;
use crate::ports;
use crate::probe::{ProbeStrategy, Prober};
use crate::scanner::ScanDispatcher;
use crate::types::{secs, PortSelection, ScanRequest, DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT};

pub const TIMEOUT_CANDIDATES: [Duration; 5] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

pub const CONCURRENCY_CANDIDATES: [usize; 7] = [10, 25, 50, 75, 100, 150, 200];

/// What [`auto_optimize`] tries.
#[derive(Debug, Clone)]
pub struct OptimizeConfig {
    pub timeouts: Vec<Duration>,
    pub concurrency_levels: Vec<usize>,
    /// Levels above this are skipped.
    pub max_concurrency: usize,
    /// Ports scanned one at a time for the timeout sweep and the strategy comparison.
    pub timing_ports: Vec<u16>,
    pub concurrency_ports: Vec<u16>,
    /// Per-connect timeout while sweeping concurrency levels.
    pub sweep_timeout: Duration,
    /// Kept when no timeout finds an open port.
    pub fallback_timeout: Duration,
    pub fallback_concurrency: usize,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        let common = ports::common_ports();
        Self {
            timeouts: TIMEOUT_CANDIDATES.to_vec(),
            concurrency_levels: CONCURRENCY_CANDIDATES.to_vec(),
            max_concurrency: 200,
            timing_ports: common.iter().copied().take(5).collect(),
            concurrency_ports: common.iter().copied().take(10).collect(),
            sweep_timeout: Duration::from_millis(500),
            fallback_timeout: DEFAULT_TIMEOUT,
            fallback_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OptimizeScores {
    /// Open-port fraction per second of the chosen timeout.
    pub timeout_score: f64,
    #[serde(serialize_with = "secs::serialize")]
    pub blocking_time: Duration,
    #[serde(serialize_with = "secs::serialize")]
    pub nonblocking_time: Duration,
}

/// Suggested scan settings for one host.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub host: String,
    #[serde(serialize_with = "secs::serialize")]
    pub timeout: Duration,
    pub concurrency: usize,
    pub strategy: ProbeStrategy,
    pub adaptive: bool,
    pub scores: OptimizeScores,
}

impl Recommendation {
    /// Request over `ports` with these settings applied.
    pub fn to_request(&self, ports: PortSelection) -> ScanRequest {
        ScanRequest::for_selection(self.host.clone(), ports)
            .with_timeout(self.timeout)
            .with_concurrency(self.concurrency)
            .with_strategy(self.strategy)
            .with_adaptive(self.adaptive)
    }
}

struct Trial {
    elapsed: Duration,
    open: usize,
}

async fn trial<P: Prober>(
    dispatcher: &ScanDispatcher<P>,
    host: &str,
    ports: &[u16],
    timeout: Duration,
    concurrency: usize,
    strategy: ProbeStrategy,
) -> Result<Trial, ScanError> {
    let request = ScanRequest::for_ports(host, ports.to_vec())
        .with_timeout(timeout)
        .with_concurrency(concurrency)
        .with_strategy(strategy);
    let report = dispatcher.scan(&request).await?;
    Ok(Trial {
        elapsed: report.elapsed,
        open: report.open_port_count,
    })
}

fn per_second(fraction: f64, elapsed: Duration) -> f64 {
    fraction / elapsed.as_secs_f64().max(f64::EPSILON)
}

/// Sweep timeouts, concurrency levels and both strategies against `host`.
///
/// Adaptive timing is always recommended. Ties keep the earlier candidate.
pub async fn auto_optimize<P: Prober>(
    dispatcher: &ScanDispatcher<P>,
    host: &str,
    config: &OptimizeConfig,
) -> Result<Recommendation, ScanError> {
    info!(host, "searching for scan parameters");

    let (timeout, timeout_score) = best_timeout(dispatcher, host, config).await?;
    let concurrency = best_concurrency(dispatcher, host, config).await?;

    let sample = &config.timing_ports;
    let blocking_time = trial(dispatcher, host, sample, timeout, 1, ProbeStrategy::Blocking)
        .await?
        .elapsed;
    let nonblocking_time = trial(dispatcher, host, sample, timeout, 1, ProbeStrategy::Nonblocking)
        .await?
        .elapsed;
    let strategy = if nonblocking_time < blocking_time {
        ProbeStrategy::Nonblocking
    } else {
        ProbeStrategy::Blocking
    };

    info!(
        host,
        ?timeout,
        concurrency,
        %strategy,
        ?blocking_time,
        ?nonblocking_time,
        "scan parameters chosen"
    );
    Ok(Recommendation {
        host: host.to_string(),
        timeout,
        concurrency,
        strategy,
        adaptive: true,
        scores: OptimizeScores {
            timeout_score,
            blocking_time,
            nonblocking_time,
        },
    })
}

async fn best_timeout<P: Prober>(
    dispatcher: &ScanDispatcher<P>,
    host: &str,
    config: &OptimizeConfig,
) -> Result<(Duration, f64), ScanError> {
    let sample = &config.timing_ports;
    let mut best = (config.fallback_timeout, 0.0);
    for &timeout in &config.timeouts {
        let t = trial(dispatcher, host, sample, timeout, 1, ProbeStrategy::Blocking).await?;
        let score = per_second(t.open as f64 / sample.len() as f64, t.elapsed);
        debug!(?timeout, open = t.open, elapsed = ?t.elapsed, score, "timeout candidate");
        if score > best.1 {
            best = (timeout, score);
        }
    }
    Ok(best)
}

async fn best_concurrency<P: Prober>(
    dispatcher: &ScanDispatcher<P>,
    host: &str,
    config: &OptimizeConfig,
) -> Result<usize, ScanError> {
    let mut best: Option<(usize, Duration)> = None;
    for &level in config
        .concurrency_levels
        .iter()
        .filter(|&&c| c <= config.max_concurrency)
    {
        let t = trial(
            dispatcher,
            host,
            &config.concurrency_ports,
            config.sweep_timeout,
            level,
            ProbeStrategy::Blocking,
        )
        .await?;
        debug!(concurrency = level, elapsed = ?t.elapsed, "concurrency candidate");
        if best.map_or(true, |(_, fastest)| t.elapsed < fastest) {
            best = Some((level, t.elapsed));
        }
    }
    Ok(best.map_or(config.fallback_concurrency, |(level, _)| level))
}

/// What [`benchmark`] measures.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub ports: Vec<u16>,
    pub timeout: Duration,
    /// Scans per method; at least one always runs.
    pub iterations: usize,
    /// In-flight connects for the concurrent methods.
    pub concurrency: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            ports: ports::common_ports(),
            timeout: Duration::from_secs(1),
            iterations: 2,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Timing summary of one strategy at one concurrency level.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MethodStats {
    pub method: String,
    pub strategy: ProbeStrategy,
    pub concurrency: usize,
    #[serde(serialize_with = "secs::serialize")]
    pub avg_time: Duration,
    #[serde(serialize_with = "secs::serialize")]
    pub min_time: Duration,
    #[serde(serialize_with = "secs::serialize")]
    pub max_time: Duration,
    #[serde(serialize_with = "secs::serialize")]
    pub std_dev: Duration,
    pub avg_open: f64,
    pub success_rate: f64,
    /// `avg_time` over the fastest method's; 1.0 for the fastest.
    pub speed_ratio: f64,
    /// Success percentage per second.
    pub efficiency: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct BenchmarkReport {
    pub host: String,
    pub ports_tested: usize,
    #[serde(serialize_with = "secs::serialize")]
    pub timeout: Duration,
    pub iterations: usize,
    pub methods: Vec<MethodStats>,
    pub fastest: String,
}

impl BenchmarkReport {
    pub fn method(&self, name: &str) -> Option<&MethodStats> {
        self.methods.iter().find(|m| m.method == name)
    }
}

/// Label of a benchmark method, e.g. `sequential blocking` or `50-way nonblocking`.
pub fn method_name(strategy: ProbeStrategy, concurrency: usize) -> String {
    let strategy = match strategy {
        ProbeStrategy::Blocking => "blocking",
        ProbeStrategy::Nonblocking => "nonblocking",
    };
    if concurrency <= 1 {
        format!("sequential {strategy}")
    } else {
        format!("{concurrency}-way {strategy}")
    }
}

/// Time both strategies, sequentially and at `config.concurrency`, over `config.ports`.
pub async fn benchmark<P: Prober>(
    dispatcher: &ScanDispatcher<P>,
    host: &str,
    config: &BenchmarkConfig,
) -> Result<BenchmarkReport, ScanError> {
    let iterations = config.iterations.max(1);
    let concurrent = config.concurrency.max(2);
    info!(host, ports = config.ports.len(), iterations, "starting benchmark");

    let mut methods = Vec::with_capacity(4);
    for concurrency in [1, concurrent] {
        for strategy in [ProbeStrategy::Blocking, ProbeStrategy::Nonblocking] {
            let mut times = Vec::with_capacity(iterations);
            let mut opens = Vec::with_capacity(iterations);
            for i in 0..iterations {
                let t = trial(dispatcher, host, &config.ports, config.timeout, concurrency, strategy)
                    .await?;
                debug!(
                    %strategy,
                    concurrency,
                    iteration = i + 1,
                    elapsed = ?t.elapsed,
                    open = t.open,
                    "benchmark run"
                );
                times.push(t.elapsed);
                opens.push(t.open);
            }
            methods.push(summarize(strategy, concurrency, &times, &opens, config.ports.len()));
        }
    }

    let fastest_avg = methods
        .iter()
        .map(|m| m.avg_time)
        .min()
        .unwrap_or(Duration::ZERO);
    for m in &mut methods {
        m.speed_ratio = m.avg_time.as_secs_f64() / fastest_avg.as_secs_f64().max(f64::EPSILON);
    }
    let fastest = methods
        .iter()
        .find(|m| m.avg_time == fastest_avg)
        .map(|m| m.method.clone())
        .unwrap_or_default();

    info!(host, %fastest, "benchmark finished");
    Ok(BenchmarkReport {
        host: host.to_string(),
        ports_tested: config.ports.len(),
        timeout: config.timeout,
        iterations,
        methods,
        fastest,
    })
}

fn summarize(
    strategy: ProbeStrategy,
    concurrency: usize,
    times: &[Duration],
    opens: &[usize],
    total_ports: usize,
) -> MethodStats {
    let n = times.len().max(1) as f64;
    let secs: Vec<f64> = times.iter().map(Duration::as_secs_f64).collect();
    let mean = secs.iter().sum::<f64>() / n;
    let std_dev = if secs.len() > 1 {
        let var = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    } else {
        0.0
    };
    let avg_open = opens.iter().sum::<usize>() as f64 / n;
    let success_rate = if total_ports == 0 {
        0.0
    } else {
        avg_open / total_ports as f64
    };

    let avg_time = Duration::try_from_secs_f64(mean).unwrap_or(Duration::ZERO);

    MethodStats {
        method: method_name(strategy, concurrency),
        strategy,
        concurrency,
        avg_time,
        min_time: times.iter().min().copied().unwrap_or(Duration::ZERO),
        max_time: times.iter().max().copied().unwrap_or(Duration::ZERO),
        std_dev: Duration::try_from_secs_f64(std_dev).unwrap_or(Duration::ZERO),
        avg_open,
        success_rate,
        speed_ratio: 1.0,
        efficiency: per_second(success_rate * 100.0, avg_time),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn defaults_sample_leading_common_ports() {
        let cfg = OptimizeConfig::default();
        assert_eq!(cfg.timing_ports, vec![21, 22, 23, 25, 53]);
        assert_eq!(cfg.concurrency_ports.len(), 10);
        assert_eq!(cfg.timeouts.len(), 5);
        assert_eq!(cfg.fallback_timeout, ms(500));
    }

    #[test]
    fn method_names() {
        assert_eq!(method_name(ProbeStrategy::Blocking, 1), "sequential blocking");
        assert_eq!(method_name(ProbeStrategy::Nonblocking, 50), "50-way nonblocking");
    }

    #[test]
    fn summary_statistics() {
        let s = summarize(ProbeStrategy::Blocking, 1, &[ms(100), ms(300)], &[2, 4], 10);
        assert_eq!(s.avg_time, ms(200));
        assert_eq!(s.min_time, ms(100));
        assert_eq!(s.max_time, ms(300));
        // sample deviation of 0.1s and 0.3s
        let dev = s.std_dev.as_secs_f64();
        assert!((dev - 0.141_421).abs() < 1e-4, "{dev}");
        assert!((s.avg_open - 3.0).abs() < 1e-9);
        assert!((s.success_rate - 0.3).abs() < 1e-9);
        assert!((s.efficiency - 150.0).abs() < 1e-6);
    }

    #[test]
    fn single_run_has_no_spread() {
        let s = summarize(ProbeStrategy::Nonblocking, 8, &[ms(40)], &[0], 4);
        assert_eq!(s.std_dev, Duration::ZERO);
        assert_eq!(s.success_rate, 0.0);
    }
}
