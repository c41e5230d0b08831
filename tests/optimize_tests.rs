use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portsweep::error::ScanError;
use portsweep::optimize::{self, BenchmarkConfig, OptimizeConfig};
use portsweep::probe::{ProbeStrategy, Prober};
use portsweep::scanner::ScanDispatcher;
use portsweep::sockopt::SocketOptions;
use portsweep::timeouts::AdaptiveTimeoutEstimator;
use portsweep::types::{PortProbeResult, PortSelection};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Simulated target: open ports answer after a per-strategy latency,
/// every other port stays silent until the caller's timeout.
struct Target {
    open: HashSet<u16>,
    blocking_latency: Duration,
    nonblocking_latency: Duration,
    calls: AtomicUsize,
}

#[derive(Clone)]
struct TargetModel(Arc<Target>);

impl TargetModel {
    fn new(open: &[u16], blocking_latency: Duration, nonblocking_latency: Duration) -> Self {
        Self(Arc::new(Target {
            open: open.iter().copied().collect(),
            blocking_latency,
            nonblocking_latency,
            calls: AtomicUsize::new(0),
        }))
    }
}

#[async_trait]
impl Prober for TargetModel {
    async fn probe(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        strategy: ProbeStrategy,
        _opts: Option<&SocketOptions>,
    ) -> PortProbeResult {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let latency = match strategy {
            ProbeStrategy::Blocking => self.0.blocking_latency,
            ProbeStrategy::Nonblocking => self.0.nonblocking_latency,
        };
        if self.0.open.contains(&addr.port()) && latency <= timeout {
            tokio::time::sleep(latency).await;
            PortProbeResult::open(addr.port(), latency)
        } else {
            tokio::time::sleep(timeout).await;
            PortProbeResult::closed(addr.port())
        }
    }
}

fn dispatcher(target: &TargetModel) -> ScanDispatcher<TargetModel> {
    ScanDispatcher::with_prober(target.clone(), Arc::new(AdaptiveTimeoutEstimator::default()))
}

/// Same shape as the default sweep, scaled down to milliseconds.
fn small_config() -> OptimizeConfig {
    OptimizeConfig {
        timeouts: vec![ms(5), ms(30), ms(60), ms(120)],
        concurrency_levels: vec![1, 2, 5, 10],
        max_concurrency: 10,
        sweep_timeout: ms(40),
        ..OptimizeConfig::default()
    }
}

#[tokio::test]
async fn picks_shortest_timeout_that_still_finds_ports() {
    // 21 and 22 lead the timing sample; 80 sits in the concurrency sample.
    let target = TargetModel::new(&[21, 22, 80], ms(25), ms(2));
    let rec = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &small_config())
        .await
        .unwrap();

    // 5ms misses every open port; 30ms finds both in the least time.
    assert_eq!(rec.timeout, ms(30));
    assert!(rec.scores.timeout_score > 0.0);
    assert_eq!(rec.concurrency, 10);
    assert_eq!(rec.strategy, ProbeStrategy::Nonblocking);
    assert!(rec.scores.nonblocking_time < rec.scores.blocking_time);
    assert!(rec.adaptive);
}

#[tokio::test]
async fn slower_nonblocking_keeps_blocking() {
    let target = TargetModel::new(&[21, 22], ms(2), ms(25));
    let config = OptimizeConfig {
        timeouts: vec![ms(30)],
        ..small_config()
    };
    let rec = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap();
    assert_eq!(rec.timeout, ms(30));
    assert_eq!(rec.strategy, ProbeStrategy::Blocking);
}

#[tokio::test]
async fn concurrency_sweep_respects_ceiling() {
    let target = TargetModel::new(&[21], ms(5), ms(5));
    let config = OptimizeConfig {
        max_concurrency: 5,
        ..small_config()
    };
    let rec = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap();
    assert_eq!(rec.concurrency, 5);
}

#[tokio::test]
async fn silent_host_keeps_fallback_timeout() {
    let target = TargetModel::new(&[], ms(1), ms(1));
    let config = OptimizeConfig {
        timeouts: vec![ms(5), ms(10)],
        concurrency_levels: vec![],
        fallback_timeout: ms(20),
        ..small_config()
    };
    let rec = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap();
    assert_eq!(rec.timeout, config.fallback_timeout);
    assert_eq!(rec.concurrency, config.fallback_concurrency);
    assert_eq!(rec.scores.timeout_score, 0.0);
}

#[tokio::test]
async fn empty_timing_sample_is_rejected() {
    let target = TargetModel::new(&[21], ms(1), ms(1));
    let config = OptimizeConfig {
        timing_ports: vec![],
        ..small_config()
    };
    let err = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidPortList(_)));
    assert_eq!(target.0.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn recommendation_builds_a_request_and_serializes() {
    let target = TargetModel::new(&[21, 22], ms(25), ms(2));
    let rec = optimize::auto_optimize(&dispatcher(&target), "127.0.0.1", &small_config())
        .await
        .unwrap();

    let req = rec.to_request(PortSelection::List(vec![22, 80]));
    assert_eq!(req.host, "127.0.0.1");
    assert_eq!(req.concurrency, rec.concurrency);
    assert_eq!(req.strategy, rec.strategy);
    assert!(req.adaptive);

    let v = serde_json::to_value(&rec).unwrap();
    assert_eq!(v["strategy"], "nonblocking");
    assert_eq!(v["adaptive"], true);
    assert!((v["timeout"].as_f64().unwrap() - 0.03).abs() < 1e-9);
    assert!(v["scores"]["blocking_time"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn benchmark_compares_all_four_methods() {
    let target = TargetModel::new(&[21, 22], ms(15), ms(3));
    let config = BenchmarkConfig {
        ports: vec![21, 22, 23, 25, 53, 80],
        timeout: ms(20),
        iterations: 2,
        concurrency: 6,
    };
    let report = optimize::benchmark(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap();

    assert_eq!(report.methods.len(), 4);
    assert_eq!(report.ports_tested, 6);
    assert_eq!(target.0.calls.load(Ordering::SeqCst), 4 * 2 * 6);
    for m in &report.methods {
        assert!((m.avg_open - 2.0).abs() < 1e-9, "{}", m.method);
        assert!((m.success_rate - 2.0 / 6.0).abs() < 1e-9);
        assert!(m.min_time <= m.max_time);
        assert!(m.speed_ratio >= 1.0);
    }

    let fastest = report.method(&report.fastest).unwrap();
    assert_eq!(fastest.speed_ratio, 1.0);
    assert_eq!(fastest.concurrency, 6);

    let seq_blocking = report.method("sequential blocking").unwrap();
    let seq_nonblocking = report.method("sequential nonblocking").unwrap();
    assert!(seq_nonblocking.avg_time < seq_blocking.avg_time);
    assert!(seq_blocking.speed_ratio > 1.5);
}

#[tokio::test]
async fn benchmark_runs_at_least_once() {
    let target = TargetModel::new(&[], ms(1), ms(1));
    let config = BenchmarkConfig {
        ports: vec![21],
        timeout: ms(1),
        iterations: 0,
        concurrency: 4,
    };
    let report = optimize::benchmark(&dispatcher(&target), "127.0.0.1", &config)
        .await
        .unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(target.0.calls.load(Ordering::SeqCst), 4);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["methods"].as_array().unwrap().len(), 4);
}
