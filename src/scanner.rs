use crate::error::ScanError;
use crate::probe::{ConnectProbe, Prober};
use crate::timeouts::AdaptiveTimeoutEstimator;
use crate::types::{PortProbeResult, ScanReport, ScanRequest};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ::time::{format_description::well_known, OffsetDateTime};
use tracing::{debug, info, warn};

/// Live counters a caller can watch while a scan runs.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub scanned_done: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
    pub entries: Arc<Mutex<Vec<PortProbeResult>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            scanned_done: Arc::new(AtomicU64::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn scanned(&self) -> u64 {
        self.scanned_done.load(Ordering::Relaxed)
    }

    pub fn open(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans probes for one host out over a bounded number of in-flight tasks.
///
/// - At most `request.concurrency` probes (and so sockets) exist at once,
///   enforced by a `Semaphore` whose permit is taken before each spawn.
/// - With adaptive timing, every probe asks the estimator for its timeout
///   at dispatch and feeds its outcome back as soon as it completes.
/// - Cancellation stops new dispatch, abandons in-flight probes and yields
///   a partial report.
#[derive(Debug, Clone)]
pub struct ScanDispatcher<P = ConnectProbe> {
    prober: Arc<P>,
    estimator: Arc<AdaptiveTimeoutEstimator>,
}

impl ScanDispatcher<ConnectProbe> {
    pub fn new(estimator: Arc<AdaptiveTimeoutEstimator>) -> Self {
        Self::with_prober(ConnectProbe, estimator)
    }
}

impl<P: Prober> ScanDispatcher<P> {
    pub fn with_prober(prober: P, estimator: Arc<AdaptiveTimeoutEstimator>) -> Self {
        Self {
            prober: Arc::new(prober),
            estimator,
        }
    }

    pub fn estimator(&self) -> &Arc<AdaptiveTimeoutEstimator> {
        &self.estimator
    }

    /// Run `request` to completion.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanReport, ScanError> {
        self.scan_internal(request, None, None).await
    }

    /// Variant that accepts a `CancellationToken` to allow external cancellation.
    pub async fn scan_with_cancel(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        self.scan_internal(request, Some(cancel), None).await
    }

    /// Variant that also publishes progress into `shared` as probes land.
    pub async fn scan_with_shared(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
        shared: SharedProgress,
    ) -> Result<ScanReport, ScanError> {
        self.scan_internal(request, Some(cancel), Some(shared)).await
    }

    async fn scan_internal(
        &self,
        request: &ScanRequest,
        cancel_opt: Option<CancellationToken>,
        shared_opt: Option<SharedProgress>,
    ) -> Result<ScanReport, ScanError> {
        request.ports.validate()?;
        let ip = resolve_host(&request.host).await?;

        let started = Instant::now();
        let started_at = now_rfc3339();
        let host: Arc<str> = Arc::from(request.host.as_str());
        let progress = shared_opt.unwrap_or_default();
        // A child token lets the deadline and cleanup cancel this scan only.
        let cancel = cancel_opt.unwrap_or_default().child_token();
        let concurrency = request.effective_concurrency();

        let initial_timeout = expected_timeout(request, &self.estimator);
        info!(
            host = %host,
            %ip,
            ports = request.ports.len(),
            concurrency,
            strategy = %request.strategy,
            timeout = ?initial_timeout,
            worst_case = ?request.worst_case_duration(initial_timeout),
            "starting scan"
        );

        if let Some(deadline) = request.deadline {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        debug!(?deadline, "scan deadline reached");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        let sem = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();

        for port in request.ports.to_vec() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let prober = self.prober.clone();
            let estimator = self.estimator.clone();
            let host = host.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let strategy = request.strategy;
            let opts = request.socket_options.clone();
            let adaptive = request.adaptive;
            let fixed = request.fixed_timeout();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes

                let timeout = if adaptive {
                    estimator.adaptive_timeout(&host)
                } else {
                    fixed
                };
                let addr = SocketAddr::new(ip, port);

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    r = prober.probe(addr, timeout, strategy, opts.as_ref()) => r,
                };

                if adaptive {
                    estimator.record(&host, result.response_time, result.open);
                }
                if result.open {
                    progress.open_count.fetch_add(1, Ordering::Relaxed);
                    progress.entries.lock().await.push(result.clone());
                }
                progress.scanned_done.fetch_add(1, Ordering::Relaxed);
                Some(result)
            });
        }

        let mut completed: u64 = 0;
        let mut open_ports: Vec<PortProbeResult> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    completed += 1;
                    if result.open {
                        open_ports.push(result);
                    }
                }
                Ok(None) => {}
                // A crashed probe counts as a closed port.
                Err(e) => {
                    warn!(error = %e, "probe task failed");
                    completed += 1;
                }
            }
        }
        open_ports.sort_by_key(|r| r.port);

        let cancelled = cancel.is_cancelled() && completed < request.ports.len();
        if cancelled && completed == 0 {
            return Err(ScanError::Cancelled);
        }
        // Stops the deadline watcher of a scan that finished in time.
        cancel.cancel();

        let elapsed = started.elapsed();
        info!(
            host = %host,
            scanned = completed,
            open = open_ports.len(),
            ?elapsed,
            cancelled,
            "scan finished"
        );

        Ok(ScanReport {
            host: request.host.clone(),
            address: ip,
            ports: request.ports.clone(),
            total_ports_scanned: completed,
            open_port_count: open_ports.len(),
            open_ports,
            elapsed,
            strategy: request.describe(),
            started_at,
            cancelled,
            timeout_stats: request.adaptive.then(|| self.estimator.stats(&host)),
        })
    }
}

/// Resolve `host` to the address probes connect to, preferring IPv4.
pub async fn resolve_host(host: &str) -> Result<IpAddr, ScanError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolution_error = |source| ScanError::HostResolution {
        host: host.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = net::lookup_host((host, 0))
        .await
        .map_err(resolution_error)?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
        .ok_or_else(|| {
            resolution_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Timeout the next probe of `request` would use.
pub fn expected_timeout(request: &ScanRequest, estimator: &AdaptiveTimeoutEstimator) -> Duration {
    if request.adaptive {
        estimator.adaptive_timeout(&request.host)
    } else {
        request.fixed_timeout()
    }
}
