use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ScanError;
use crate::ports::{self, PortRange};
use crate::probe::ProbeStrategy;
use crate::sockopt::SocketOptions;
use crate::timeouts::TimeoutStats;

/// Probe timeout used when a request neither sets one nor asks for adaptive timing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CONCURRENCY: usize = 50;
pub const MAX_CONCURRENCY: usize = 5_000;

/// Which ports a scan covers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortSelection {
    Range(PortRange),
    List(Vec<u16>),
}

impl PortSelection {
    pub fn validate(&self) -> Result<(), ScanError> {
        match self {
            PortSelection::Range(r) => r.validate(),
            PortSelection::List(list) if list.is_empty() => {
                Err(ScanError::InvalidPortList("no ports given".into()))
            }
            PortSelection::List(list) if list.contains(&0) => {
                Err(ScanError::InvalidPortList("port 0 is not scannable".into()))
            }
            PortSelection::List(list) => {
                let mut seen = HashSet::with_capacity(list.len());
                match list.iter().find(|p| !seen.insert(**p)) {
                    Some(dup) => Err(ScanError::InvalidPortList(format!(
                        "port {dup} listed twice"
                    ))),
                    None => Ok(()),
                }
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            PortSelection::Range(r) => r.len(),
            PortSelection::List(list) => list.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u16> {
        match self {
            PortSelection::Range(r) => r.iter().collect(),
            PortSelection::List(list) => list.clone(),
        }
    }
}

/// Everything the dispatcher needs to run one scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub host: String,
    pub ports: PortSelection,
    /// Fixed per-probe timeout. Ignored when `adaptive` is set.
    pub timeout: Option<Duration>,
    pub concurrency: usize,
    pub strategy: ProbeStrategy,
    pub adaptive: bool,
    /// Extra socket tuning; `None` leaves kernel defaults.
    pub socket_options: Option<SocketOptions>,
    /// Cancel the scan once this much wall time has passed.
    pub deadline: Option<Duration>,
}

impl ScanRequest {
    pub fn new(host: impl Into<String>, range: PortRange) -> Self {
        Self::for_selection(host, PortSelection::Range(range))
    }

    pub fn for_selection(host: impl Into<String>, ports: PortSelection) -> Self {
        Self {
            host: host.into(),
            ports,
            timeout: None,
            concurrency: DEFAULT_CONCURRENCY,
            strategy: ProbeStrategy::default(),
            adaptive: false,
            socket_options: None,
            deadline: None,
        }
    }

    /// Quick scan over [`ports::common_ports`].
    pub fn common(host: impl Into<String>) -> Self {
        Self::for_ports(host, ports::common_ports())
    }

    /// List scan. Repeated ports are dropped, keeping first-seen order.
    pub fn for_ports(host: impl Into<String>, mut list: Vec<u16>) -> Self {
        let mut seen = HashSet::with_capacity(list.len());
        list.retain(|p| seen.insert(*p));
        Self::for_selection(host, PortSelection::List(list))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_strategy(mut self, strategy: ProbeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_socket_options(mut self, opts: SocketOptions) -> Self {
        self.socket_options = Some(opts);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Concurrency actually used: at least 1, at most [`MAX_CONCURRENCY`].
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn fixed_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Upper bound on wall time: `ceil(ports / concurrency) * timeout`.
    pub fn worst_case_duration(&self, timeout: Duration) -> Duration {
        let waves = self.ports.len().div_ceil(self.effective_concurrency() as u64);
        timeout.saturating_mul(u32::try_from(waves).unwrap_or(u32::MAX))
    }

    /// Human-readable summary of how probes are issued.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.strategy.to_string()];
        if self.socket_options.is_some() {
            parts.push("tuned socket options".to_string());
        }
        if self.adaptive {
            parts.push("adaptive timeout".to_string());
        }
        parts.join(", ")
    }
}

/// Outcome of a single probe. `response_time` is set only when `open`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PortProbeResult {
    pub port: u16,
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "secs::serialize_opt"
    )]
    pub response_time: Option<Duration>,
}

impl PortProbeResult {
    pub fn open(port: u16, response_time: Duration) -> Self {
        Self {
            port,
            open: true,
            service: Some(ports::service_name(port).to_string()),
            response_time: Some(response_time),
        }
    }

    pub fn closed(port: u16) -> Self {
        Self {
            port,
            open: false,
            service: None,
            response_time: None,
        }
    }
}

/// Aggregate result of one scan invocation.
#[derive(Serialize, Debug, Clone)]
pub struct ScanReport {
    pub host: String,
    pub address: IpAddr,
    pub ports: PortSelection,
    /// Probes that ran to completion. Lower than the selection size only when cancelled.
    pub total_ports_scanned: u64,
    /// Open results, ascending by port.
    pub open_ports: Vec<PortProbeResult>,
    pub open_port_count: usize,
    #[serde(serialize_with = "secs::serialize")]
    pub elapsed: Duration,
    pub strategy: String,
    pub started_at: String,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_stats: Option<TimeoutStats>,
}

/// Durations serialize as fractional seconds.
pub(crate) mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn serialize_opt<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}
