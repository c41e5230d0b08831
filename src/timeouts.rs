//! Per-host adaptive probe timeouts.
//!
//! Each host gets a [`HostTimeoutProfile`] holding a sliding window of
//! observed response times and per-probe outcomes. The recommended
//! timeout is the window's 95th percentile, tripled, scaled by recent
//! success, and clamped into the configured bounds.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::types::secs;

/// Response-time samples kept per host.
pub const SAMPLE_WINDOW: usize = 100;
/// Outcomes considered for the rolling success rate.
pub const SUCCESS_WINDOW: usize = 20;

const PERCENTILE: f64 = 0.95;
const PERCENTILE_MULTIPLIER: f64 = 3.0;

/// Timeout bounds and scaling shared by every profile of an estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutConfig {
    /// Returned while a host has no samples.
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
    /// Multiplier on `p95 * 3` when every recent attempt succeeded. The
    /// multiplier rises linearly to 2.0 as the success rate falls to zero.
    /// The default 0.5 lands a healthy host at 1.5x its p95; 1.0 gives the
    /// plain `2.0 - success_rate` curve (3x p95 at full success).
    pub full_success_factor: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            min: Duration::from_millis(100),
            max: Duration::from_secs(30),
            full_success_factor: 0.5,
        }
    }
}

/// Snapshot of a profile, for reporting.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TimeoutStats {
    pub count: usize,
    #[serde(serialize_with = "secs::serialize")]
    pub avg_response_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "secs::serialize_opt")]
    pub min_response_time: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "secs::serialize_opt")]
    pub max_response_time: Option<Duration>,
    pub success_rate: f64,
    #[serde(serialize_with = "secs::serialize")]
    pub current_timeout: Duration,
}

/// Sliding-window statistics for one host.
#[derive(Debug, Clone)]
pub struct HostTimeoutProfile {
    config: TimeoutConfig,
    samples: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    success_rate: f64,
}

impl HostTimeoutProfile {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            outcomes: VecDeque::with_capacity(SAMPLE_WINDOW),
            success_rate: 1.0,
        }
    }

    /// Record one probe. `response_time` is only present for successful probes.
    pub fn record(&mut self, response_time: Option<Duration>, success: bool) {
        if let Some(rt) = response_time {
            if self.samples.len() == SAMPLE_WINDOW {
                self.samples.pop_front();
            }
            self.samples.push_back(rt);
        }

        if self.outcomes.len() == SAMPLE_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);

        let recent = self.outcomes.len().min(SUCCESS_WINDOW);
        let successes = self.outcomes.iter().rev().take(recent).filter(|ok| **ok).count();
        self.success_rate = successes as f64 / recent as f64;
    }

    pub fn adaptive_timeout(&self) -> Duration {
        let Some(p95) = self.percentile(PERCENTILE) else {
            return self.config.base;
        };
        let factor = success_factor(self.success_rate, self.config.full_success_factor);
        let secs = p95.as_secs_f64() * PERCENTILE_MULTIPLIER * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.config.max)
            .clamp(self.config.min, self.config.max)
    }

    pub fn stats(&self) -> TimeoutStats {
        let count = self.samples.len();
        let avg_response_time = if count == 0 {
            Duration::ZERO
        } else {
            self.samples.iter().sum::<Duration>() / count as u32
        };
        TimeoutStats {
            count,
            avg_response_time,
            min_response_time: self.samples.iter().min().copied(),
            max_response_time: self.samples.iter().max().copied(),
            success_rate: self.success_rate,
            current_timeout: self.adaptive_timeout(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Duration> {
        self.samples.iter()
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
        Some(sorted[idx])
    }
}

/// `at_full` at full success, rising linearly to 2.0 when every attempt fails.
fn success_factor(success_rate: f64, at_full: f64) -> f64 {
    2.0 - (2.0 - at_full) * success_rate.clamp(0.0, 1.0)
}

/// Caller-owned registry of per-host profiles.
///
/// Profiles are created lazily on first reference and each sits behind
/// its own lock, so concurrent probes against one host serialize while
/// different hosts update independently.
#[derive(Debug, Default)]
pub struct AdaptiveTimeoutEstimator {
    config: TimeoutConfig,
    profiles: Mutex<HashMap<String, Arc<Mutex<HostTimeoutProfile>>>>,
}

impl AdaptiveTimeoutEstimator {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> TimeoutConfig {
        self.config
    }

    pub fn profile(&self, host: &str) -> Arc<Mutex<HostTimeoutProfile>> {
        let mut map = lock(&self.profiles);
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostTimeoutProfile::new(self.config))))
            .clone()
    }

    pub fn record(&self, host: &str, response_time: Option<Duration>, success: bool) {
        let profile = self.profile(host);
        lock(&profile).record(response_time, success);
    }

    pub fn adaptive_timeout(&self, host: &str) -> Duration {
        let profile = self.profile(host);
        let timeout = lock(&profile).adaptive_timeout();
        timeout
    }

    pub fn stats(&self, host: &str) -> TimeoutStats {
        let profile = self.profile(host);
        let stats = lock(&profile).stats();
        stats
    }

    /// Stats for every host seen so far, keyed by host.
    pub fn all_stats(&self) -> BTreeMap<String, TimeoutStats> {
        let profiles: Vec<(String, Arc<Mutex<HostTimeoutProfile>>)> = lock(&self.profiles)
            .iter()
            .map(|(host, p)| (host.clone(), p.clone()))
            .collect();
        profiles
            .into_iter()
            .map(|(host, p)| {
                let stats = lock(&p).stats();
                (host, stats)
            })
            .collect()
    }
}

// Profiles hold plain data that stays consistent across a panic.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
