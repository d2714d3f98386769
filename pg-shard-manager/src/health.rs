//! Per-shard health state and the background probe loop.
//!
//! Health lives in atomics on each shard record, so the router and the
//! monitor only ever touch the shard they are working on. There is no lock
//! spanning all shards.

use crate::manager::Topology;
use crate::shard::Shard;
use crate::ShardIndex;
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of recording a success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameHealthy,
    BecameUnhealthy,
}

/// Set in the packed state word when the shard is UNHEALTHY. The low 32
/// bits hold the consecutive failure count.
const UNHEALTHY_BIT: u64 = 1 << 32;
const FAILURES_MASK: u64 = UNHEALTHY_BIT - 1;

/// Health record for one shard.
///
/// HEALTHY flips to UNHEALTHY once `consecutive_failures` reaches the
/// threshold; any success flips it straight back and resets the count.
/// Flag and count share one atomic word, so concurrent outcomes can never
/// leave an UNHEALTHY shard with a zero failure streak.
#[derive(Debug)]
pub struct ShardHealth {
    state: AtomicU64,
    /// Unix millis of the last recorded outcome, 0 if none yet.
    last_check_ms: AtomicI64,
}

impl Default for ShardHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardHealth {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            last_check_ms: AtomicI64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) & UNHEALTHY_BIT == 0
    }

    pub fn consecutive_failures(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & FAILURES_MASK) as u32
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        match self.last_check_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn record_success(&self) -> HealthTransition {
        self.touch();
        if self.state.swap(0, Ordering::AcqRel) & UNHEALTHY_BIT != 0 {
            HealthTransition::BecameHealthy
        } else {
            HealthTransition::Unchanged
        }
    }

    pub fn record_failure(&self, threshold: u32) -> HealthTransition {
        self.touch();
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let failures = ((state & FAILURES_MASK) as u32).saturating_add(1);
                let unhealthy = state & UNHEALTHY_BIT != 0 || failures >= threshold;
                Some(u64::from(failures) | if unhealthy { UNHEALTHY_BIT } else { 0 })
            })
            .unwrap_or_else(|state| state);
        let healthy_before = previous & UNHEALTHY_BIT == 0;
        let failures_now = ((previous & FAILURES_MASK) as u32).saturating_add(1);
        if healthy_before && failures_now >= threshold {
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::Unchanged
        }
    }

    /// Flag and count read from a single load.
    pub fn snapshot(&self) -> HealthState {
        let state = self.state.load(Ordering::Acquire);
        HealthState {
            healthy: state & UNHEALTHY_BIT == 0,
            consecutive_failures: (state & FAILURES_MASK) as u32,
            last_check: self.last_check(),
        }
    }

    fn touch(&self) {
        self.last_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }
}

/// Point-in-time copy of a shard's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthState {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

/// Result of probing one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub shard_index: ShardIndex,
    pub shard_name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Record whether a shard answered a query or probe, and log any state
/// change.
pub(crate) fn record_outcome(shard: &Shard, reachable: bool, threshold: u32) -> HealthTransition {
    let transition = if reachable {
        shard.health().record_success()
    } else {
        shard.health().record_failure(threshold)
    };
    match transition {
        HealthTransition::BecameUnhealthy => tracing::warn!(
            shard_index = shard.index(),
            shard = %shard.name(),
            failures = shard.health().consecutive_failures(),
            "Shard marked unhealthy"
        ),
        HealthTransition::BecameHealthy => tracing::info!(
            shard_index = shard.index(),
            shard = %shard.name(),
            "Shard recovered"
        ),
        HealthTransition::Unchanged => {}
    }
    transition
}

/// Periodic liveness prober.
///
/// Each tick loads the current topology snapshot and pings every shard
/// concurrently, each ping bounded by `probe_timeout`.
#[derive(Clone)]
pub struct HealthMonitor {
    topology: Arc<ArcSwap<Topology>>,
    interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
}

impl HealthMonitor {
    pub(crate) fn new(
        topology: Arc<ArcSwap<Topology>>,
        interval: Duration,
        probe_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            topology,
            interval,
            probe_timeout,
            failure_threshold,
        }
    }

    /// Spawn the probe loop. It exits when `cancel_token` is cancelled.
    pub(crate) fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; shards were verified on add.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Health monitor shutting down");
                        break;
                    }

                    _ = timer.tick() => {
                        let reports = tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            reports = self.check_now() => reports,
                        };
                        let unhealthy = reports.iter().filter(|r| !r.healthy).count();
                        tracing::trace!(
                            shards = reports.len(),
                            unhealthy,
                            "Health check round complete"
                        );
                    }
                }
            }
        })
    }

    /// Probe every shard once and return a report per shard.
    pub async fn check_now(&self) -> Vec<ProbeReport> {
        let topology = self.topology.load_full();
        let probes = topology
            .shards()
            .filter(|shard| !shard.is_retired())
            .map(|shard| self.probe(shard.clone()));
        join_all(probes).await
    }

    async fn probe(&self, shard: Arc<Shard>) -> ProbeReport {
        let outcome = shard.ping(self.probe_timeout).await;
        if let Err(e) = &outcome {
            tracing::debug!(
                shard_index = shard.index(),
                shard = %shard.name(),
                error = %e,
                "Health probe failed"
            );
        }
        record_outcome(&shard, outcome.is_ok(), self.failure_threshold);

        ProbeReport {
            shard_index: shard.index(),
            shard_name: shard.name().to_string(),
            healthy: shard.health().is_healthy(),
            error: outcome.err().map(|e| e.to_string()),
        }
    }
}
