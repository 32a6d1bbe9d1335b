//! Periodic background cycles.
//!
//! Compression, load balancing and prefetch-queue draining each run as an
//! independent tokio task driven by an interval stream. Every task stops
//! when the shared [`CancellationToken`] fires, and each finished cycle is
//! reported on an `mpsc` channel. A full channel drops the report rather
//! than stalling the cycle.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::prefetch_queue::{DrainReport, PrefetchQueueCoordinator};
use crate::swarm::balancer::{BalanceOutcome, SwarmLoadBalancer};
use crate::swarm::compressor::{AdaptiveSwarmCompressor, CompressionReport};
use crate::swarm::telemetry::TelemetrySource;

/// The result of one background cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum CycleReport {
    Compression(CompressionReport),
    Balance { outcome: BalanceOutcome },
    PrefetchDrain(DrainReport),
}

/// Handles of the running periodic tasks.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Run `cycle` every `period` until cancelled.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        reports: mpsc::Sender<CycleReport>,
        mut cycle: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<CycleReport>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let Some(report) = cycle().await else {
                            continue;
                        };
                        if let Err(e) = reports.try_send(report) {
                            debug!(task = name, error = %e, "Cycle report dropped");
                        }
                    }
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        self.handles.push((name, handle));
    }

    /// Pressure then idle policy, with pressure read from `telemetry`.
    pub fn spawn_compression(
        &mut self,
        compressor: Arc<AdaptiveSwarmCompressor>,
        telemetry: Arc<dyn TelemetrySource>,
        period: Duration,
        reports: mpsc::Sender<CycleReport>,
    ) {
        self.spawn_periodic("compression", period, reports, move || {
            let compressor = compressor.clone();
            let telemetry = telemetry.clone();
            async move {
                let pressure = telemetry.snapshot().vram_pressure;
                Some(CycleReport::Compression(compressor.run_cycle(pressure, Instant::now())))
            }
        });
    }

    pub fn spawn_balancer(
        &mut self,
        balancer: Arc<SwarmLoadBalancer>,
        period: Duration,
        reports: mpsc::Sender<CycleReport>,
    ) {
        self.spawn_periodic("balancer", period, reports, move || {
            let balancer = balancer.clone();
            async move {
                Some(CycleReport::Balance {
                    outcome: balancer.run_cycle().await,
                })
            }
        });
    }

    /// Drain up to `batch` queued allocations per cycle.
    pub fn spawn_prefetch_drain(
        &mut self,
        queue: Arc<Mutex<PrefetchQueueCoordinator>>,
        batch: usize,
        period: Duration,
        reports: mpsc::Sender<CycleReport>,
    ) {
        self.spawn_periodic("prefetch_drain", period, reports, move || {
            let result = queue.lock().process_prefetch_queue(batch);
            async move {
                match result {
                    Ok(report) if report.allocated > 0 || report.stalled => Some(CycleReport::PrefetchDrain(report)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Prefetch drain failed");
                        None
                    }
                }
            }
        });
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Periodic task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}
