// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leader-gated, fixed-interval reconciliation loop.
//!
//! Each [`Activity`] gets exactly one [`ReconciliationLoop`] running on its
//! own task. The loop sleeps for the grace period, ticks once, then ticks on
//! every interval boundary. A tick that overruns delays the next one to the
//! following boundary; missed ticks are skipped, never queued. Shutdown is
//! observed between ticks only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::LeaderGate;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unit of periodic reconciliation work.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Stable name used in logs and spans.
    fn name(&self) -> &'static str;

    /// Run one reconciliation pass.
    async fn tick(&self) -> Result<()>;
}

/// Scheduling parameters of a loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Time between tick boundaries. Must be positive.
    pub interval: Duration,
    /// Delay before the first tick.
    pub grace_period: Duration,
}

/// Runs an [`Activity`] while this process is leader.
pub struct ReconciliationLoop {
    activity: Arc<dyn Activity>,
    leader: Arc<dyn LeaderGate>,
    config: LoopConfig,
    shutdown: Arc<Notify>,
}

impl ReconciliationLoop {
    /// Create a loop. Fails on a zero interval.
    pub fn new(
        activity: Arc<dyn Activity>,
        leader: Arc<dyn LeaderGate>,
        config: LoopConfig,
    ) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(Error::Other(format!(
                "interval of activity '{}' must be positive",
                activity.name()
            )));
        }
        Ok(Self {
            activity,
            leader,
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Name of the driven activity.
    pub fn activity_name(&self) -> &'static str {
        self.activity.name()
    }

    /// Run the loop until the shutdown signal is received.
    pub async fn run(&self) {
        let name = self.activity.name();
        info!(
            activity = name,
            interval_secs = self.config.interval.as_secs(),
            grace_period_secs = self.config.grace_period.as_secs(),
            "Reconciliation loop started"
        );

        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!(activity = name, "Reconciliation loop stopped during grace period");
                return;
            }

            _ = tokio::time::sleep(self.config.grace_period) => {}
        }

        self.tick_if_leader().await;

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(activity = name, "Reconciliation loop received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.tick_if_leader().await;
                }
            }
        }

        info!(activity = name, "Reconciliation loop stopped");
    }

    /// Run one tick if this process is leader. Returns whether it ran.
    ///
    /// Errors are logged and swallowed; the next tick retries.
    pub async fn tick_if_leader(&self) -> bool {
        let name = self.activity.name();
        if !self.leader.is_leader() {
            debug!(activity = name, "Not leader, skipping tick");
            return false;
        }

        let span = info_span!("tick", activity = name, tick_id = %Uuid::new_v4());
        async {
            let started = Instant::now();
            match self.activity.tick().await {
                Ok(()) => debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tick completed"
                ),
                Err(e) => error!(error = %e, "Tick failed"),
            }
        }
        .instrument(span)
        .await;
        true
    }
}
