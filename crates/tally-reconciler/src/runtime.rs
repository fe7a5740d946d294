// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tally-reconciler.
//!
//! [`ReconcilerRuntime`] wires the controllers to their loops and the leader
//! gate, and spawns one task per activity.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_core::{MockFlowDelegate, SqliteStore};
//! use tally_reconciler::clients::mock::{MockBillingNotifier, MockRateSource};
//! use tally_reconciler::config::LeaderMode;
//! use tally_reconciler::runtime::ReconcilerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::connect("sqlite::memory:", 1).await?);
//!
//!     let runtime = ReconcilerRuntime::builder()
//!         .store(store)
//!         .flow_delegate(Arc::new(MockFlowDelegate::new()))
//!         .rate_source(Arc::new(MockRateSource::new()))
//!         .notifier(Arc::new(MockBillingNotifier::new()))
//!         .leader_mode(LeaderMode::Always)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tally_core::{
    FlowDelegate, LeaderGate, LeaseLeaderGate, MIN_LEASE_TTL, StaticLeaderGate, Store,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bill_sync::{BillSyncConfig, BillSyncController};
use crate::clients::{BillingNotifier, RateSource, TicketService};
use crate::config::{Config, LeaderMode};
use crate::exchange_rate::{ExchangeRateConfig, ExchangeRateController};
use crate::sub_ticket::SubTicketWatcher;
use crate::worker::{Activity, LoopConfig, ReconciliationLoop};

/// Lease resource shared by all loops of a deployment.
pub const LEASE_RESOURCE: &str = "tally-reconciler";

/// Builder for creating a [`ReconcilerRuntime`].
pub struct ReconcilerRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    flows: Option<Arc<dyn FlowDelegate>>,
    rate_source: Option<Arc<dyn RateSource>>,
    notifier: Option<Arc<dyn BillingNotifier>>,
    tickets: Option<Arc<dyn TicketService>>,
    leader_mode: LeaderMode,
    instance_id: String,
    lease_ttl: Duration,
    grace_period: Duration,
    bill_sync_interval: Duration,
    exchange_rate_interval: Duration,
    sub_ticket_interval: Duration,
    bill_sync: BillSyncConfig,
    exchange_rate: ExchangeRateConfig,
    sub_ticket_batch: i64,
}

impl Default for ReconcilerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            flows: None,
            rate_source: None,
            notifier: None,
            tickets: None,
            leader_mode: LeaderMode::Lease,
            instance_id: format!("tally-{}", std::process::id()),
            lease_ttl: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            bill_sync_interval: Duration::from_secs(60),
            exchange_rate_interval: Duration::from_secs(3600),
            sub_ticket_interval: Duration::from_secs(30),
            bill_sync: BillSyncConfig::default(),
            exchange_rate: ExchangeRateConfig::default(),
            sub_ticket_batch: 200,
        }
    }
}

impl ReconcilerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the scheduling and tuning values of a loaded [`Config`].
    ///
    /// Clients and the store are not derived from it.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.leader_mode = config.leader_mode;
        self.instance_id = config.instance_id.clone();
        self.lease_ttl = config.leader_lease_ttl;
        self.grace_period = config.grace_period;
        self.bill_sync_interval = config.bill_sync_interval;
        self.exchange_rate_interval = config.exchange_rate_interval;
        self.sub_ticket_interval = config.sub_ticket_interval;
        self.bill_sync.batch_size = config.batch_size;
        self.bill_sync.flow_retry_limit = config.flow_retry_limit;
        self.exchange_rate = ExchangeRateConfig {
            target_currencies: config.target_currencies.clone(),
            source_currencies: config.source_currencies.clone(),
        };
        self
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the flow service client (required).
    pub fn flow_delegate(mut self, flows: Arc<dyn FlowDelegate>) -> Self {
        self.flows = Some(flows);
        self
    }

    /// Set the rate source (required).
    pub fn rate_source(mut self, source: Arc<dyn RateSource>) -> Self {
        self.rate_source = Some(source);
        self
    }

    /// Set the billing notifier (required).
    pub fn notifier(mut self, notifier: Arc<dyn BillingNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the ticketing service. Without it the approval watcher is not started.
    pub fn ticket_service(mut self, tickets: Arc<dyn TicketService>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Set the leadership strategy.
    ///
    /// Default: [`LeaderMode::Lease`]
    pub fn leader_mode(mut self, mode: LeaderMode) -> Self {
        self.leader_mode = mode;
        self
    }

    /// Set the name leases are held under.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Set the lease time-to-live.
    ///
    /// Default: 30 seconds
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the delay before the first tick of every loop.
    ///
    /// Default: 10 seconds
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the bill sync tick interval.
    ///
    /// Default: 60 seconds
    pub fn bill_sync_interval(mut self, interval: Duration) -> Self {
        self.bill_sync_interval = interval;
        self
    }

    /// Set the exchange rate tick interval.
    ///
    /// Default: 1 hour
    pub fn exchange_rate_interval(mut self, interval: Duration) -> Self {
        self.exchange_rate_interval = interval;
        self
    }

    /// Set the approval watcher tick interval.
    ///
    /// Default: 30 seconds
    pub fn sub_ticket_interval(mut self, interval: Duration) -> Self {
        self.sub_ticket_interval = interval;
        self
    }

    /// Set the bill sync tuning.
    pub fn bill_sync_config(mut self, config: BillSyncConfig) -> Self {
        self.bill_sync = config;
        self
    }

    /// Set the exchange rate currencies.
    pub fn exchange_rate_config(mut self, config: ExchangeRateConfig) -> Self {
        self.exchange_rate = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ReconcilerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let flows = self
            .flows
            .ok_or_else(|| anyhow::anyhow!("flow_delegate is required"))?;
        let rate_source = self
            .rate_source
            .ok_or_else(|| anyhow::anyhow!("rate_source is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notifier is required"))?;

        if self.bill_sync.batch_size <= 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.bill_sync.records_per_tick <= 0 {
            anyhow::bail!("records_per_tick must be positive");
        }
        if self.leader_mode == LeaderMode::Lease && self.lease_ttl < MIN_LEASE_TTL {
            anyhow::bail!(
                "lease_ttl must be at least {}ms, got {}ms",
                MIN_LEASE_TTL.as_millis(),
                self.lease_ttl.as_millis()
            );
        }

        Ok(ReconcilerRuntimeConfig {
            store,
            flows,
            rate_source,
            notifier,
            tickets: self.tickets,
            leader_mode: self.leader_mode,
            instance_id: self.instance_id,
            lease_ttl: self.lease_ttl,
            grace_period: self.grace_period,
            bill_sync_interval: self.bill_sync_interval,
            exchange_rate_interval: self.exchange_rate_interval,
            sub_ticket_interval: self.sub_ticket_interval,
            bill_sync: self.bill_sync,
            exchange_rate: self.exchange_rate,
            sub_ticket_batch: self.sub_ticket_batch,
        })
    }
}

/// Configuration for a [`ReconcilerRuntime`].
pub struct ReconcilerRuntimeConfig {
    store: Arc<dyn Store>,
    flows: Arc<dyn FlowDelegate>,
    rate_source: Arc<dyn RateSource>,
    notifier: Arc<dyn BillingNotifier>,
    tickets: Option<Arc<dyn TicketService>>,
    leader_mode: LeaderMode,
    instance_id: String,
    lease_ttl: Duration,
    grace_period: Duration,
    bill_sync_interval: Duration,
    exchange_rate_interval: Duration,
    sub_ticket_interval: Duration,
    bill_sync: BillSyncConfig,
    exchange_rate: ExchangeRateConfig,
    sub_ticket_batch: i64,
}

struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl ReconcilerRuntimeConfig {
    /// Start the runtime, spawning the lease keeper and one loop per activity.
    ///
    /// Fails without spawning anything when the store does not answer.
    pub async fn start(self) -> Result<ReconcilerRuntime> {
        if !self
            .store
            .health_check()
            .await
            .context("store health check failed")?
        {
            anyhow::bail!("store reported unhealthy");
        }

        let mut lease_keeper = None;
        let leader: Arc<dyn LeaderGate> = match self.leader_mode {
            LeaderMode::Always => Arc::new(StaticLeaderGate::always()),
            LeaderMode::Never => Arc::new(StaticLeaderGate::never()),
            LeaderMode::Lease => {
                let gate = Arc::new(LeaseLeaderGate::new(
                    self.store.clone(),
                    LEASE_RESOURCE,
                    self.instance_id.clone(),
                    self.lease_ttl,
                ));
                let shutdown = gate.shutdown_handle();
                let handle = {
                    let gate = gate.clone();
                    tokio::spawn(async move { gate.run().await })
                };
                lease_keeper = Some(TaskHandle {
                    name: "lease_keeper",
                    handle,
                    shutdown,
                });
                gate
            }
        };

        let bill_sync: Arc<dyn Activity> = Arc::new(BillSyncController::new(
            self.store.clone(),
            self.flows.clone(),
            self.notifier.clone(),
            self.bill_sync,
        ));
        let exchange_rate: Arc<dyn Activity> = Arc::new(ExchangeRateController::new(
            self.store.clone(),
            self.rate_source.clone(),
            self.exchange_rate.clone(),
        ));
        let mut activities = vec![
            (bill_sync, self.bill_sync_interval),
            (exchange_rate, self.exchange_rate_interval),
        ];

        match &self.tickets {
            Some(tickets) => {
                let watcher: Arc<dyn Activity> = Arc::new(SubTicketWatcher::new(
                    self.store.clone(),
                    tickets.clone(),
                    self.sub_ticket_batch,
                ));
                activities.push((watcher, self.sub_ticket_interval));
            }
            None => debug!("No ticket service configured; approval watcher disabled"),
        }

        let mut loops = Vec::with_capacity(activities.len());
        for (activity, interval) in activities {
            let reconciliation_loop = ReconciliationLoop::new(
                activity,
                leader.clone(),
                LoopConfig {
                    interval,
                    grace_period: self.grace_period,
                },
            )?;
            let name = reconciliation_loop.activity_name();
            let shutdown = reconciliation_loop.shutdown_handle();
            let handle = tokio::spawn(async move { reconciliation_loop.run().await });
            loops.push(TaskHandle {
                name,
                handle,
                shutdown,
            });
        }

        info!(
            instance_id = %self.instance_id,
            leader_mode = ?self.leader_mode,
            loops = loops.len(),
            "ReconcilerRuntime started"
        );

        Ok(ReconcilerRuntime {
            loops,
            lease_keeper,
            leader,
        })
    }
}

/// A running set of reconciliation loops.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ReconcilerRuntime {
    loops: Vec<TaskHandle>,
    lease_keeper: Option<TaskHandle>,
    leader: Arc<dyn LeaderGate>,
}

impl ReconcilerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ReconcilerRuntimeBuilder {
        ReconcilerRuntimeBuilder::new()
    }

    /// Whether this process currently leads.
    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Names of the running loops.
    pub fn activities(&self) -> Vec<&'static str> {
        self.loops.iter().map(|l| l.name).collect()
    }

    /// Check if every task is still running.
    pub fn is_running(&self) -> bool {
        self.loops.iter().all(|l| !l.handle.is_finished())
            && self
                .lease_keeper
                .as_ref()
                .is_none_or(|k| !k.handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Loops finish their current tick first. The lease is released last.
    pub async fn shutdown(self) -> Result<()> {
        info!("ReconcilerRuntime shutting down...");

        for task in &self.loops {
            task.shutdown.notify_one();
        }
        for task in self.loops {
            if let Err(e) = task.handle.await {
                error!("{} loop task panicked: {}", task.name, e);
            }
        }

        if let Some(keeper) = self.lease_keeper {
            keeper.shutdown.notify_one();
            if let Err(e) = keeper.handle.await {
                error!("{} task panicked: {}", keeper.name, e);
            }
        }

        info!("ReconcilerRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockBillingNotifier, MockRateSource, MockTicketService};
    use tally_core::{MockFlowDelegate, SqliteStore};

    async fn test_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::connect("sqlite::memory:", 1).await.unwrap())
    }

    fn builder(store: Arc<SqliteStore>) -> ReconcilerRuntimeBuilder {
        ReconcilerRuntime::builder()
            .store(store)
            .flow_delegate(Arc::new(MockFlowDelegate::new()))
            .rate_source(Arc::new(MockRateSource::new()))
            .notifier(Arc::new(MockBillingNotifier::new()))
    }

    #[test]
    fn test_build_requires_clients() {
        let err = ReconcilerRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("store is required"));
    }

    #[tokio::test]
    async fn test_build_rejects_short_lease_ttl() {
        let store = test_store().await;

        let err = builder(store.clone())
            .lease_ttl(Duration::from_millis(100))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("lease_ttl"));

        // Only lease mode renews a lease.
        assert!(
            builder(store.clone())
                .leader_mode(LeaderMode::Always)
                .lease_ttl(Duration::from_millis(100))
                .build()
                .is_ok()
        );
        assert!(builder(store).lease_ttl(MIN_LEASE_TTL).build().is_ok());
    }

    #[tokio::test]
    async fn test_watcher_only_with_ticket_service() {
        let store = test_store().await;

        let runtime = builder(store.clone())
            .leader_mode(LeaderMode::Never)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert_eq!(runtime.activities(), vec!["bill_sync", "exchange_rate"]);
        assert!(!runtime.is_leader());
        runtime.shutdown().await.unwrap();

        let runtime = builder(store)
            .leader_mode(LeaderMode::Always)
            .ticket_service(Arc::new(MockTicketService::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert_eq!(
            runtime.activities(),
            vec!["bill_sync", "exchange_rate", "sub_ticket"]
        );
        assert!(runtime.is_leader());
        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_unreachable_store() {
        let store = test_store().await;
        store.pool().close().await;

        let err = builder(store)
            .leader_mode(LeaderMode::Always)
            .build()
            .unwrap()
            .start()
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("health check"));
    }

    #[tokio::test]
    async fn test_lease_mode_acquires_and_releases() {
        let store = test_store().await;
        let runtime = builder(store.clone())
            .instance_id("a")
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        for _ in 0..50 {
            if runtime.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runtime.is_leader());
        assert!(
            !store
                .try_acquire_lease(LEASE_RESOURCE, "b", Duration::from_secs(30))
                .await
                .unwrap()
        );

        runtime.shutdown().await.unwrap();
        assert!(
            store
                .try_acquire_lease(LEASE_RESOURCE, "b", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }
}
