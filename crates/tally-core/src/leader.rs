// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leader gates.
//!
//! Every reconciliation tick asks its gate whether this process is the
//! singleton owner of the loop. The answer may be stale for up to one renewal
//! period; controllers tolerate that because every write they make is
//! idempotent or CAS-guarded.
//!
//! ```text
//! ┌─────────────┐   try_acquire_lease()   ┌─────────────┐
//! │  Follower   │ ──────────────────────▶ │   Leader    │
//! └─────────────┘     (lease granted)     └─────────────┘
//!       ▲                                        │
//!       │   lease lost / released                │ renew every ttl / 3
//!       └────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::persistence::Store;

/// Shortest lease TTL the runtime accepts.
pub const MIN_LEASE_TTL: Duration = Duration::from_millis(300);

/// Answers whether this process currently owns a reconciliation loop.
pub trait LeaderGate: Send + Sync + 'static {
    /// Non-blocking leadership check.
    fn is_leader(&self) -> bool;
}

/// A gate with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticLeaderGate(bool);

impl StaticLeaderGate {
    /// Always leader (single replica deployments).
    pub fn always() -> Self {
        Self(true)
    }

    /// Never leader (standby replicas).
    pub fn never() -> Self {
        Self(false)
    }
}

impl LeaderGate for StaticLeaderGate {
    fn is_leader(&self) -> bool {
        self.0
    }
}

/// A gate backed by a lease row in the store.
///
/// [`LeaseLeaderGate::run`] keeps the lease alive in the background;
/// [`LeaderGate::is_leader`] only reads the cached outcome of the last
/// renewal.
pub struct LeaseLeaderGate {
    store: Arc<dyn Store>,
    resource: String,
    holder: String,
    ttl: Duration,
    leader: AtomicBool,
    shutdown: Arc<Notify>,
}

impl LeaseLeaderGate {
    /// Create a gate for `resource`, held under the name `holder`.
    pub fn new(
        store: Arc<dyn Store>,
        resource: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            resource: resource.into(),
            holder: holder.into(),
            ttl,
            leader: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop [`LeaseLeaderGate::run`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// How often the lease is renewed. Always well inside the TTL.
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Try to acquire or renew the lease once and cache the outcome.
    ///
    /// A store error counts as lost leadership.
    pub async fn renew(&self) -> bool {
        let acquired = match self
            .store
            .try_acquire_lease(&self.resource, &self.holder, self.ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(
                    resource = %self.resource,
                    error = %e,
                    "Lease renewal failed, stepping down"
                );
                false
            }
        };

        let was_leader = self.leader.swap(acquired, Ordering::SeqCst);
        match (was_leader, acquired) {
            (false, true) => info!(
                resource = %self.resource,
                holder = %self.holder,
                "Acquired leadership"
            ),
            (true, false) => warn!(
                resource = %self.resource,
                holder = %self.holder,
                "Lost leadership"
            ),
            _ => debug!(resource = %self.resource, leader = acquired, "Lease checked"),
        }
        acquired
    }

    /// Keep the lease alive until shutdown, then release it.
    pub async fn run(&self) {
        info!(
            resource = %self.resource,
            holder = %self.holder,
            ttl_ms = self.ttl.as_millis() as u64,
            "Lease keeper started"
        );

        loop {
            self.renew().await;

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(resource = %self.resource, "Lease keeper shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.renew_interval()) => {}
            }
        }

        self.leader.store(false, Ordering::SeqCst);
        if let Err(e) = self.store.release_lease(&self.resource, &self.holder).await {
            warn!(resource = %self.resource, error = %e, "Failed to release lease");
        }
    }
}

impl LeaderGate for LeaseLeaderGate {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
