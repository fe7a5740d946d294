// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory flow delegate for tests and local runs.
//!
//! Flows report `Running` for a configurable number of polls and then their
//! outcome. Outcomes default to `Success`; a predicate can make the first
//! matching flow fail once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{FlowDelegate, FlowError, FlowState, TaskSpec};

type TaskPredicate = Box<dyn Fn(&TaskSpec) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct MockFlow {
    polls_left: u32,
    outcome: FlowState,
}

/// Scripted, in-memory [`FlowDelegate`].
pub struct MockFlowDelegate {
    flows: Mutex<HashMap<String, MockFlow>>,
    created: Mutex<Vec<TaskSpec>>,
    next_id: AtomicU64,
    /// Polls answered with `Running` before the outcome is reported.
    pub pending_polls: u32,
    fail_once: Mutex<Option<TaskPredicate>>,
    unavailable: AtomicBool,
    rejecting_creates: AtomicBool,
}

impl Default for MockFlowDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFlowDelegate {
    /// Every flow succeeds on its first poll.
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending_polls: 0,
            fail_once: Mutex::new(None),
            unavailable: AtomicBool::new(false),
            rejecting_creates: AtomicBool::new(false),
        }
    }

    /// Flows stay `Running` for `polls` polls first.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// The first flow created for a matching task fails; later ones succeed.
    pub fn fail_once_where(
        self,
        predicate: impl Fn(&TaskSpec) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            fail_once: Mutex::new(Some(Box::new(predicate))),
            ..self
        }
    }

    /// Make every call fail with a request error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only `create_flow` fail; polling keeps working.
    pub fn set_rejecting_creates(&self, rejecting: bool) {
        self.rejecting_creates.store(rejecting, Ordering::SeqCst);
    }

    /// Force the outcome of an existing flow.
    pub async fn set_outcome(&self, flow_id: &str, outcome: FlowState) {
        if let Some(flow) = self.flows.lock().await.get_mut(flow_id) {
            flow.outcome = outcome;
            flow.polls_left = 0;
        }
    }

    /// Tasks submitted so far, in order.
    pub async fn created(&self) -> Vec<TaskSpec> {
        self.created.lock().await.clone()
    }

    fn check_available(&self) -> Result<(), FlowError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlowError::Request("flow service unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FlowDelegate for MockFlowDelegate {
    async fn create_flow(&self, task: &TaskSpec) -> Result<String, FlowError> {
        self.check_available()?;
        if self.rejecting_creates.load(Ordering::SeqCst) {
            return Err(FlowError::Request("flow creation rejected".to_string()));
        }

        let outcome = {
            let mut fail_once = self.fail_once.lock().await;
            if fail_once.as_ref().is_some_and(|predicate| predicate(task)) {
                *fail_once = None;
                FlowState::Failed
            } else {
                FlowState::Success
            }
        };

        let flow_id = format!("flow-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.flows.lock().await.insert(
            flow_id.clone(),
            MockFlow {
                polls_left: self.pending_polls,
                outcome,
            },
        );
        self.created.lock().await.push(task.clone());
        Ok(flow_id)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<FlowState, FlowError> {
        self.check_available()?;

        let mut flows = self.flows.lock().await;
        let flow = flows.get_mut(flow_id).ok_or_else(|| FlowError::NotFound {
            flow_id: flow_id.to_string(),
        })?;

        if flow.polls_left > 0 {
            flow.polls_left -= 1;
            return Ok(FlowState::Running);
        }
        Ok(flow.outcome)
    }
}
