//! Workflow events: per-workflow broadcast with init-first subscriptions.
//!
//! Each workflow gets its own bounded broadcast topic. A subscription always
//! starts with an `init` snapshot, follows with live events in the order the
//! driver persisted them, and ends after `done`. A subscriber that falls
//! behind gets a fresh `init` instead of an unbounded backlog.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::WorkflowStore;

use super::model::{
    ApprovalStatus, FailureReason, StepStatus, StepType, WorkflowSnapshot, WorkflowStatus,
};

/// Default per-workflow broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Whether a barrier was just entered or just cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTransition {
    Entered,
    Cleared,
}

/// Events delivered to workflow subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Full state, sent first on every subscription and after a lag.
    Init { snapshot: WorkflowSnapshot },
    StepUpdate {
        workflow_id: Uuid,
        step_type: StepType,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WorkflowUpdate {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
    ApprovalGate {
        workflow_id: Uuid,
        state: GateTransition,
    },
    ApprovalUpdate {
        workflow_id: Uuid,
        approval_id: Uuid,
        step_type: StepType,
        status: ApprovalStatus,
    },
    Error {
        workflow_id: Uuid,
        reason: FailureReason,
        message: String,
    },
    /// Final event; the stream ends after it.
    Done {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
}

impl WorkflowEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Registry of per-workflow broadcast topics.
pub struct EventChannel {
    capacity: usize,
    topics: RwLock<HashMap<Uuid, broadcast::Sender<WorkflowEvent>>>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        })
    }

    /// Receive future events for a workflow, creating its topic if needed.
    pub async fn subscribe(&self, workflow_id: Uuid) -> broadcast::Receiver<WorkflowEvent> {
        let mut topics = self.topics.write().await;
        topics
            .entry(workflow_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to current subscribers. No-op without a topic.
    pub async fn publish(&self, workflow_id: Uuid, event: WorkflowEvent) {
        let topics = self.topics.read().await;
        if let Some(tx) = topics.get(&workflow_id) {
            // Ok if every subscriber has gone away.
            let _ = tx.send(event);
        }
    }

    /// Drop a workflow's topic. Existing receivers drain buffered events, then close.
    pub async fn close(&self, workflow_id: Uuid) {
        if self.topics.write().await.remove(&workflow_id).is_some() {
            debug!(workflow_id = %workflow_id, "Event topic closed");
        }
    }

    /// Drop a topic nobody listens to.
    pub async fn close_if_idle(&self, workflow_id: Uuid) {
        let mut topics = self.topics.write().await;
        if topics
            .get(&workflow_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(&workflow_id);
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

/// A single subscriber's ordered view of a workflow.
pub struct Subscription {
    workflow_id: Uuid,
    queued: VecDeque<WorkflowEvent>,
    rx: Option<broadcast::Receiver<WorkflowEvent>>,
    store: Arc<dyn WorkflowStore>,
    finished: bool,
}

impl Subscription {
    /// `rx` must have been obtained before `snapshot` was read so no event
    /// between the two is lost.
    pub fn new(
        snapshot: WorkflowSnapshot,
        rx: broadcast::Receiver<WorkflowEvent>,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let workflow_id = snapshot.workflow.id;
        let mut sub = Self {
            workflow_id,
            queued: VecDeque::new(),
            rx: Some(rx),
            store,
            finished: false,
        };
        sub.queue_init(snapshot);
        sub
    }

    fn queue_init(&mut self, snapshot: WorkflowSnapshot) {
        let status = snapshot.workflow.status;
        self.queued.push_back(WorkflowEvent::Init { snapshot });
        if status.is_terminal() {
            self.queued.push_back(WorkflowEvent::Done {
                workflow_id: self.workflow_id,
                status,
            });
            self.rx = None;
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.queued.pop_front() {
                self.finished = event.is_done();
                return Some(event);
            }
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    self.finished = event.is_done();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(workflow_id = %self.workflow_id, skipped = n, "Subscriber lagged, re-syncing");
                    match self.store.snapshot(self.workflow_id).await {
                        Ok(Some(snapshot)) => self.queue_init(snapshot),
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(workflow_id = %self.workflow_id, error = %e, "Re-sync failed");
                            return None;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = WorkflowEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}
