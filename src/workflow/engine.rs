//! Workflow engine: one driver task per active workflow.
//!
//! The driver is the only writer of its workflow's state. Step completions,
//! operator commands and reviewer decisions all arrive on the driver's
//! channels and are applied one at a time, each persisted before the event
//! describing it is published. After every message the driver re-reads the
//! workflow, derives its status and dispatches the ready set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ApprovalError, DatabaseError, WorkflowError};
use crate::store::WorkflowStore;

use super::approval::{self, BarrierState};
use super::catalog::StepCatalog;
use super::events::{EventChannel, GateTransition, Subscription, WorkflowEvent};
use super::executor::{StepContext, StepExecutor, StepFailure, StepOutcome};
use super::model::{
    ApprovalRequest, ApprovalStatus, Decision, FailureReason, Step, StepStatus, StepType, Workflow,
    WorkflowSnapshot, WorkflowStatus,
};

/// Buffered commands per driver.
const COMMAND_CAPACITY: usize = 32;

/// How often a command is re-routed when its driver goes away mid-flight.
const ROUTE_ATTEMPTS: usize = 3;

type Reply<T> = oneshot::Sender<T>;

/// Requests applied by a workflow's driver.
enum Command {
    Pause(Reply<Result<(), WorkflowError>>),
    Resume(Reply<Result<(), WorkflowError>>),
    RetryFailed(Reply<Result<Vec<StepType>, WorkflowError>>),
    Resolve {
        approval_id: Uuid,
        decision: Decision,
        reviewer: Option<String>,
        notes: Option<String>,
        reply: Reply<Result<ApprovalRequest, ApprovalError>>,
    },
}

impl Command {
    /// Answer a command for a workflow that has no driver because it is closed.
    fn reject_closed(self, workflow: &Workflow) {
        let (id, status) = (workflow.id, workflow.status);
        match self {
            Self::Pause(reply) => {
                let _ = reply.send(Err(WorkflowError::NotRunning { id, status }));
            }
            Self::Resume(reply) => {
                let _ = reply.send(Err(WorkflowError::NotPaused { id, status }));
            }
            Self::RetryFailed(reply) => {
                let err = if status == WorkflowStatus::Completed {
                    WorkflowError::NoFailedSteps { id }
                } else {
                    WorkflowError::Closed { id, status }
                };
                let _ = reply.send(Err(err));
            }
            Self::Resolve {
                approval_id, reply, ..
            } => {
                let _ = reply.send(Err(ApprovalError::WorkflowClosed {
                    id: approval_id,
                    workflow_id: id,
                }));
            }
        }
    }
}

enum Route {
    Driver(mpsc::Sender<Command>),
    Closed(Workflow),
}

/// Outcome of one step execution, reported back to the driver.
struct Completion {
    step_type: StepType,
    outcome: StepOutcome,
}

/// What `recover` found and restarted.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Steps that were `running` when the process stopped, now failed.
    pub interrupted: Vec<(Uuid, StepType)>,
    /// Workflows whose drivers were restarted.
    pub resumed: Vec<Uuid>,
}

struct EngineInner {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<StepExecutor>,
    events: Arc<EventChannel>,
    catalog: StepCatalog,
    drivers: Mutex<HashMap<Uuid, mpsc::Sender<Command>>>,
}

/// Handle to the workflow engine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<StepExecutor>,
        events: Arc<EventChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                executor,
                events,
                catalog: StepCatalog::onboarding(),
                drivers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.inner.store
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.inner.catalog
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Create a workflow for an employee and start driving it.
    ///
    /// Returns as soon as the workflow is persisted; steps run in the background.
    pub async fn start(&self, employee_id: &str) -> Result<Uuid, WorkflowError> {
        let store = &self.inner.store;
        if let Some(active) = store.get_active_workflow(employee_id).await? {
            return Err(WorkflowError::AlreadyRunning {
                employee_id: employee_id.to_string(),
                workflow_id: active.id,
            });
        }

        let workflow = Workflow::new(employee_id);
        let steps = self.inner.catalog.seed_steps(workflow.id);
        match store.create_workflow(&workflow, &steps).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(msg)) => {
                // Lost a race with a concurrent start for the same employee.
                return match store.get_active_workflow(employee_id).await? {
                    Some(active) => Err(WorkflowError::AlreadyRunning {
                        employee_id: employee_id.to_string(),
                        workflow_id: active.id,
                    }),
                    None => Err(DatabaseError::Constraint(msg).into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        info!(workflow_id = %workflow.id, employee_id = %employee_id, "Workflow started");
        let mut drivers = self.inner.drivers.lock().await;
        spawn_driver(&self.inner, &mut drivers, workflow.id, workflow.employee_id.clone());
        Ok(workflow.id)
    }

    /// Stop dispatching new steps. In-flight steps still complete and persist.
    pub async fn pause(&self, workflow_id: Uuid) -> Result<(), WorkflowError> {
        self.dispatch(workflow_id, Command::Pause).await?
    }

    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), WorkflowError> {
        self.dispatch(workflow_id, Command::Resume).await?
    }

    /// Reset retryable failed steps to pending. Returns the steps reset.
    pub async fn retry_failed(&self, workflow_id: Uuid) -> Result<Vec<StepType>, WorkflowError> {
        self.dispatch(workflow_id, Command::RetryFailed).await?
    }

    /// Apply a reviewer decision to a pending approval request.
    pub async fn resolve_approval(
        &self,
        approval_id: Uuid,
        decision: Decision,
        reviewer: Option<String>,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let approval = self
            .inner
            .store
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound { id: approval_id })?;
        if approval.status.is_resolved() {
            return Err(ApprovalError::AlreadyResolved {
                id: approval_id,
                status: approval.status,
            });
        }

        self.dispatch(approval.workflow_id, |reply| Command::Resolve {
            approval_id,
            decision,
            reviewer: reviewer.clone(),
            notes: notes.clone(),
            reply,
        })
        .await?
    }

    /// Restart after a crash: fail interrupted steps and re-drive active workflows.
    ///
    /// Call once at startup, before any workflow is started in this process.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        let store = &self.inner.store;
        let interrupted = store.fail_interrupted_steps().await?;
        for (workflow_id, step_type) in &interrupted {
            warn!(workflow_id = %workflow_id, step = %step_type, "Step interrupted by restart, marked failed");
        }

        let active = store.list_active_workflows().await?;
        let mut drivers = self.inner.drivers.lock().await;
        let mut resumed = Vec::with_capacity(active.len());
        for workflow in active {
            if !drivers.contains_key(&workflow.id) {
                spawn_driver(&self.inner, &mut drivers, workflow.id, workflow.employee_id.clone());
                resumed.push(workflow.id);
            }
        }

        info!(
            interrupted = interrupted.len(),
            resumed = resumed.len(),
            "Workflow recovery complete"
        );
        Ok(RecoveryReport {
            interrupted,
            resumed,
        })
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn snapshot(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, WorkflowError> {
        self.inner
            .store
            .snapshot(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound { id: workflow_id })
    }

    /// The employee's most recent workflow, active or not.
    pub async fn latest_for_employee(&self, employee_id: &str) -> Result<WorkflowSnapshot, WorkflowError> {
        let workflow = self
            .inner
            .store
            .get_latest_workflow(employee_id)
            .await?
            .ok_or_else(|| WorkflowError::NoWorkflowForEmployee {
                employee_id: employee_id.to_string(),
            })?;
        self.snapshot(workflow.id).await
    }

    /// Steps whose predecessors and barriers are satisfied. Ignores pause;
    /// empty once the workflow is closed.
    pub async fn ready_set(&self, workflow_id: Uuid) -> Result<Vec<StepType>, WorkflowError> {
        let snapshot = self.snapshot(workflow_id).await?;
        if snapshot.workflow.status.is_terminal() {
            return Ok(Vec::new());
        }
        Ok(self.inner.catalog.ready_set(&snapshot.steps))
    }

    /// Subscribe to a workflow's events, starting with an `init` snapshot.
    pub async fn subscribe(&self, workflow_id: Uuid) -> Result<Subscription, WorkflowError> {
        let events = &self.inner.events;
        let rx = events.subscribe(workflow_id).await;
        match self.inner.store.snapshot(workflow_id).await {
            Ok(Some(snapshot)) => {
                let terminal = snapshot.workflow.status.is_terminal();
                let sub = Subscription::new(snapshot, rx, self.inner.store.clone());
                if terminal {
                    events.close_if_idle(workflow_id).await;
                }
                Ok(sub)
            }
            Ok(None) => {
                drop(rx);
                events.close_if_idle(workflow_id).await;
                Err(WorkflowError::NotFound { id: workflow_id })
            }
            Err(e) => {
                drop(rx);
                events.close_if_idle(workflow_id).await;
                Err(e.into())
            }
        }
    }

    /// Number of live drivers.
    pub async fn active_drivers(&self) -> usize {
        self.inner.drivers.lock().await.len()
    }

    // ── Routing ─────────────────────────────────────────────────────

    async fn dispatch<R>(
        &self,
        workflow_id: Uuid,
        make: impl Fn(Reply<R>) -> Command,
    ) -> Result<R, WorkflowError> {
        for _ in 0..ROUTE_ATTEMPTS {
            let (reply_tx, reply_rx) = oneshot::channel();
            let command = make(reply_tx);
            match self.route(workflow_id).await? {
                Route::Driver(tx) => {
                    if tx.send(command).await.is_err() {
                        debug!(workflow_id = %workflow_id, "Driver gone, re-routing");
                        continue;
                    }
                }
                Route::Closed(workflow) => command.reject_closed(&workflow),
            }
            if let Ok(result) = reply_rx.await {
                return Ok(result);
            }
        }
        Err(WorkflowError::EngineUnavailable { id: workflow_id })
    }

    /// Find the workflow's driver, starting one if the workflow is active.
    async fn route(&self, workflow_id: Uuid) -> Result<Route, WorkflowError> {
        let mut drivers = self.inner.drivers.lock().await;
        if let Some(tx) = drivers.get(&workflow_id) {
            if !tx.is_closed() {
                return Ok(Route::Driver(tx.clone()));
            }
            drivers.remove(&workflow_id);
        }

        let workflow = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound { id: workflow_id })?;
        if workflow.status.is_terminal() {
            return Ok(Route::Closed(workflow));
        }
        Ok(Route::Driver(spawn_driver(
            &self.inner,
            &mut drivers,
            workflow.id,
            workflow.employee_id.clone(),
        )))
    }
}

fn spawn_driver(
    inner: &Arc<EngineInner>,
    drivers: &mut HashMap<Uuid, mpsc::Sender<Command>>,
    workflow_id: Uuid,
    employee_id: String,
) -> mpsc::Sender<Command> {
    let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        workflow_id,
        employee_id,
        inner: Arc::clone(inner),
        commands,
        completions_tx,
        completions_rx,
        in_flight: HashSet::new(),
    };
    drivers.insert(workflow_id, tx.clone());
    tokio::spawn(driver.run());
    tx
}

// ── Driver ──────────────────────────────────────────────────────────

struct Driver {
    workflow_id: Uuid,
    employee_id: String,
    inner: Arc<EngineInner>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: HashSet<StepType>,
}

impl Driver {
    async fn run(mut self) {
        debug!(workflow_id = %self.workflow_id, "Workflow driver started");
        if let Err(e) = self.reconcile().await {
            error!(workflow_id = %self.workflow_id, error = %e, "Workflow reconciliation failed");
        }

        let mut status = self.settle_logged().await;
        loop {
            if status.is_some_and(|s| s.is_terminal()) && self.in_flight.is_empty() {
                break;
            }
            tokio::select! {
                Some(done) = self.completions_rx.recv() => {
                    let step_type = done.step_type;
                    if let Err(e) = self.on_completion(done).await {
                        error!(workflow_id = %self.workflow_id, step = %step_type, error = %e, "Failed to record step outcome");
                    }
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
                else => break,
            }
            status = self.settle_logged().await;
        }

        self.shutdown().await;
    }

    async fn settle_logged(&mut self) -> Option<WorkflowStatus> {
        match self.settle().await {
            Ok(status) => Some(status),
            Err(e) => {
                error!(workflow_id = %self.workflow_id, error = %e, "Failed to advance workflow");
                None
            }
        }
    }

    async fn publish(&self, event: WorkflowEvent) {
        self.inner.events.publish(self.workflow_id, event).await;
    }

    async fn load_workflow(&self) -> Result<Workflow, WorkflowError> {
        self.inner
            .store
            .get_workflow(self.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound { id: self.workflow_id })
    }

    fn requires_approval(&self, step_type: StepType) -> bool {
        self.inner
            .catalog
            .get(step_type)
            .is_some_and(|def| def.requires_approval)
    }

    /// Derive workflow status from its steps and dispatch the ready set.
    async fn settle(&mut self) -> Result<WorkflowStatus, WorkflowError> {
        let id = self.workflow_id;
        let store = Arc::clone(&self.inner.store);
        let workflow = self.load_workflow().await?;
        if workflow.status.is_terminal() {
            return Ok(workflow.status);
        }
        let steps = store.list_steps(id).await?;

        if !steps.is_empty() && steps.iter().all(|s| s.status.is_done()) {
            if store
                .transition_workflow(id, &WorkflowStatus::ACTIVE, WorkflowStatus::Completed)
                .await?
            {
                info!(workflow_id = %id, employee_id = %self.employee_id, "Workflow completed");
                self.finish(WorkflowStatus::Completed).await;
            }
            return Ok(WorkflowStatus::Completed);
        }

        let desired = match workflow.status {
            WorkflowStatus::Paused => WorkflowStatus::Paused,
            _ if approval::has_unresolved_approvals(&steps) => WorkflowStatus::AwaitingApproval,
            _ => WorkflowStatus::Running,
        };
        let mut status = workflow.status;
        if desired != status && store.transition_workflow(id, &[status], desired).await? {
            status = desired;
            self.announce_status(status).await;
        }

        if status.allows_dispatch() {
            self.dispatch_ready(&steps).await?;
        }
        Ok(status)
    }

    async fn announce_status(&self, status: WorkflowStatus) {
        debug!(workflow_id = %self.workflow_id, status = %status, "Workflow status changed");
        self.publish(WorkflowEvent::WorkflowUpdate {
            workflow_id: self.workflow_id,
            status,
        })
        .await;
        if status == WorkflowStatus::AwaitingApproval {
            self.publish(WorkflowEvent::ApprovalGate {
                workflow_id: self.workflow_id,
                state: GateTransition::Entered,
            })
            .await;
        }
    }

    async fn dispatch_ready(&mut self, steps: &[Step]) -> Result<(), WorkflowError> {
        let ready = self.inner.catalog.ready_set(steps);
        for step_type in ready {
            if self.in_flight.contains(&step_type) {
                continue;
            }
            if !self
                .inner
                .store
                .mark_step_running(self.workflow_id, step_type)
                .await?
            {
                continue;
            }
            info!(workflow_id = %self.workflow_id, step = %step_type, "Step dispatched");
            self.publish(WorkflowEvent::StepUpdate {
                workflow_id: self.workflow_id,
                step_type,
                status: StepStatus::Running,
                error: None,
            })
            .await;

            let ctx = StepContext::from_steps(self.workflow_id, &self.employee_id, step_type, steps);
            self.spawn_step(ctx);
        }
        Ok(())
    }

    fn spawn_step(&mut self, ctx: StepContext) {
        let step_type = ctx.step_type;
        self.in_flight.insert(step_type);
        let executor = Arc::clone(&self.inner.executor);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(async move { executor.execute(&ctx).await });
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => StepOutcome::Failed(StepFailure::aborted(e)),
            };
            let _ = tx.send(Completion { step_type, outcome });
        });
    }

    async fn on_completion(&mut self, done: Completion) -> Result<(), WorkflowError> {
        let Completion { step_type, outcome } = done;
        self.in_flight.remove(&step_type);
        let id = self.workflow_id;
        let store = Arc::clone(&self.inner.store);

        match outcome {
            StepOutcome::Completed(payload) => {
                if !store.complete_step(id, step_type, &payload).await? {
                    warn!(workflow_id = %id, step = %step_type, "Discarding result for step that is no longer running");
                    return Ok(());
                }
                info!(workflow_id = %id, step = %step_type, "Step completed");
                self.publish(WorkflowEvent::StepUpdate {
                    workflow_id: id,
                    step_type,
                    status: StepStatus::Completed,
                    error: None,
                })
                .await;

                if self.requires_approval(step_type) && !self.load_workflow().await?.status.is_terminal() {
                    self.request_approval(step_type).await?;
                }
            }
            StepOutcome::Failed(failure) => {
                if !store.fail_step(id, step_type, failure.reason, &failure.message).await? {
                    warn!(workflow_id = %id, step = %step_type, "Discarding failure for step that is no longer running");
                    return Ok(());
                }
                warn!(
                    workflow_id = %id,
                    step = %step_type,
                    reason = %failure.reason,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Step failed"
                );
                self.publish(WorkflowEvent::StepUpdate {
                    workflow_id: id,
                    step_type,
                    status: StepStatus::Failed,
                    error: Some(failure.message.clone()),
                })
                .await;

                if !failure.retryable {
                    let message = format!("{step_type}: {}", failure.message);
                    self.fail_workflow(failure.reason, &message).await?;
                }
            }
        }
        Ok(())
    }

    async fn fail_workflow(&mut self, reason: FailureReason, message: &str) -> Result<(), WorkflowError> {
        if self
            .inner
            .store
            .fail_workflow(self.workflow_id, reason, message)
            .await?
        {
            error!(workflow_id = %self.workflow_id, reason = %reason, error = %message, "Workflow failed");
            self.publish(WorkflowEvent::Error {
                workflow_id: self.workflow_id,
                reason,
                message: message.to_string(),
            })
            .await;
            self.finish(WorkflowStatus::Failed).await;
        }
        Ok(())
    }

    async fn finish(&self, status: WorkflowStatus) {
        self.publish(WorkflowEvent::WorkflowUpdate {
            workflow_id: self.workflow_id,
            status,
        })
        .await;
        self.publish(WorkflowEvent::Done {
            workflow_id: self.workflow_id,
            status,
        })
        .await;
        self.inner.events.close(self.workflow_id).await;
    }

    /// Raise a new approval request for a just-completed gated step.
    async fn request_approval(&self, step_type: StepType) -> Result<(), WorkflowError> {
        let store = &self.inner.store;
        let step = store
            .get_step(self.workflow_id, step_type)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "step".into(),
                id: format!("{}/{step_type}", self.workflow_id),
            })?;
        let generation = store.count_step_approvals(step.id).await? + 1;
        let approval = ApprovalRequest::for_step(&step, &self.employee_id, generation);
        store.insert_approval(&approval).await?;
        store
            .set_step_approval_status(self.workflow_id, step_type, Some(ApprovalStatus::Pending))
            .await?;

        info!(
            workflow_id = %self.workflow_id,
            approval_id = %approval.id,
            step = %step_type,
            generation,
            "Approval requested"
        );
        self.publish(WorkflowEvent::ApprovalUpdate {
            workflow_id: self.workflow_id,
            approval_id: approval.id,
            step_type,
            status: ApprovalStatus::Pending,
        })
        .await;
        Ok(())
    }

    /// Repair state left behind by a restart between two related writes.
    ///
    /// Seeds steps missing from the workflow, then brings every completed
    /// gated step in line with its latest approval request.
    async fn reconcile(&mut self) -> Result<(), WorkflowError> {
        let store = Arc::clone(&self.inner.store);
        let mut steps = store.list_steps(self.workflow_id).await?;
        if steps.len() < self.inner.catalog.len() {
            let missing: Vec<Step> = self
                .inner
                .catalog
                .seed_steps(self.workflow_id)
                .into_iter()
                .filter(|seed| !steps.iter().any(|s| s.step_type == seed.step_type))
                .collect();
            warn!(workflow_id = %self.workflow_id, missing = missing.len(), "Seeding missing steps");
            store.insert_missing_steps(&missing).await?;
            steps = store.list_steps(self.workflow_id).await?;
        }

        let reviewed: Vec<&Step> = steps
            .iter()
            .filter(|s| s.requires_approval && s.status == StepStatus::Completed)
            .collect();
        if reviewed.is_empty() {
            return Ok(());
        }

        let approvals = store.list_approvals_for_workflow(self.workflow_id).await?;
        for step in reviewed {
            let latest = approvals
                .iter()
                .filter(|a| a.step_id == step.id)
                .max_by_key(|a| a.generation);
            let Some(latest) = latest else {
                self.request_approval(step.step_type).await?;
                continue;
            };

            match (latest.status, step.approval_status) {
                // Regenerated after a revision, new request never raised.
                (ApprovalStatus::RevisionRequested, Some(ApprovalStatus::RevisionRequested)) => {
                    self.request_approval(step.step_type).await?;
                }
                (ApprovalStatus::Pending, Some(ApprovalStatus::Pending))
                | (ApprovalStatus::Approved, Some(ApprovalStatus::Approved)) => {}
                (ApprovalStatus::Pending, _) => {
                    store
                        .set_step_approval_status(self.workflow_id, step.step_type, Some(ApprovalStatus::Pending))
                        .await?;
                }
                (decided, _) => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        approval_id = %latest.id,
                        step = %step.step_type,
                        decision = %decided,
                        "Re-applying approval decision interrupted by restart"
                    );
                    self.apply_decision(step.step_type, decided, latest.notes.as_deref())
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            Command::RetryFailed(reply) => {
                let _ = reply.send(self.retry_failed().await);
            }
            Command::Resolve {
                approval_id,
                decision,
                reviewer,
                notes,
                reply,
            } => {
                let _ = reply.send(self.resolve(approval_id, decision, reviewer, notes).await);
            }
        }
    }

    async fn pause(&mut self) -> Result<(), WorkflowError> {
        let workflow = self.load_workflow().await?;
        let from = [WorkflowStatus::Running, WorkflowStatus::AwaitingApproval];
        if !from.contains(&workflow.status)
            || !self
                .inner
                .store
                .transition_workflow(self.workflow_id, &from, WorkflowStatus::Paused)
                .await?
        {
            return Err(WorkflowError::NotRunning {
                id: self.workflow_id,
                status: workflow.status,
            });
        }
        info!(workflow_id = %self.workflow_id, in_flight = self.in_flight.len(), "Workflow paused");
        self.announce_status(WorkflowStatus::Paused).await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), WorkflowError> {
        let workflow = self.load_workflow().await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(WorkflowError::NotPaused {
                id: self.workflow_id,
                status: workflow.status,
            });
        }
        self.unpause().await?;
        info!(workflow_id = %self.workflow_id, "Workflow resumed");
        Ok(())
    }

    /// paused → running or awaiting_approval, whichever the steps call for.
    async fn unpause(&mut self) -> Result<(), WorkflowError> {
        let steps = self.inner.store.list_steps(self.workflow_id).await?;
        let target = if approval::has_unresolved_approvals(&steps) {
            WorkflowStatus::AwaitingApproval
        } else {
            WorkflowStatus::Running
        };
        if self
            .inner
            .store
            .transition_workflow(self.workflow_id, &[WorkflowStatus::Paused], target)
            .await?
        {
            self.announce_status(target).await;
        }
        Ok(())
    }

    async fn retry_failed(&mut self) -> Result<Vec<StepType>, WorkflowError> {
        let workflow = self.load_workflow().await?;
        if workflow.status.is_terminal() {
            return Err(WorkflowError::Closed {
                id: self.workflow_id,
                status: workflow.status,
            });
        }

        let store = Arc::clone(&self.inner.store);
        let steps = store.list_steps(self.workflow_id).await?;
        let retryable: Vec<&Step> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .filter(|s| s.failure_reason.is_none_or(|r| r.is_retryable()))
            .collect();
        if retryable.is_empty() {
            return Err(WorkflowError::NoFailedSteps { id: self.workflow_id });
        }

        let mut reset = Vec::with_capacity(retryable.len());
        for step in retryable {
            // Keep revision state so a failed regeneration resumes as one.
            if store
                .reset_step(
                    self.workflow_id,
                    step.step_type,
                    StepStatus::Failed,
                    step.approval_status,
                    step.revision_notes.as_deref(),
                )
                .await?
            {
                self.publish(WorkflowEvent::StepUpdate {
                    workflow_id: self.workflow_id,
                    step_type: step.step_type,
                    status: StepStatus::Pending,
                    error: None,
                })
                .await;
                reset.push(step.step_type);
            }
        }

        if workflow.status == WorkflowStatus::Paused {
            self.unpause().await?;
        }
        info!(workflow_id = %self.workflow_id, steps = ?reset, "Failed steps reset for retry");
        Ok(reset)
    }

    async fn resolve(
        &mut self,
        approval_id: Uuid,
        decision: Decision,
        reviewer: Option<String>,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let store = Arc::clone(&self.inner.store);
        let approval = store
            .get_approval(approval_id)
            .await?
            .filter(|a| a.workflow_id == self.workflow_id)
            .ok_or(ApprovalError::NotFound { id: approval_id })?;
        if approval.status.is_resolved() {
            return Err(ApprovalError::AlreadyResolved {
                id: approval_id,
                status: approval.status,
            });
        }
        let workflow = self.load_workflow().await?;
        if workflow.status.is_terminal() {
            return Err(ApprovalError::WorkflowClosed {
                id: approval_id,
                workflow_id: self.workflow_id,
            });
        }

        let status = decision.status();
        if !store
            .resolve_approval(approval_id, status, reviewer.as_deref(), notes.as_deref())
            .await?
        {
            let current = store
                .get_approval(approval_id)
                .await?
                .map(|a| a.status)
                .unwrap_or(status);
            return Err(ApprovalError::AlreadyResolved {
                id: approval_id,
                status: current,
            });
        }

        let step_type = approval.step_type;
        info!(
            workflow_id = %self.workflow_id,
            approval_id = %approval_id,
            step = %step_type,
            decision = %status,
            reviewer = reviewer.as_deref().unwrap_or("-"),
            "Approval resolved"
        );
        self.publish(WorkflowEvent::ApprovalUpdate {
            workflow_id: self.workflow_id,
            approval_id,
            step_type,
            status,
        })
        .await;

        self.apply_decision(step_type, status, notes.as_deref()).await?;

        store
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound { id: approval_id })
    }

    /// Carry a resolved approval over to its step and workflow. Applying the
    /// same decision twice leaves the same state.
    async fn apply_decision(
        &mut self,
        step_type: StepType,
        status: ApprovalStatus,
        notes: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let store = Arc::clone(&self.inner.store);
        match status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Approved => {
                let steps_before = store.list_steps(self.workflow_id).await?;
                store
                    .set_step_approval_status(self.workflow_id, step_type, Some(status))
                    .await?;
                let steps_after = store.list_steps(self.workflow_id).await?;
                let cleared = self.inner.catalog.barriers().any(|barrier| {
                    approval::barrier_state(barrier.approval_barrier, &steps_before) != BarrierState::Cleared
                        && approval::barrier_state(barrier.approval_barrier, &steps_after)
                            == BarrierState::Cleared
                });
                if cleared {
                    info!(workflow_id = %self.workflow_id, "Approval barrier cleared");
                    self.publish(WorkflowEvent::ApprovalGate {
                        workflow_id: self.workflow_id,
                        state: GateTransition::Cleared,
                    })
                    .await;
                }
            }
            ApprovalStatus::Rejected => {
                store
                    .set_step_approval_status(self.workflow_id, step_type, Some(status))
                    .await?;
                let message = match notes {
                    Some(n) if !n.is_empty() => format!("{step_type} rejected: {n}"),
                    _ => format!("{step_type} rejected"),
                };
                self.fail_workflow(FailureReason::ApprovalRejected, &message)
                    .await?;
            }
            ApprovalStatus::RevisionRequested => {
                if store
                    .reset_step(
                        self.workflow_id,
                        step_type,
                        StepStatus::Completed,
                        Some(ApprovalStatus::RevisionRequested),
                        notes,
                    )
                    .await?
                {
                    info!(workflow_id = %self.workflow_id, step = %step_type, "Step queued for regeneration");
                    self.publish(WorkflowEvent::StepUpdate {
                        workflow_id: self.workflow_id,
                        step_type,
                        status: StepStatus::Pending,
                        error: None,
                    })
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Stop accepting commands, answer any still queued, and deregister.
    async fn shutdown(mut self) {
        self.commands.close();
        match self.load_workflow().await {
            Ok(workflow) => {
                while let Ok(command) = self.commands.try_recv() {
                    command.reject_closed(&workflow);
                }
            }
            Err(e) => warn!(workflow_id = %self.workflow_id, error = %e, "Could not reload workflow at shutdown"),
        }

        let mut drivers = self.inner.drivers.lock().await;
        if drivers
            .get(&self.workflow_id)
            .is_some_and(|tx| tx.is_closed())
        {
            drivers.remove(&self.workflow_id);
        }
        debug!(workflow_id = %self.workflow_id, "Workflow driver stopped");
    }
}
