//! Shared fixtures for engine integration tests.
//!
//! `ScriptedCollaborators` answers every collaborator call with canned
//! content. Individual steps can be delayed, held until released, or made to
//! fail a fixed number of times.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Semaphore;
use uuid::Uuid;

use onboarding_orchestrator::collaborators::{CalendarEvent, Collaborators, DocumentKind, EmployeeContext};
use onboarding_orchestrator::error::CollaboratorError;
use onboarding_orchestrator::store::{LibSqlBackend, WorkflowStore};
use onboarding_orchestrator::workflow::{
    ApprovalStatus, Decision, EventChannel, RetryPolicy, StepExecutor, StepType, WorkflowEngine,
    WorkflowEvent, WorkflowSnapshot, WorkflowStatus,
};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A recorded collaborator call.
#[derive(Debug, Clone)]
pub struct Call {
    pub step: StepType,
    pub revision_notes: Option<String>,
}

#[derive(Default)]
struct Script {
    delays: HashMap<StepType, Duration>,
    failures: HashMap<StepType, VecDeque<CollaboratorError>>,
    calls: Vec<Call>,
    invalid_employee: bool,
}

/// Deterministic collaborator stub.
#[derive(Default)]
pub struct ScriptedCollaborators {
    script: Mutex<Script>,
    holds: Mutex<HashMap<StepType, Arc<Semaphore>>>,
}

impl ScriptedCollaborators {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay(&self, step: StepType, delay: Duration) {
        self.script.lock().unwrap().delays.insert(step, delay);
    }

    /// Fail the next `times` calls for `step`.
    pub fn fail(&self, step: StepType, times: usize, retryable: bool) {
        let mut script = self.script.lock().unwrap();
        let queue = script.failures.entry(step).or_default();
        for _ in 0..times {
            queue.push_back(CollaboratorError::Failed {
                collaborator: step.to_string(),
                reason: "scripted failure".into(),
                retryable,
            });
        }
    }

    pub fn invalid_employee(&self) {
        self.script.lock().unwrap().invalid_employee = true;
    }

    /// Block calls for `step` until `release` is called.
    pub fn hold(&self, step: StepType) {
        self.holds
            .lock()
            .unwrap()
            .insert(step, Arc::new(Semaphore::new(0)));
    }

    /// Let one held call for `step` through.
    pub fn release(&self, step: StepType) {
        if let Some(sem) = self.holds.lock().unwrap().get(&step) {
            sem.add_permits(1);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, step: StepType) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.step == step).collect()
    }

    async fn enter(&self, step: StepType, revision_notes: Option<&str>) -> Result<(), CollaboratorError> {
        let (delay, failure) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call {
                step,
                revision_notes: revision_notes.map(String::from),
            });
            let failure = script.failures.get_mut(&step).and_then(|q| q.pop_front());
            (script.delays.get(&step).copied(), failure)
        };

        let hold = self.holds.lock().unwrap().get(&step).cloned();
        if let Some(sem) = hold {
            sem.acquire().await.unwrap().forget();
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn employee(employee_id: &str) -> EmployeeContext {
    EmployeeContext {
        employee_id: employee_id.to_string(),
        name: "Ada Lovelace".into(),
        email: "ada@example.com".into(),
        role: "Engineer".into(),
        department: "R&D".into(),
        start_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        manager_email: Some("grace@example.com".into()),
        buddy_email: None,
        jurisdiction: None,
    }
}

fn document_step(kind: DocumentKind) -> StepType {
    match kind {
        DocumentKind::EmploymentContract => StepType::EmploymentContract,
        DocumentKind::Nda => StepType::Nda,
        DocumentKind::EquityAgreement => StepType::EquityAgreement,
        DocumentKind::OfferLetter => StepType::OfferLetter,
    }
}

#[async_trait]
impl Collaborators for ScriptedCollaborators {
    async fn load_employee(&self, employee_id: &str) -> Result<EmployeeContext, CollaboratorError> {
        self.enter(StepType::ParseData, None).await?;
        let mut employee = employee(employee_id);
        if self.script.lock().unwrap().invalid_employee {
            employee.email = String::new();
        }
        Ok(employee)
    }

    async fn detect_jurisdiction(&self, _employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        self.enter(StepType::DetectJurisdiction, None).await?;
        Ok("US-CA".into())
    }

    async fn generate_document(
        &self,
        kind: DocumentKind,
        employee: &EmployeeContext,
        jurisdiction: &str,
        revision_notes: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        self.enter(document_step(kind), revision_notes).await?;
        Ok(match revision_notes {
            Some(notes) => format!("{kind} for {} ({jurisdiction}), revised: {notes}", employee.name),
            None => format!("{kind} for {} ({jurisdiction})", employee.name),
        })
    }

    async fn compose_welcome_email(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        self.enter(StepType::WelcomeEmail, None).await?;
        Ok(format!("Welcome aboard, {}!", employee.name))
    }

    async fn compose_plan(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        self.enter(StepType::Plan306090, None).await?;
        Ok(format!("30/60/90 plan for {}", employee.role))
    }

    async fn schedule_calendar_events(
        &self,
        employee: &EmployeeContext,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        self.enter(StepType::ScheduleEvents, None).await?;
        Ok(vec![CalendarEvent {
            kind: "orientation".into(),
            title: format!("Orientation for {}", employee.name),
            scheduled: true,
            attendees: vec![employee.email.clone()],
        }])
    }

    async fn compose_equipment_request(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        self.enter(StepType::EquipmentRequest, None).await?;
        Ok(format!("Laptop for {}", employee.department))
    }
}

/// Engine plus the pieces tests poke at directly.
pub struct Harness {
    pub engine: WorkflowEngine,
    pub store: Arc<dyn WorkflowStore>,
    pub collaborators: Arc<ScriptedCollaborators>,
}

pub fn build_engine(
    store: Arc<dyn WorkflowStore>,
    collaborators: Arc<ScriptedCollaborators>,
    retry: RetryPolicy,
) -> WorkflowEngine {
    let executor = Arc::new(StepExecutor::new(
        collaborators,
        Duration::from_secs(5),
        retry,
    ));
    WorkflowEngine::new(store, executor, EventChannel::new(256))
}

/// Engine over an in-memory store, without executor retries.
pub async fn harness() -> Harness {
    harness_with(ScriptedCollaborators::new()).await
}

pub async fn harness_with(collaborators: Arc<ScriptedCollaborators>) -> Harness {
    let store: Arc<dyn WorkflowStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let engine = build_engine(store.clone(), collaborators.clone(), RetryPolicy::none());
    Harness {
        engine,
        store,
        collaborators,
    }
}

/// Run a test body under `TEST_TIMEOUT`.
pub async fn within<F: Future>(body: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, body)
        .await
        .expect("test timed out")
}

/// Poll the snapshot until `pred` holds.
pub async fn wait_for(
    engine: &WorkflowEngine,
    workflow_id: Uuid,
    pred: impl Fn(&WorkflowSnapshot) -> bool,
) -> WorkflowSnapshot {
    loop {
        let snapshot = engine.snapshot(workflow_id).await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(engine: &WorkflowEngine, workflow_id: Uuid, status: WorkflowStatus) -> WorkflowSnapshot {
    wait_for(engine, workflow_id, |s| s.workflow.status == status).await
}

/// Wait until at least `count` approval requests are pending.
pub async fn wait_for_pending(engine: &WorkflowEngine, workflow_id: Uuid, count: usize) -> WorkflowSnapshot {
    wait_for(engine, workflow_id, |s| s.pending_approvals().count() >= count).await
}

/// Approve every pending request as it appears, until the workflow closes.
pub fn spawn_auto_approver(engine: WorkflowEngine, workflow_id: Uuid) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok(snapshot) = engine.snapshot(workflow_id).await else {
                return;
            };
            if snapshot.workflow.status.is_terminal() {
                return;
            }
            for approval in snapshot.approvals.iter().filter(|a| a.status == ApprovalStatus::Pending) {
                let _ = engine
                    .resolve_approval(approval.id, Decision::Approve, Some("auto".into()), None)
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

/// Drain a subscription until `done`.
pub async fn collect_events(mut subscription: onboarding_orchestrator::workflow::Subscription) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        events.push(event);
    }
    events
}
