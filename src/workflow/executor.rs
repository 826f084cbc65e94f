//! Step executor: runs one step against its collaborator.
//!
//! Stateless: it builds a payload or a classified failure and hands it back.
//! The engine alone writes to the store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::{Collaborators, EmployeeContext};
use crate::error::CollaboratorError;

use super::catalog::{CollaboratorBinding, StepCatalog};
use super::model::{FailureReason, Step, StepStatus, StepType};

/// Default ceiling on a single collaborator call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest single backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// In-executor retry for transient collaborator failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles thereafter.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Everything a step needs from its workflow to run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub employee_id: String,
    pub step_type: StepType,
    /// From the `parse_data` payload; absent only for `parse_data` itself.
    pub employee: Option<EmployeeContext>,
    /// From the `detect_jurisdiction` payload.
    pub jurisdiction: Option<String>,
    pub revision_notes: Option<String>,
}

impl StepContext {
    /// Assemble the context for `step_type` from the workflow's current steps.
    pub fn from_steps(workflow_id: Uuid, employee_id: &str, step_type: StepType, steps: &[Step]) -> Self {
        let completed = |t: StepType| {
            steps
                .iter()
                .find(|s| s.step_type == t && s.status == StepStatus::Completed)
                .and_then(|s| s.result.as_ref())
        };

        let employee = completed(StepType::ParseData)
            .and_then(|payload| payload.get("employee"))
            .and_then(|v| serde_json::from_value::<EmployeeContext>(v.clone()).ok());
        let jurisdiction = completed(StepType::DetectJurisdiction)
            .and_then(|payload| payload.get("jurisdiction"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let revision_notes = steps
            .iter()
            .find(|s| s.step_type == step_type)
            .and_then(|s| s.revision_notes.clone());

        Self {
            workflow_id,
            employee_id: employee_id.to_string(),
            step_type,
            employee,
            jurisdiction,
            revision_notes,
        }
    }
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Whether `RetryFailed` may re-run the step. False fails the workflow.
    pub retryable: bool,
    pub attempts: u32,
}

impl StepFailure {
    pub fn from_error(err: &CollaboratorError, attempts: u32) -> Self {
        let reason = match err {
            CollaboratorError::Timeout { .. } => FailureReason::CollaboratorTimeout,
            CollaboratorError::InvalidEmployee(_) => FailureReason::InvalidEmployeeData,
            CollaboratorError::Failed { retryable: false, .. } => FailureReason::CollaboratorRejected,
            CollaboratorError::Failed { .. } | CollaboratorError::InvalidResponse { .. } => {
                FailureReason::CollaboratorError
            }
        };
        Self {
            reason,
            message: err.to_string(),
            retryable: err.is_retryable() && reason.is_retryable(),
            attempts,
        }
    }

    /// The collaborator task panicked or was cancelled.
    pub fn aborted(detail: impl std::fmt::Display) -> Self {
        Self {
            reason: FailureReason::CollaboratorError,
            message: format!("step task aborted: {detail}"),
            retryable: true,
            attempts: 1,
        }
    }
}

/// Result of one step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    Failed(StepFailure),
}

/// Runs steps against collaborators with a per-call timeout and bounded retries.
pub struct StepExecutor {
    collaborators: Arc<dyn Collaborators>,
    catalog: StepCatalog,
    timeout: Duration,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(collaborators: Arc<dyn Collaborators>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            collaborators,
            catalog: StepCatalog::onboarding(),
            timeout,
            retry,
        }
    }

    /// Execute a step, retrying transient failures with exponential backoff.
    pub async fn execute(&self, ctx: &StepContext) -> StepOutcome {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_once(ctx).await {
                Ok(payload) => {
                    debug!(workflow_id = %ctx.workflow_id, step = %ctx.step_type, attempt, "Step produced payload");
                    return StepOutcome::Completed(payload);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        workflow_id = %ctx.workflow_id,
                        step = %ctx.step_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient collaborator failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return StepOutcome::Failed(StepFailure::from_error(&e, attempt)),
            }
        }
    }

    async fn execute_once(&self, ctx: &StepContext) -> Result<Value, CollaboratorError> {
        match tokio::time::timeout(self.timeout, self.invoke(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                step: ctx.step_type,
                timeout: self.timeout,
            }),
        }
    }

    async fn invoke(&self, ctx: &StepContext) -> Result<Value, CollaboratorError> {
        let binding = self
            .catalog
            .get(ctx.step_type)
            .map(|def| def.collaborator)
            .ok_or_else(|| CollaboratorError::InvalidResponse {
                collaborator: "catalog".into(),
                reason: format!("no definition for step {}", ctx.step_type),
            })?;
        let c = &self.collaborators;

        let employee = || {
            ctx.employee.as_ref().ok_or_else(|| {
                CollaboratorError::InvalidEmployee(format!(
                    "no parsed employee record available for {}",
                    ctx.step_type
                ))
            })
        };

        let payload = match binding {
            CollaboratorBinding::LoadEmployee => {
                let employee = c.load_employee(&ctx.employee_id).await?;
                employee.validate()?;
                json!({ "employee": employee, "validation": "passed" })
            }
            CollaboratorBinding::DetectJurisdiction => {
                let jurisdiction = c.detect_jurisdiction(employee()?).await?;
                json!({ "jurisdiction": jurisdiction })
            }
            CollaboratorBinding::GenerateDocument(kind) => {
                let jurisdiction = ctx.jurisdiction.as_deref().ok_or_else(|| {
                    CollaboratorError::InvalidResponse {
                        collaborator: "jurisdiction".into(),
                        reason: format!("no jurisdiction detected before {}", ctx.step_type),
                    }
                })?;
                let content = c
                    .generate_document(kind, employee()?, jurisdiction, ctx.revision_notes.as_deref())
                    .await?;
                json!({ "type": kind, "jurisdiction": jurisdiction, "content": content })
            }
            CollaboratorBinding::ComposeWelcomeEmail => {
                json!({ "type": "welcome_email", "content": c.compose_welcome_email(employee()?).await? })
            }
            CollaboratorBinding::ComposePlan => {
                json!({ "type": "plan_30_60_90", "content": c.compose_plan(employee()?).await? })
            }
            CollaboratorBinding::ScheduleCalendarEvents => {
                json!({ "type": "calendar_events", "events": c.schedule_calendar_events(employee()?).await? })
            }
            CollaboratorBinding::ComposeEquipmentRequest => {
                json!({ "type": "equipment_request", "content": c.compose_equipment_request(employee()?).await? })
            }
        };
        Ok(payload)
    }
}
