//! `WorkflowStore` trait: single async interface for all persistence.
//!
//! Every status change is a compare-and-set: mutators take the expected
//! current status and return `false` when the row was not in it, so a
//! late or duplicate writer can never move a record backwards.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::workflow::model::{
    ApprovalRequest, ApprovalStatus, FailureReason, Step, StepStatus, StepType, Workflow,
    WorkflowSnapshot, WorkflowStatus,
};

/// Backend-agnostic store for workflows, steps and approval requests.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workflows ───────────────────────────────────────────────────

    /// Insert a workflow with its seeded steps.
    ///
    /// Returns `DatabaseError::Constraint` when the employee already has an
    /// active workflow.
    async fn create_workflow(&self, workflow: &Workflow, steps: &[Step]) -> Result<(), DatabaseError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError>;

    /// The employee's non-terminal workflow, if any.
    async fn get_active_workflow(&self, employee_id: &str) -> Result<Option<Workflow>, DatabaseError>;

    /// The employee's most recently created workflow, active or not.
    async fn get_latest_workflow(&self, employee_id: &str) -> Result<Option<Workflow>, DatabaseError>;

    /// All non-terminal workflows, oldest first.
    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, DatabaseError>;

    /// Move a workflow to `to` if its current status is one of `from`.
    ///
    /// Sets `started_at` on the first move to running and `completed_at` on
    /// any move to a terminal status.
    async fn transition_workflow(
        &self,
        id: Uuid,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> Result<bool, DatabaseError>;

    /// Mark an active workflow failed with a classified reason.
    async fn fail_workflow(
        &self,
        id: Uuid,
        reason: FailureReason,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    // ── Steps ───────────────────────────────────────────────────────

    /// Steps of a workflow in `step_order`.
    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>, DatabaseError>;

    /// Insert step records that do not exist yet; existing
    /// `(workflow_id, step_type)` rows are left untouched.
    async fn insert_missing_steps(&self, steps: &[Step]) -> Result<(), DatabaseError>;

    async fn get_step(&self, workflow_id: Uuid, step_type: StepType) -> Result<Option<Step>, DatabaseError>;

    /// pending → running, incrementing `attempts`.
    async fn mark_step_running(&self, workflow_id: Uuid, step_type: StepType) -> Result<bool, DatabaseError>;

    /// running → completed with the collaborator payload.
    async fn complete_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        result: &Value,
    ) -> Result<bool, DatabaseError>;

    /// running → failed with a classified reason.
    async fn fail_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        reason: FailureReason,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// `from` → pending, clearing result and failure fields.
    async fn reset_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        from: StepStatus,
        approval_status: Option<ApprovalStatus>,
        revision_notes: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Mirror the latest approval decision onto the step.
    async fn set_step_approval_status(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        status: Option<ApprovalStatus>,
    ) -> Result<(), DatabaseError>;

    /// Fail every `running` step with `InterruptedDispatch`. Used on restart.
    async fn fail_interrupted_steps(&self) -> Result<Vec<(Uuid, StepType)>, DatabaseError>;

    // ── Approvals ───────────────────────────────────────────────────

    async fn insert_approval(&self, approval: &ApprovalRequest) -> Result<(), DatabaseError>;

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>, DatabaseError>;

    /// pending → `status`, recording reviewer, notes and `reviewed_at`.
    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reviewer: Option<&str>,
        notes: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// All approval requests, optionally filtered by status, newest first.
    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    /// Approval requests of one workflow, oldest first.
    async fn list_approvals_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    /// Approval requests of one employee across workflows, newest first.
    async fn list_approvals_for_employee(&self, employee_id: &str) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    async fn count_pending_approvals(&self) -> Result<u64, DatabaseError>;

    /// Number of approval requests ever raised for a step.
    async fn count_step_approvals(&self, step_id: Uuid) -> Result<u32, DatabaseError>;

    // ── Read models ─────────────────────────────────────────────────

    /// A workflow with its steps and approvals.
    async fn snapshot(&self, id: Uuid) -> Result<Option<WorkflowSnapshot>, DatabaseError> {
        let Some(workflow) = self.get_workflow(id).await? else {
            return Ok(None);
        };
        let steps = self.list_steps(id).await?;
        let approvals = self.list_approvals_for_workflow(id).await?;
        Ok(Some(WorkflowSnapshot {
            workflow,
            steps,
            approvals,
        }))
    }
}
