//! Approval gate: barrier evaluation and the reviewer-facing coordinator.
//!
//! A barrier step (e.g. `welcome_email`) may start only after every gated
//! step it waits on has completed and had its latest approval request
//! approved. Decisions themselves are applied by the workflow's driver, so a
//! decision and a concurrent step completion never race.

use uuid::Uuid;

use crate::error::ApprovalError;

use super::engine::WorkflowEngine;
use super::model::{ApprovalRequest, ApprovalStatus, Decision, Step, StepStatus, StepType};

/// Where a barrier stands relative to its gated steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// No gated step has produced output awaiting review.
    NotReached,
    /// At least one gated step is waiting on a reviewer or a regeneration.
    Awaiting,
    /// Every gated step is completed and approved.
    Cleared,
}

/// Evaluate a barrier over the workflow's current steps.
pub fn barrier_state(gated: &[StepType], steps: &[Step]) -> BarrierState {
    let gated_steps: Vec<&Step> = steps
        .iter()
        .filter(|s| gated.contains(&s.step_type))
        .collect();

    if gated_steps.len() == gated.len() && gated_steps.iter().all(|s| s.is_cleared()) {
        return BarrierState::Cleared;
    }
    if gated_steps.iter().any(|s| is_unresolved(s)) {
        return BarrierState::Awaiting;
    }
    BarrierState::NotReached
}

/// A gated step whose output is waiting on a reviewer or on regeneration.
pub fn is_unresolved(step: &Step) -> bool {
    step.requires_approval
        && match step.approval_status {
            Some(ApprovalStatus::Pending) => step.status == StepStatus::Completed,
            Some(ApprovalStatus::RevisionRequested) => true,
            _ => false,
        }
}

/// Whether a workflow should report `awaiting_approval`.
pub fn has_unresolved_approvals(steps: &[Step]) -> bool {
    steps.iter().any(is_unresolved)
}

/// Reviewer-facing API over approval requests.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    engine: WorkflowEngine,
}

impl ApprovalCoordinator {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }

    /// Apply a reviewer decision. See `WorkflowEngine::resolve_approval`.
    pub async fn resolve(
        &self,
        approval_id: Uuid,
        decision: Decision,
        reviewer: Option<String>,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.engine
            .resolve_approval(approval_id, decision, reviewer, notes)
            .await
    }

    pub async fn get(&self, approval_id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.engine
            .store()
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound { id: approval_id })
    }

    /// All requests, optionally filtered by status, newest first.
    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        Ok(self.engine.store().list_approvals(status).await?)
    }

    /// Pending requests across all workflows, newest first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.list(Some(ApprovalStatus::Pending)).await
    }

    pub async fn pending_count(&self) -> Result<u64, ApprovalError> {
        Ok(self.engine.store().count_pending_approvals().await?)
    }

    /// Every request raised for an employee, newest first.
    pub async fn for_employee(&self, employee_id: &str) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        Ok(self
            .engine
            .store()
            .list_approvals_for_employee(employee_id)
            .await?)
    }
}
