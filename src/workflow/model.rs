//! Workflow data model: workflows, steps, approval requests and their statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The ten step kinds of the onboarding DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ParseData,
    DetectJurisdiction,
    EmploymentContract,
    Nda,
    EquityAgreement,
    OfferLetter,
    WelcomeEmail,
    #[serde(rename = "plan_30_60_90")]
    Plan306090,
    ScheduleEvents,
    EquipmentRequest,
}

impl StepType {
    /// Every step kind, in catalog order.
    pub const ALL: [StepType; 10] = [
        Self::ParseData,
        Self::DetectJurisdiction,
        Self::EmploymentContract,
        Self::Nda,
        Self::EquityAgreement,
        Self::OfferLetter,
        Self::WelcomeEmail,
        Self::Plan306090,
        Self::ScheduleEvents,
        Self::EquipmentRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseData => "parse_data",
            Self::DetectJurisdiction => "detect_jurisdiction",
            Self::EmploymentContract => "employment_contract",
            Self::Nda => "nda",
            Self::EquityAgreement => "equity_agreement",
            Self::OfferLetter => "offer_letter",
            Self::WelcomeEmail => "welcome_email",
            Self::Plan306090 => "plan_30_60_90",
            Self::ScheduleEvents => "schedule_events",
            Self::EquipmentRequest => "equipment_request",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown step type: {s}"))
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for its predecessors (or for dispatch).
    Pending,
    /// Handed to the executor.
    Running,
    /// Collaborator returned a payload.
    Completed,
    /// Collaborator failed; eligible for retry.
    Failed,
    /// Not executed for this workflow.
    Skipped,
}

impl StepStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Skipped) |
            (Running, Completed) | (Running, Failed) |
            // Retry and revision reset a step to pending
            (Failed, Pending) | (Completed, Pending)
        )
    }

    /// Terminal until an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Completed or skipped; counts toward workflow completion.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown step status: {s}")),
        }
    }
}

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Statuses that count as "active" for the one-workflow-per-employee rule.
    pub const ACTIVE: [WorkflowStatus; 4] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::AwaitingApproval,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the dispatch loop may start new steps in this status.
    pub fn allows_dispatch(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingApproval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown workflow status: {s}")),
        }
    }
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    RevisionRequested,
}

impl ApprovalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RevisionRequested => "revision_requested",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "revision_requested" => Ok(Self::RevisionRequested),
            _ => Err(format!("Unknown approval status: {s}")),
        }
    }
}

/// A reviewer's decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    RequestRevision,
}

impl Decision {
    /// The approval status this decision resolves to.
    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
            Self::RequestRevision => ApprovalStatus::RevisionRequested,
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            "revision" | "revision_requested" | "request_revision" => Ok(Self::RequestRevision),
            _ => Err(format!("Unknown decision: {s}")),
        }
    }
}

/// Classified reason recorded on a failed step or workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    CollaboratorTimeout,
    CollaboratorError,
    /// The collaborator refused the request and flagged it as not worth repeating.
    CollaboratorRejected,
    InterruptedDispatch,
    ApprovalRejected,
    InvalidEmployeeData,
}

impl FailureReason {
    /// Whether `RetryFailed` may reset a step that failed for this reason.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CollaboratorRejected | Self::ApprovalRejected | Self::InvalidEmployeeData
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CollaboratorTimeout => "CollaboratorTimeout",
            Self::CollaboratorError => "CollaboratorError",
            Self::CollaboratorRejected => "CollaboratorRejected",
            Self::InterruptedDispatch => "InterruptedDispatch",
            Self::ApprovalRejected => "ApprovalRejected",
            Self::InvalidEmployeeData => "InvalidEmployeeData",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CollaboratorTimeout" => Ok(Self::CollaboratorTimeout),
            "CollaboratorError" => Ok(Self::CollaboratorError),
            "CollaboratorRejected" => Ok(Self::CollaboratorRejected),
            "InterruptedDispatch" => Ok(Self::InterruptedDispatch),
            "ApprovalRejected" => Ok(Self::ApprovalRejected),
            "InvalidEmployeeData" => Ok(Self::InvalidEmployeeData),
            _ => Err(format!("Unknown failure reason: {s}")),
        }
    }
}

/// One onboarding attempt for one employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub employee_id: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Workflow {
    /// Create a new pending workflow for an employee.
    pub fn new(employee_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            employee_id: employee_id.into(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            error_message: None,
        }
    }
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_type: StepType,
    /// Topological rank, for display only.
    pub step_order: u32,
    pub status: StepStatus,
    /// Collaborator payload, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub requires_approval: bool,
    /// Mirrors the latest approval request for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    /// Reviewer notes carried into a regeneration after `revision_requested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_notes: Option<String>,
    /// Number of times the step has been dispatched.
    pub attempts: u32,
}

impl Step {
    /// Create a pending step record.
    pub fn new(workflow_id: Uuid, step_type: StepType, step_order: u32, requires_approval: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_type,
            step_order,
            status: StepStatus::Pending,
            result: None,
            failure_reason: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            requires_approval,
            approval_status: None,
            revision_notes: None,
            attempts: 0,
        }
    }

    /// Completed and, when gated, approved.
    pub fn is_cleared(&self) -> bool {
        self.status == StepStatus::Completed
            && (!self.requires_approval || self.approval_status == Some(ApprovalStatus::Approved))
    }
}

/// Human review request for one generation of a gated step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub employee_id: String,
    pub step_id: Uuid,
    pub step_type: StepType,
    /// 1 for the first output, incremented per regeneration.
    pub generation: u32,
    /// The reviewed step payload.
    pub document: serde_json::Value,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Create a pending request for a completed step.
    pub fn for_step(step: &Step, employee_id: &str, generation: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: step.workflow_id,
            employee_id: employee_id.to_string(),
            step_id: step.id,
            step_type: step.step_type,
            generation,
            document: step.result.clone().unwrap_or(serde_json::Value::Null),
            status: ApprovalStatus::Pending,
            reviewer: None,
            notes: None,
            created_at: Utc::now(),
            reviewed_at: None,
        }
    }
}

/// Read model: a workflow with its ordered steps and approval requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: Workflow,
    pub steps: Vec<Step>,
    pub approvals: Vec<ApprovalRequest>,
}

impl WorkflowSnapshot {
    /// Look up a step by type.
    pub fn step(&self, step_type: StepType) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_type == step_type)
    }

    /// Approval requests still awaiting a decision.
    pub fn pending_approvals(&self) -> impl Iterator<Item = &ApprovalRequest> {
        self.approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_type_string_roundtrip() {
        for step_type in StepType::ALL {
            let parsed: StepType = step_type.as_str().parse().unwrap();
            assert_eq!(parsed, step_type);
        }
        assert!("welcome".parse::<StepType>().is_err());
    }

    #[test]
    fn step_type_serde_matches_db_strings() {
        let json = serde_json::to_string(&StepType::Plan306090).unwrap();
        assert_eq!(json, "\"plan_30_60_90\"");
        let json = serde_json::to_string(&StepType::DetectJurisdiction).unwrap();
        assert_eq!(json, "\"detect_jurisdiction\"");
    }

    #[test]
    fn step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Failed.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn workflow_terminal_states() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        for status in WorkflowStatus::ACTIVE {
            assert!(status.is_active());
        }
        assert!(WorkflowStatus::AwaitingApproval.allows_dispatch());
        assert!(!WorkflowStatus::Paused.allows_dispatch());
    }

    #[test]
    fn workflow_status_serde() {
        let json = serde_json::to_string(&WorkflowStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        let parsed: WorkflowStatus = "awaiting_approval".parse().unwrap();
        assert_eq!(parsed, WorkflowStatus::AwaitingApproval);
    }

    #[test]
    fn decision_parsing() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("revision".parse::<Decision>().unwrap(), Decision::RequestRevision);
        assert_eq!(Decision::Reject.status(), ApprovalStatus::Rejected);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn failure_reason_retryability() {
        assert!(FailureReason::InterruptedDispatch.is_retryable());
        assert!(FailureReason::CollaboratorTimeout.is_retryable());
        assert!(FailureReason::CollaboratorError.is_retryable());
        assert!(!FailureReason::CollaboratorRejected.is_retryable());
        assert_eq!(
            "CollaboratorRejected".parse::<FailureReason>().unwrap(),
            FailureReason::CollaboratorRejected
        );
        assert!(!FailureReason::ApprovalRejected.is_retryable());
        assert!(!FailureReason::InvalidEmployeeData.is_retryable());
    }

    #[test]
    fn gated_step_cleared_only_when_approved() {
        let mut step = Step::new(Uuid::new_v4(), StepType::Nda, 4, true);
        step.status = StepStatus::Completed;
        assert!(!step.is_cleared());
        step.approval_status = Some(ApprovalStatus::Pending);
        assert!(!step.is_cleared());
        step.approval_status = Some(ApprovalStatus::Approved);
        assert!(step.is_cleared());

        let mut plain = Step::new(Uuid::new_v4(), StepType::ParseData, 1, false);
        plain.status = StepStatus::Completed;
        assert!(plain.is_cleared());
    }
}
