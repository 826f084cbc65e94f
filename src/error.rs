//! Error types for the onboarding orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::workflow::model::{ApprovalStatus, StepType, WorkflowStatus};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Caller-misuse errors from the workflow engine, returned synchronously.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Employee {employee_id} already has an active workflow {workflow_id}")]
    AlreadyRunning {
        employee_id: String,
        workflow_id: Uuid,
    },

    #[error("Workflow {id} is not running (status: {status})")]
    NotRunning { id: Uuid, status: WorkflowStatus },

    #[error("Workflow {id} is not paused (status: {status})")]
    NotPaused { id: Uuid, status: WorkflowStatus },

    #[error("Workflow {id} has no failed steps")]
    NoFailedSteps { id: Uuid },

    #[error("Workflow {id} not found")]
    NotFound { id: Uuid },

    #[error("No workflow found for employee {employee_id}")]
    NoWorkflowForEmployee { employee_id: String },

    #[error("Workflow {id} is closed (status: {status}); start a new workflow")]
    Closed { id: Uuid, status: WorkflowStatus },

    #[error("Driver for workflow {id} is unavailable")]
    EngineUnavailable { id: Uuid },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors from resolving approval requests.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Approval request {id} not found")]
    NotFound { id: Uuid },

    #[error("Approval request {id} already resolved as {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    #[error("Approval request {id} belongs to closed workflow {workflow_id}")]
    WorkflowClosed { id: Uuid, workflow_id: Uuid },

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors raised by an external collaborator call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Collaborator for {step} timed out after {timeout:?}")]
    Timeout { step: StepType, timeout: Duration },

    #[error("Collaborator {collaborator} failed: {reason}")]
    Failed {
        collaborator: String,
        reason: String,
        retryable: bool,
    },

    #[error("Invalid response from {collaborator}: {reason}")]
    InvalidResponse { collaborator: String, reason: String },

    #[error("Invalid employee data: {0}")]
    InvalidEmployee(String),
}

impl CollaboratorError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Failed { retryable, .. } => *retryable,
            Self::InvalidResponse { .. } => true,
            Self::InvalidEmployee(_) => false,
        }
    }
}
