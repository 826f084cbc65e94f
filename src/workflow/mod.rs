//! Onboarding workflow: step catalog, engine, approvals and events.

pub mod approval;
pub mod catalog;
pub mod engine;
pub mod events;
pub mod executor;
pub mod model;
pub mod routes;

pub use approval::ApprovalCoordinator;
pub use catalog::StepCatalog;
pub use engine::{RecoveryReport, WorkflowEngine};
pub use events::{EventChannel, Subscription, WorkflowEvent};
pub use executor::{RetryPolicy, StepExecutor};
pub use model::{
    ApprovalRequest, ApprovalStatus, Decision, FailureReason, Step, StepStatus, StepType, Workflow,
    WorkflowSnapshot, WorkflowStatus,
};
