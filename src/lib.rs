//! Onboarding orchestrator: DAG-driven onboarding workflows with approval gates.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod store;
pub mod workflow;
