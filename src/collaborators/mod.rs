//! External collaborators: the services that actually produce step output.
//!
//! The engine never talks to an LLM, HR system or calendar directly; it calls
//! through the `Collaborators` trait and treats whatever comes back as an
//! opaque payload.

pub mod http;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

pub use http::HttpCollaborators;

/// Employee record loaded by `parse_data` and threaded into later steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeContext {
    pub employee_id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub department: String,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buddy_email: Option<String>,
    /// Jurisdiction recorded on the HR record, if any. `detect_jurisdiction` has the final say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

impl EmployeeContext {
    /// Check that the record has what document generation needs.
    pub fn validate(&self) -> Result<(), CollaboratorError> {
        let required = [
            ("name", &self.name),
            ("role", &self.role),
            ("department", &self.department),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CollaboratorError::InvalidEmployee(format!(
                    "employee {} is missing {field}",
                    self.employee_id
                )));
            }
        }
        if !looks_like_email(&self.email) {
            return Err(CollaboratorError::InvalidEmployee(format!(
                "employee {} has invalid email '{}'",
                self.employee_id, self.email
            )));
        }
        for (field, value) in [("manager_email", &self.manager_email), ("buddy_email", &self.buddy_email)] {
            if let Some(email) = value.as_deref().filter(|e| !looks_like_email(e)) {
                return Err(CollaboratorError::InvalidEmployee(format!(
                    "employee {} has invalid {field} '{email}'",
                    self.employee_id
                )));
            }
        }
        Ok(())
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

/// Legal document kinds produced by the document generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    EmploymentContract,
    Nda,
    EquityAgreement,
    OfferLetter,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmploymentContract => "employment_contract",
            Self::Nda => "nda",
            Self::EquityAgreement => "equity_agreement",
            Self::OfferLetter => "offer_letter",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar event booked for the new hire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// orientation, manager_1on1, buddy_meetup, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
}

/// The external services a workflow step may call.
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// Load the HR record for an employee.
    async fn load_employee(&self, employee_id: &str) -> Result<EmployeeContext, CollaboratorError>;

    /// Decide which legal jurisdiction applies (e.g. `US-CA`, `UK`).
    async fn detect_jurisdiction(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError>;

    /// Generate a legal document. `revision_notes` carries reviewer feedback on regeneration.
    async fn generate_document(
        &self,
        kind: DocumentKind,
        employee: &EmployeeContext,
        jurisdiction: &str,
        revision_notes: Option<&str>,
    ) -> Result<String, CollaboratorError>;

    async fn compose_welcome_email(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError>;

    /// Compose the 30/60/90-day plan.
    async fn compose_plan(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError>;

    async fn schedule_calendar_events(
        &self,
        employee: &EmployeeContext,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError>;

    async fn compose_equipment_request(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError>;
}
