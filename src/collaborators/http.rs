//! HTTP collaborators: calls a collaborator gateway over JSON/HTTP.
//!
//! One base URL fronts every collaborator:
//!
//! | call                     | endpoint                   |
//! |--------------------------|----------------------------|
//! | load_employee            | `GET  /employees/{id}`     |
//! | detect_jurisdiction      | `POST /jurisdiction`       |
//! | generate_document        | `POST /documents`          |
//! | compose_welcome_email    | `POST /welcome-email`      |
//! | compose_plan             | `POST /plan`               |
//! | compose_equipment_request| `POST /equipment-request`  |
//! | schedule_calendar_events | `POST /calendar-events`    |
//!
//! Transport errors and 5xx responses are retryable; 4xx are not.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{CalendarEvent, Collaborators, DocumentKind, EmployeeContext};
use crate::error::CollaboratorError;

/// Collaborator client backed by `reqwest`.
pub struct HttpCollaborators {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ContentResponse {
    content: String,
}

#[derive(Deserialize)]
struct JurisdictionResponse {
    jurisdiction: String,
}

#[derive(Deserialize)]
struct EventsResponse {
    events: Vec<CalendarEvent>,
}

impl HttpCollaborators {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `{base}/employees/{id}` with the id escaped as one path segment.
    fn employee_url(&self, employee_id: &str) -> Result<reqwest::Url, CollaboratorError> {
        let invalid = |reason: String| CollaboratorError::Failed {
            collaborator: "employees".into(),
            reason,
            retryable: false,
        };
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("invalid collaborator URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| invalid(format!("collaborator URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("employees")
            .push(employee_id);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(
        collaborator: &str,
        resp: reqwest::Response,
    ) -> Result<T, CollaboratorError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed {
                collaborator: collaborator.into(),
                reason: format!("HTTP {status}: {body}"),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse {
                collaborator: collaborator.into(),
                reason: e.to_string(),
            })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        collaborator: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, CollaboratorError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(collaborator, e))?;
        Self::decode(collaborator, resp).await
    }
}

fn transport_error(collaborator: &str, e: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Failed {
        collaborator: collaborator.into(),
        reason: e.to_string(),
        retryable: true,
    }
}

#[async_trait]
impl Collaborators for HttpCollaborators {
    async fn load_employee(&self, employee_id: &str) -> Result<EmployeeContext, CollaboratorError> {
        let resp = self
            .client
            .get(self.employee_url(employee_id)?)
            .send()
            .await
            .map_err(|e| transport_error("employees", e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CollaboratorError::InvalidEmployee(format!(
                "employee {employee_id} not found"
            )));
        }
        Self::decode("employees", resp).await
    }

    async fn detect_jurisdiction(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        let resp: JurisdictionResponse = self
            .post("jurisdiction", "/jurisdiction", json!({ "employee": employee }))
            .await?;
        Ok(resp.jurisdiction)
    }

    async fn generate_document(
        &self,
        kind: DocumentKind,
        employee: &EmployeeContext,
        jurisdiction: &str,
        revision_notes: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        let resp: ContentResponse = self
            .post(
                "documents",
                "/documents",
                json!({
                    "kind": kind,
                    "employee": employee,
                    "jurisdiction": jurisdiction,
                    "revision_notes": revision_notes,
                }),
            )
            .await?;
        Ok(resp.content)
    }

    async fn compose_welcome_email(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        let resp: ContentResponse = self
            .post("welcome-email", "/welcome-email", json!({ "employee": employee }))
            .await?;
        Ok(resp.content)
    }

    async fn compose_plan(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        let resp: ContentResponse = self.post("plan", "/plan", json!({ "employee": employee })).await?;
        Ok(resp.content)
    }

    async fn schedule_calendar_events(
        &self,
        employee: &EmployeeContext,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        let resp: EventsResponse = self
            .post("calendar-events", "/calendar-events", json!({ "employee": employee }))
            .await?;
        Ok(resp.events)
    }

    async fn compose_equipment_request(&self, employee: &EmployeeContext) -> Result<String, CollaboratorError> {
        let resp: ContentResponse = self
            .post("equipment-request", "/equipment-request", json!({ "employee": employee }))
            .await?;
        Ok(resp.content)
    }
}
