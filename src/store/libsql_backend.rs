//! libSQL backend: async `WorkflowStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::WorkflowStore;
use crate::workflow::model::{
    ApprovalRequest, ApprovalStatus, FailureReason, Step, StepStatus, StepType, Workflow,
    WorkflowStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_workflows(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Workflow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut workflows = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            workflows.push(row_to_workflow(&row)?);
        }
        Ok(workflows)
    }

    async fn query_steps(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Step>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut steps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    async fn query_approvals(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut approvals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            approvals.push(row_to_approval(&row)?);
        }
        Ok(approvals)
    }

    async fn query_count(&self, op: &str, sql: &str, params: impl libsql::params::IntoParams) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps lexicographic order equal to time order.
fn now_str() -> String {
    format_datetime(&Utc::now())
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(field: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field} parse: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(field: &str, s: &str) -> Result<T, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_optional_enum<T: std::str::FromStr<Err = String>>(
    field: &str,
    s: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_enum(field, &s))
        .transpose()
}

/// Render a status set as a SQL `IN` list. Values come from a closed enum.
fn status_list(statuses: &[WorkflowStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn active_status_list() -> String {
    status_list(&WorkflowStatus::ACTIVE)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Column list for workflow SELECT queries (8 columns).
const WORKFLOW_COLUMNS: &str =
    "id, employee_id, status, failure_reason, error_message, created_at, started_at, completed_at";

/// Column list for step SELECT queries (14 columns).
const STEP_COLUMNS: &str = "id, workflow_id, step_type, step_order, status, result, failure_reason, error_message, started_at, completed_at, requires_approval, approval_status, revision_notes, attempts";

/// Column list for approval SELECT queries (12 columns).
const APPROVAL_COLUMNS: &str = "id, workflow_id, employee_id, step_id, step_type, generation, document, status, reviewer, notes, created_at, reviewed_at";

fn row_to_workflow(row: &libsql::Row) -> Result<Workflow, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("workflow.id: {e}")))?;
    let employee_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("workflow.employee_id: {e}")))?;
    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("workflow.status: {e}")))?;
    let created_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("workflow.created_at: {e}")))?;

    Ok(Workflow {
        id: parse_uuid("workflow.id", &id_str)?,
        employee_id,
        status: parse_enum("workflow.status", &status_str)?,
        failure_reason: parse_optional_enum("workflow.failure_reason", row.get::<String>(3).ok())?,
        error_message: row.get::<String>(4).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(row.get::<String>(6).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(7).ok()),
    })
}

fn row_to_step(row: &libsql::Row) -> Result<Step, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("step.id: {e}")))?;
    let workflow_id_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("step.workflow_id: {e}")))?;
    let step_type_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("step.step_type: {e}")))?;
    let step_order: i64 = row.get(3).unwrap_or(0);
    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("step.status: {e}")))?;

    let result = row
        .get::<String>(5)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str::<Value>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("step.result: {e}")))?;

    Ok(Step {
        id: parse_uuid("step.id", &id_str)?,
        workflow_id: parse_uuid("step.workflow_id", &workflow_id_str)?,
        step_type: parse_enum("step.step_type", &step_type_str)?,
        step_order: step_order as u32,
        status: parse_enum("step.status", &status_str)?,
        result,
        failure_reason: parse_optional_enum("step.failure_reason", row.get::<String>(6).ok())?,
        error_message: row.get::<String>(7).ok(),
        started_at: parse_optional_datetime(row.get::<String>(8).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(9).ok()),
        requires_approval: row.get::<i64>(10).unwrap_or(0) != 0,
        approval_status: parse_optional_enum("step.approval_status", row.get::<String>(11).ok())?,
        revision_notes: row.get::<String>(12).ok(),
        attempts: row.get::<i64>(13).unwrap_or(0) as u32,
    })
}

fn row_to_approval(row: &libsql::Row) -> Result<ApprovalRequest, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("approval.id: {e}")))?;
    let workflow_id_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("approval.workflow_id: {e}")))?;
    let employee_id: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("approval.employee_id: {e}")))?;
    let step_id_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("approval.step_id: {e}")))?;
    let step_type_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("approval.step_type: {e}")))?;
    let generation: i64 = row.get(5).unwrap_or(1);
    let document_str: String = row.get(6).unwrap_or_else(|_| "null".to_string());
    let status_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("approval.status: {e}")))?;
    let created_str: String = row
        .get(10)
        .map_err(|e| DatabaseError::Query(format!("approval.created_at: {e}")))?;

    Ok(ApprovalRequest {
        id: parse_uuid("approval.id", &id_str)?,
        workflow_id: parse_uuid("approval.workflow_id", &workflow_id_str)?,
        employee_id,
        step_id: parse_uuid("approval.step_id", &step_id_str)?,
        step_type: parse_enum("approval.step_type", &step_type_str)?,
        generation: generation as u32,
        document: serde_json::from_str(&document_str)
            .map_err(|e| DatabaseError::Serialization(format!("approval.document: {e}")))?,
        status: parse_enum("approval.status", &status_str)?,
        reviewer: row.get::<String>(8).ok(),
        notes: row.get::<String>(9).ok(),
        created_at: parse_datetime(&created_str),
        reviewed_at: parse_optional_datetime(row.get::<String>(11).ok()),
    })
}

/// Insert step rows in a single multi-row statement.
async fn insert_steps(conn: &Connection, verb: &str, steps: &[Step]) -> Result<(), libsql::Error> {
    if steps.is_empty() {
        return Ok(());
    }
    let mut sql = format!(
        "{verb} INTO workflow_steps (id, workflow_id, step_type, step_order, status, requires_approval) VALUES "
    );
    let mut values: Vec<libsql::Value> = Vec::with_capacity(steps.len() * 6);
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * 6;
        sql.push_str(&format!(
            "(?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6
        ));
        values.push(step.id.to_string().into());
        values.push(step.workflow_id.to_string().into());
        values.push(step.step_type.as_str().into());
        values.push((step.step_order as i64).into());
        values.push(step.status.as_str().into());
        values.push((step.requires_approval as i64).into());
    }
    conn.execute(&sql, libsql::params::Params::Positional(values))
        .await
        .map(|_| ())
}

#[async_trait]
impl WorkflowStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn create_workflow(&self, workflow: &Workflow, steps: &[Step]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = now_str();

        conn.execute(
            "INSERT INTO workflows (id, employee_id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workflow.id.to_string(),
                workflow.employee_id.as_str(),
                workflow.status.as_str(),
                format_datetime(&workflow.created_at),
                now
            ],
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DatabaseError::Constraint(format!(
                    "employee {} already has an active workflow",
                    workflow.employee_id
                ))
            } else {
                DatabaseError::Query(format!("create_workflow: {e}"))
            }
        })?;

        // A restart between these two statements leaves a step-less workflow;
        // its driver seeds the missing steps when it starts.
        if let Err(e) = insert_steps(conn, "INSERT", steps).await {
            if let Err(cleanup) = conn
                .execute("DELETE FROM workflows WHERE id = ?1", params![workflow.id.to_string()])
                .await
            {
                error!(
                    workflow_id = %workflow.id,
                    error = %cleanup,
                    "Failed to remove workflow after step insert failed"
                );
            }
            return Err(DatabaseError::Query(format!("create_workflow steps: {e}")));
        }

        debug!(workflow_id = %workflow.id, employee_id = %workflow.employee_id, "Workflow created in DB");
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError> {
        let mut workflows = self
            .query_workflows(
                "get_workflow",
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(workflows.pop())
    }

    async fn get_active_workflow(&self, employee_id: &str) -> Result<Option<Workflow>, DatabaseError> {
        let mut workflows = self
            .query_workflows(
                "get_active_workflow",
                &format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE employee_id = ?1 AND status IN ({}) LIMIT 1",
                    active_status_list()
                ),
                params![employee_id],
            )
            .await?;
        Ok(workflows.pop())
    }

    async fn get_latest_workflow(&self, employee_id: &str) -> Result<Option<Workflow>, DatabaseError> {
        let mut workflows = self
            .query_workflows(
                "get_latest_workflow",
                &format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE employee_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![employee_id],
            )
            .await?;
        Ok(workflows.pop())
    }

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, DatabaseError> {
        self.query_workflows(
            "list_active_workflows",
            &format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status IN ({}) ORDER BY created_at ASC",
                active_status_list()
            ),
            (),
        )
        .await
    }

    async fn transition_workflow(
        &self,
        id: Uuid,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> Result<bool, DatabaseError> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = now_str();
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE workflows SET status = ?1, updated_at = ?2, \
                     started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END, \
                     completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?2 ELSE completed_at END \
                     WHERE id = ?3 AND status IN ({})",
                    status_list(from)
                ),
                params![to.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_workflow: {e}")))?;

        debug!(workflow_id = %id, status = %to, applied = n > 0, "Workflow transition");
        Ok(n > 0)
    }

    async fn fail_workflow(
        &self,
        id: Uuid,
        reason: FailureReason,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE workflows SET status = 'failed', failure_reason = ?1, error_message = ?2, \
                     completed_at = ?3, updated_at = ?3 WHERE id = ?4 AND status IN ({})",
                    active_status_list()
                ),
                params![reason.as_str(), message, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_workflow: {e}")))?;
        Ok(n > 0)
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>, DatabaseError> {
        self.query_steps(
            "list_steps",
            &format!("SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order ASC"),
            params![workflow_id.to_string()],
        )
        .await
    }

    async fn insert_missing_steps(&self, steps: &[Step]) -> Result<(), DatabaseError> {
        insert_steps(self.conn(), "INSERT OR IGNORE", steps)
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_missing_steps: {e}")))
    }

    async fn get_step(&self, workflow_id: Uuid, step_type: StepType) -> Result<Option<Step>, DatabaseError> {
        let mut steps = self
            .query_steps(
                "get_step",
                &format!("SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ?1 AND step_type = ?2"),
                params![workflow_id.to_string(), step_type.as_str()],
            )
            .await?;
        Ok(steps.pop())
    }

    async fn mark_step_running(&self, workflow_id: Uuid, step_type: StepType) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE workflow_steps SET status = 'running', started_at = ?1, completed_at = NULL, \
                 attempts = attempts + 1 WHERE workflow_id = ?2 AND step_type = ?3 AND status = 'pending'",
                params![now_str(), workflow_id.to_string(), step_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_step_running: {e}")))?;
        Ok(n > 0)
    }

    async fn complete_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        result: &Value,
    ) -> Result<bool, DatabaseError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(format!("complete_step: {e}")))?;
        let n = self
            .conn()
            .execute(
                "UPDATE workflow_steps SET status = 'completed', result = ?1, completed_at = ?2, \
                 failure_reason = NULL, error_message = NULL \
                 WHERE workflow_id = ?3 AND step_type = ?4 AND status = 'running'",
                params![result_json, now_str(), workflow_id.to_string(), step_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_step: {e}")))?;
        Ok(n > 0)
    }

    async fn fail_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        reason: FailureReason,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE workflow_steps SET status = 'failed', failure_reason = ?1, error_message = ?2, \
                 completed_at = ?3 WHERE workflow_id = ?4 AND step_type = ?5 AND status = 'running'",
                params![
                    reason.as_str(),
                    message,
                    now_str(),
                    workflow_id.to_string(),
                    step_type.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_step: {e}")))?;
        Ok(n > 0)
    }

    async fn reset_step(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        from: StepStatus,
        approval_status: Option<ApprovalStatus>,
        revision_notes: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(StepStatus::Pending) {
            return Ok(false);
        }
        let n = self
            .conn()
            .execute(
                "UPDATE workflow_steps SET status = 'pending', result = NULL, failure_reason = NULL, \
                 error_message = NULL, started_at = NULL, completed_at = NULL, \
                 approval_status = ?1, revision_notes = ?2 \
                 WHERE workflow_id = ?3 AND step_type = ?4 AND status = ?5",
                params![
                    opt_text(approval_status.map(|s| s.as_str())),
                    opt_text(revision_notes),
                    workflow_id.to_string(),
                    step_type.as_str(),
                    from.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_step: {e}")))?;
        Ok(n > 0)
    }

    async fn set_step_approval_status(
        &self,
        workflow_id: Uuid,
        step_type: StepType,
        status: Option<ApprovalStatus>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE workflow_steps SET approval_status = ?1 WHERE workflow_id = ?2 AND step_type = ?3",
                params![
                    opt_text(status.map(|s| s.as_str())),
                    workflow_id.to_string(),
                    step_type.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_step_approval_status: {e}")))?;
        Ok(())
    }

    async fn fail_interrupted_steps(&self) -> Result<Vec<(Uuid, StepType)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE workflow_steps SET status = 'failed', failure_reason = ?1, \
                 error_message = 'dispatch interrupted by restart', completed_at = ?2 \
                 WHERE status = 'running' RETURNING workflow_id, step_type",
                params![FailureReason::InterruptedDispatch.as_str(), now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted_steps: {e}")))?;

        let mut interrupted = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted_steps: {e}")))?
        {
            let workflow_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("fail_interrupted_steps: {e}")))?;
            let step_type: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("fail_interrupted_steps: {e}")))?;
            interrupted.push((
                parse_uuid("step.workflow_id", &workflow_id)?,
                parse_enum("step.step_type", &step_type)?,
            ));
        }
        Ok(interrupted)
    }

    // ── Approvals ───────────────────────────────────────────────────

    async fn insert_approval(&self, approval: &ApprovalRequest) -> Result<(), DatabaseError> {
        let document = serde_json::to_string(&approval.document)
            .map_err(|e| DatabaseError::Serialization(format!("insert_approval: {e}")))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO approval_requests ({APPROVAL_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    approval.id.to_string(),
                    approval.workflow_id.to_string(),
                    approval.employee_id.as_str(),
                    approval.step_id.to_string(),
                    approval.step_type.as_str(),
                    approval.generation as i64,
                    document,
                    approval.status.as_str(),
                    opt_text(approval.reviewer.as_deref()),
                    opt_text(approval.notes.as_deref()),
                    format_datetime(&approval.created_at),
                    opt_text_owned(approval.reviewed_at.as_ref().map(format_datetime))
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("insert_approval: {e}"))
                } else {
                    DatabaseError::Query(format!("insert_approval: {e}"))
                }
            })?;

        debug!(approval_id = %approval.id, step = %approval.step_type, "Approval request stored");
        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>, DatabaseError> {
        let mut approvals = self
            .query_approvals(
                "get_approval",
                &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(approvals.pop())
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reviewer: Option<&str>,
        notes: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE approval_requests SET status = ?1, reviewer = ?2, notes = ?3, reviewed_at = ?4 \
                 WHERE id = ?5 AND status = 'pending'",
                params![
                    status.as_str(),
                    opt_text(reviewer),
                    opt_text(notes),
                    now_str(),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_approval: {e}")))?;
        Ok(n > 0)
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_approvals(
                    "list_approvals",
                    &format!(
                        "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE status = ?1 ORDER BY created_at DESC, rowid DESC"
                    ),
                    params![status.as_str()],
                )
                .await
            }
            None => {
                self.query_approvals(
                    "list_approvals",
                    &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests ORDER BY created_at DESC, rowid DESC"),
                    (),
                )
                .await
            }
        }
    }

    async fn list_approvals_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        self.query_approvals(
            "list_approvals_for_workflow",
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE workflow_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            params![workflow_id.to_string()],
        )
        .await
    }

    async fn list_approvals_for_employee(&self, employee_id: &str) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        self.query_approvals(
            "list_approvals_for_employee",
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE employee_id = ?1 ORDER BY created_at DESC, rowid DESC"
            ),
            params![employee_id],
        )
        .await
    }

    async fn count_pending_approvals(&self) -> Result<u64, DatabaseError> {
        let n = self
            .query_count(
                "count_pending_approvals",
                "SELECT COUNT(*) FROM approval_requests WHERE status = 'pending'",
                (),
            )
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn count_step_approvals(&self, step_id: Uuid) -> Result<u32, DatabaseError> {
        let n = self
            .query_count(
                "count_step_approvals",
                "SELECT COUNT(*) FROM approval_requests WHERE step_id = ?1",
                params![step_id.to_string()],
            )
            .await?;
        Ok(n.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::catalog::StepCatalog;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seeded(db: &LibSqlBackend, employee_id: &str) -> Workflow {
        let workflow = Workflow::new(employee_id);
        let steps = StepCatalog::onboarding().seed_steps(workflow.id);
        db.create_workflow(&workflow, &steps).await.unwrap();
        workflow
    }

    #[tokio::test]
    async fn create_and_load_workflow() {
        let db = backend().await;
        let wf = seeded(&db, "emp-1").await;

        let loaded = db.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.employee_id, "emp-1");
        assert_eq!(loaded.status, WorkflowStatus::Pending);

        let steps = db.list_steps(wf.id).await.unwrap();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[0].step_type, StepType::ParseData);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(steps.windows(2).all(|w| w[0].step_order < w[1].step_order));
    }

    #[tokio::test]
    async fn second_active_workflow_is_rejected() {
        let db = backend().await;
        seeded(&db, "emp-1").await;

        let dup = Workflow::new("emp-1");
        let steps = StepCatalog::onboarding().seed_steps(dup.id);
        let err = db.create_workflow(&dup, &steps).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert!(db.get_workflow(dup.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_steps_fill_gaps_without_touching_existing_rows() {
        let db = backend().await;
        let wf = Workflow::new("emp-1");
        let steps = StepCatalog::onboarding().seed_steps(wf.id);
        db.create_workflow(&wf, &steps[..3]).await.unwrap();
        assert!(db.mark_step_running(wf.id, steps[0].step_type).await.unwrap());

        db.insert_missing_steps(&steps).await.unwrap();
        db.insert_missing_steps(&[]).await.unwrap();

        let loaded = db.list_steps(wf.id).await.unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded[0].status, StepStatus::Running);
        assert!(loaded[1..].iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn terminal_workflow_frees_the_employee() {
        let db = backend().await;
        let first = seeded(&db, "emp-1").await;
        assert!(db.fail_workflow(first.id, FailureReason::ApprovalRejected, "no").await.unwrap());
        assert!(db.get_active_workflow("emp-1").await.unwrap().is_none());

        let second = seeded(&db, "emp-1").await;
        let latest = db.get_latest_workflow("emp-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let failed = db.get_workflow(first.id).await.unwrap().unwrap();
        assert_eq!(failed.failure_reason, Some(FailureReason::ApprovalRejected));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let db = backend().await;
        let wf = seeded(&db, "emp-1").await;

        assert!(db
            .transition_workflow(wf.id, &[WorkflowStatus::Pending], WorkflowStatus::Running)
            .await
            .unwrap());
        assert!(!db
            .transition_workflow(wf.id, &[WorkflowStatus::Pending], WorkflowStatus::Running)
            .await
            .unwrap());

        let loaded = db.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn step_lifecycle_is_guarded() {
        let db = backend().await;
        let wf = seeded(&db, "emp-1").await;
        let t = StepType::ParseData;

        assert!(!db.complete_step(wf.id, t, &serde_json::json!({})).await.unwrap());
        assert!(db.mark_step_running(wf.id, t).await.unwrap());
        assert!(!db.mark_step_running(wf.id, t).await.unwrap());
        assert!(db.fail_step(wf.id, t, FailureReason::CollaboratorTimeout, "slow").await.unwrap());
        assert!(!db.complete_step(wf.id, t, &serde_json::json!({})).await.unwrap());

        let step = db.get_step(wf.id, t).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.failure_reason, Some(FailureReason::CollaboratorTimeout));
        assert_eq!(step.attempts, 1);

        assert!(db.reset_step(wf.id, t, StepStatus::Failed, None, None).await.unwrap());
        assert!(db.mark_step_running(wf.id, t).await.unwrap());
        assert!(!db.reset_step(wf.id, t, StepStatus::Running, None, None).await.unwrap());
        let payload = serde_json::json!({"employee": {"name": "Ada"}});
        assert!(db.complete_step(wf.id, t, &payload).await.unwrap());

        let step = db.get_step(wf.id, t).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.result, Some(payload));
        assert_eq!(step.attempts, 2);
        assert!(step.failure_reason.is_none());
    }

    #[tokio::test]
    async fn interrupted_steps_are_failed() {
        let db = backend().await;
        let wf = seeded(&db, "emp-1").await;
        db.mark_step_running(wf.id, StepType::ParseData).await.unwrap();

        let interrupted = db.fail_interrupted_steps().await.unwrap();
        assert_eq!(interrupted, vec![(wf.id, StepType::ParseData)]);

        let step = db.get_step(wf.id, StepType::ParseData).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.failure_reason, Some(FailureReason::InterruptedDispatch));
        assert!(db.fail_interrupted_steps().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approvals_resolve_once_and_list_newest_first() {
        let db = backend().await;
        let wf = seeded(&db, "emp-1").await;
        let nda = db.get_step(wf.id, StepType::Nda).await.unwrap().unwrap();
        let contract = db
            .get_step(wf.id, StepType::EmploymentContract)
            .await
            .unwrap()
            .unwrap();

        let first = ApprovalRequest::for_step(&contract, "emp-1", 1);
        db.insert_approval(&first).await.unwrap();
        let second = ApprovalRequest::for_step(&nda, "emp-1", 1);
        db.insert_approval(&second).await.unwrap();

        assert_eq!(db.count_pending_approvals().await.unwrap(), 2);
        let pending = db.list_approvals(Some(ApprovalStatus::Pending)).await.unwrap();
        assert_eq!(pending[0].id, second.id);
        assert_eq!(pending[1].id, first.id);

        assert!(db
            .resolve_approval(first.id, ApprovalStatus::Approved, Some("hr-lead"), Some("ok"))
            .await
            .unwrap());
        assert!(!db
            .resolve_approval(first.id, ApprovalStatus::Rejected, None, None)
            .await
            .unwrap());

        let resolved = db.get_approval(first.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.reviewer.as_deref(), Some("hr-lead"));
        assert!(resolved.reviewed_at.is_some());

        assert_eq!(db.count_pending_approvals().await.unwrap(), 1);
        assert_eq!(db.count_step_approvals(contract.id).await.unwrap(), 1);
        assert_eq!(db.list_approvals_for_employee("emp-1").await.unwrap().len(), 2);

        let snapshot = db.snapshot(wf.id).await.unwrap().unwrap();
        assert_eq!(snapshot.approvals[0].id, first.id);
        assert_eq!(snapshot.pending_approvals().count(), 1);
    }
}
