//! Integration tests for the workflow REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port, drives it with
//! reqwest, and follows events over tokio-tungstenite.

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use onboarding_orchestrator::workflow::StepType;
use onboarding_orchestrator::workflow::routes::{AppState, workflow_routes};

use common::{Harness, TEST_TIMEOUT, harness};

/// Start an Axum server on a random port, return (base URL, harness).
async fn start_server() -> (String, Harness) {
    let h = harness().await;
    let app = workflow_routes(AppState::new(h.engine.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("127.0.0.1:{port}"), h)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

async fn start_workflow(client: &reqwest::Client, addr: &str, employee_id: &str) -> String {
    let resp = client
        .post(format!("http://{addr}/api/onboarding/{employee_id}/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    body["workflow_id"].as_str().unwrap().to_string()
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ws_follows_workflow_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let (addr, h) = start_server().await;
        let client = reqwest::Client::new();
        h.collaborators.hold(StepType::ParseData);
        let workflow_id = start_workflow(&client, &addr, "emp-ws").await;

        let (mut ws, _resp) = connect_async(format!("ws://{addr}/ws/workflows/{workflow_id}"))
            .await
            .expect("WS connect failed");

        let init = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(init["type"], "init");
        assert_eq!(init["snapshot"]["workflow"]["id"], workflow_id.as_str());
        assert_eq!(init["snapshot"]["steps"].as_array().unwrap().len(), 10);
        h.collaborators.release(StepType::ParseData);

        let mut approved = 0;
        let mut saw_cleared = false;
        let done = loop {
            let msg = ws.next().await.expect("stream ended before done").unwrap();
            if msg.is_close() {
                panic!("socket closed before done");
            }
            let event = parse_ws_json(&msg);
            match event["type"].as_str().unwrap() {
                "approval_update" if event["status"] == "pending" => {
                    let approval_id = event["approval_id"].as_str().unwrap();
                    let resp = client
                        .post(format!("http://{addr}/api/approvals/{approval_id}/approve"))
                        .json(&json!({ "reviewer": "hr@example.com" }))
                        .send()
                        .await
                        .unwrap();
                    assert_eq!(resp.status(), 200);
                    let body: Value = resp.json().await.unwrap();
                    assert_eq!(body["status"], "approved");
                    assert_eq!(body["reviewer"], "hr@example.com");
                    approved += 1;
                }
                "approval_gate" if event["state"] == "cleared" => saw_cleared = true,
                "done" => break event,
                _ => {}
            }
        };

        assert_eq!(done["status"], "completed");
        assert_eq!(approved, 4);
        assert!(saw_cleared);

        let snapshot: Value = client
            .get(format!("http://{addr}/api/workflows/{workflow_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snapshot["workflow"]["status"], "completed");

        let status: Value = client
            .get(format!("http://{addr}/api/onboarding/emp-ws/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["workflow"]["id"], workflow_id.as_str());

        let count: Value = client
            .get(format!("http://{addr}/api/approvals/pending/count"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(count["count"], 0);

        let approved_list: Value = client
            .get(format!("http://{addr}/api/approvals?status=approved"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(approved_list.as_array().unwrap().len(), 4);

        let for_employee: Value = client
            .get(format!("http://{addr}/api/approvals/employee/emp-ws"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(for_employee.as_array().unwrap().len(), 4);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_reports_rejection_as_error_then_done() {
    timeout(TEST_TIMEOUT, async {
        let (addr, _h) = start_server().await;
        let client = reqwest::Client::new();
        let workflow_id = start_workflow(&client, &addr, "emp-reject").await;

        let (mut ws, _resp) = connect_async(format!("ws://{addr}/ws/workflows/{workflow_id}"))
            .await
            .expect("WS connect failed");

        let mut rejected = false;
        let mut saw_error = false;
        let done = loop {
            let event = parse_ws_json(&ws.next().await.unwrap().unwrap());
            match event["type"].as_str().unwrap() {
                "init" => {
                    // Requests raised before we connected arrive in the snapshot.
                    if let Some(approval) = event["snapshot"]["approvals"]
                        .as_array()
                        .and_then(|a| a.iter().find(|a| a["status"] == "pending"))
                    {
                        if !rejected {
                            reject(&client, &addr, approval["id"].as_str().unwrap()).await;
                            rejected = true;
                        }
                    }
                }
                "approval_update" if event["status"] == "pending" && !rejected => {
                    reject(&client, &addr, event["approval_id"].as_str().unwrap()).await;
                    rejected = true;
                }
                "error" => {
                    assert_eq!(event["reason"], "ApprovalRejected");
                    saw_error = true;
                }
                "done" => break event,
                _ => {}
            }
        };

        assert!(saw_error);
        assert_eq!(done["status"], "failed");

        let resp = client
            .post(format!("http://{addr}/api/workflows/{workflow_id}/retry"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

async fn reject(client: &reqwest::Client, addr: &str, approval_id: &str) {
    let resp = client
        .post(format!("http://{addr}/api/approvals/{approval_id}/reject"))
        .json(&json!({ "reviewer": "legal", "notes": "Missing clause" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn ws_unknown_workflow_is_refused() {
    timeout(TEST_TIMEOUT, async {
        let (addr, _h) = start_server().await;
        let missing = uuid::Uuid::new_v4();
        let result = connect_async(format!("ws://{addr}/ws/workflows/{missing}")).await;
        assert!(result.is_err());
    })
    .await
    .expect("test timed out");
}

// ── REST ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_errors_map_to_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let (addr, h) = start_server().await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        h.collaborators.hold(StepType::ParseData);
        let workflow_id = start_workflow(&client, &addr, "emp-rest").await;

        let resp = client
            .post(format!("http://{addr}/api/onboarding/emp-rest/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains(&workflow_id));

        let resp = client
            .get(format!("http://{addr}/api/workflows/not-a-uuid"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let missing = uuid::Uuid::new_v4();
        let resp = client
            .get(format!("http://{addr}/api/workflows/{missing}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("http://{addr}/api/onboarding/nobody/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("http://{addr}/api/approvals/{missing}/approve"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("http://{addr}/api/approvals/{missing}/maybe"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .get(format!("http://{addr}/api/approvals?status=bogus"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("http://{addr}/api/workflows/{workflow_id}/resume"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client
            .post(format!("http://{addr}/api/workflows/{workflow_id}/pause"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("http://{addr}/api/workflows/{workflow_id}/retry"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client
            .post(format!("http://{addr}/api/workflows/{workflow_id}/resume"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "running");

        h.collaborators.release(StepType::ParseData);
    })
    .await
    .expect("test timed out");
}
