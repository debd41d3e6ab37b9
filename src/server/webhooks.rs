// src/server/webhooks.rs

use crate::error::ApiError;
use crate::state::{EXTRACTION_EVENT, ReceivedData, SharedState};
use crate::webhooks::NewWebhook;
use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

const DEMO_WEBHOOK_NAME: &str = "Demo Webhook";

fn webhook_id(id: Result<Path<u64>, PathRejection>) -> Result<u64, ApiError> {
    id.map(|Path(id)| id)
        .map_err(|_| ApiError::Validation("Invalid webhook id".into()))
}

pub async fn list(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "webhooks": state.webhooks.list() }))
}

pub async fn create(
    State(state): State<SharedState>,
    body: Result<Json<NewWebhook>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(new) = body.map_err(|_| ApiError::Validation("URL is required".into()))?;
    let webhook = state
        .webhooks
        .add(new)?
        .ok_or_else(|| ApiError::Validation("URL is required".into()))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "webhook": webhook })),
    ))
}

pub async fn remove(
    State(state): State<SharedState>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = webhook_id(id)?;
    let removed = state.webhooks.delete(id)?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

pub async fn toggle(
    State(state): State<SharedState>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = webhook_id(id)?;
    let webhook = state
        .webhooks
        .toggle(id)?
        .ok_or_else(|| ApiError::NotFound("Webhook not found".into()))?;
    Ok(Json(json!({ "success": true, "webhook": webhook })))
}

pub async fn logs(State(state): State<SharedState>) -> Json<Value> {
    let logs = state.dispatcher.log().snapshot();
    Json(json!({
        "count": logs.len(),
        "in_flight": state.dispatcher.in_flight(),
        "logs": logs,
    }))
}

pub async fn demo_webhook(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = body.map_err(|_| ApiError::Validation("Invalid JSON payload".into()))?;
    let updated = state.receive_demo(payload);
    Ok(Json(json!({
        "success": true,
        "message": "Webhook received",
        "updated": updated,
    })))
}

pub async fn get_data(State(state): State<SharedState>) -> Json<Value> {
    let data: Vec<ReceivedData> = state.received.get().into_iter().collect();
    Json(json!({ "count": data.len(), "data": data }))
}

pub async fn clear_data(State(state): State<SharedState>) -> Json<Value> {
    state.clear_webhook_data();
    Json(json!({ "success": true, "message": "Webhook data cleared" }))
}

#[derive(Serialize)]
struct Step {
    step: &'static str,
    success: bool,
    detail: String,
}

fn sample_extraction() -> Value {
    json!({
        "company_info": {"company_name": "Sample Traders Pvt Ltd", "gstin": "27AAACS1234F1Z5"},
        "invoice_info": {"gst_invoice_number": "INV-TEST-001", "invoice_date": "2024-01-15"},
        "items": [
            {"description_of_goods": "Test Widget", "hsn_code": "8479", "quantity": 2, "rate": 500.0, "amount": 1000.0}
        ],
        "totals": {"invoice_amount": 1000.0, "total_invoice": 1180.0}
    })
}

/// `GET /api/test-webhook-system`: register the demo receiver, push a
/// sample through it in-process, then check the received-data slot.
pub async fn test_system(State(state): State<SharedState>) -> Json<Value> {
    let mut steps = Vec::new();

    let demo_url = format!("{}/api/demo-webhook", state.public_url);
    steps.push(match state.webhooks.ensure(&demo_url, DEMO_WEBHOOK_NAME) {
        Ok(webhook) => Step {
            step: "register_demo_webhook",
            success: true,
            detail: format!("webhook {} at {}", webhook.id, webhook.url),
        },
        Err(e) => Step {
            step: "register_demo_webhook",
            success: false,
            detail: e.to_string(),
        },
    });

    let sample = sample_extraction();
    let event = json!({
        "event": EXTRACTION_EVENT,
        "timestamp": "2024-01-15T00:00:00Z",
        "data": sample.clone(),
    });
    let updated = state.receive_demo(event);
    steps.push(Step {
        step: "invoke_demo_webhook",
        success: true,
        detail: if updated {
            "sample payload stored".to_string()
        } else {
            "sample payload already stored".to_string()
        },
    });

    let stored = state.received.get().is_some_and(|r| r.data == sample);
    steps.push(Step {
        step: "verify_received_data",
        success: stored,
        detail: if stored {
            "received data matches sample".to_string()
        } else {
            "received data does not match sample".to_string()
        },
    });

    let passed = steps.iter().filter(|s| s.success).count();
    let failed = steps.len() - passed;
    info!(passed, failed, "Webhook self-test finished");

    Json(json!({
        "steps": steps,
        "summary": {
            "total": steps.len(),
            "passed": passed,
            "failed": failed,
            "all_passed": failed == 0,
        }
    }))
}
