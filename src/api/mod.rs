//! HTTP and websocket surface of the dispatch core.

mod error;
mod ws;

pub use error::{ApiError, ApiErrorResponse};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::dispatch::envelope::EventType;
use crate::dispatch::service::{DeliveryStatus, DispatchService};

/// Build the API router.
pub fn router(service: Arc<DispatchService>) -> Router {
    Router::new()
        .route("/events", post(submit_event))
        .route("/envelopes/{id}/deliveries", get(delivery_status))
        .route("/envelopes/{id}/cancel", post(cancel_envelope))
        .route("/inbox/{recipient_id}", get(unread_inbox))
        .route("/inbox/{recipient_id}/read_all", post(mark_all_read))
        .route("/inbox/{recipient_id}/read", delete(delete_read))
        .route("/notifications/{task_id}/read", post(mark_read))
        .route("/ws", get(ws::notification_ws))
        .with_state(service)
}

/// Event submission request body.
#[derive(Debug, Deserialize)]
struct SubmitEventRequest {
    event_type: EventType,
    subject_ref: String,
    recipients: Vec<String>,
    /// Opaque payload, carried verbatim to every channel.
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SubmitEventResponse {
    envelope_id: String,
}

async fn submit_event(
    State(service): State<Arc<DispatchService>>,
    Json(request): Json<SubmitEventRequest>,
) -> Result<(StatusCode, Json<SubmitEventResponse>), ApiError> {
    let payload = Bytes::from(serde_json::to_vec(&request.payload).map_err(crate::Error::from)?);

    let envelope_id = service
        .submit_event(
            request.event_type,
            request.subject_ref,
            request.recipients,
            payload,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitEventResponse { envelope_id }),
    ))
}

async fn delivery_status(
    State(service): State<Arc<DispatchService>>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryStatus>, ApiError> {
    Ok(Json(service.delivery_status(&id).await?))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: usize,
}

async fn cancel_envelope(
    State(service): State<Arc<DispatchService>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    if service.envelope(&id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "envelope with id '{}' not found",
            id
        )));
    }
    let cancelled = service.cancel_envelope(&id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn unread_inbox(
    State(service): State<Arc<DispatchService>>,
    Path(recipient_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let notifications = service.unread_notifications(&recipient_id).await?;
    let items: Vec<serde_json::Value> = notifications
        .iter()
        .map(|n| {
            serde_json::json!({
                "task_id": n.task_id,
                "envelope_id": n.envelope_id,
                "event_type": n.event_type.as_str(),
                "subject_ref": n.subject_ref,
                "payload": serde_json::from_slice::<serde_json::Value>(&n.payload)
                    .unwrap_or(serde_json::Value::Null),
                "created_at": n.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "notifications": items })))
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    updated: u64,
}

async fn mark_read(
    State(service): State<Arc<DispatchService>>,
    Path(task_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    if !service.mark_notification_read(&task_id).await? {
        return Err(ApiError::not_found(format!(
            "notification with id '{}' not found",
            task_id
        )));
    }
    Ok(Json(MarkReadResponse { updated: 1 }))
}

async fn mark_all_read(
    State(service): State<Arc<DispatchService>>,
    Path(recipient_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = service.mark_all_notifications_read(&recipient_id).await?;
    Ok(Json(MarkReadResponse { updated }))
}

#[derive(Debug, Serialize)]
struct DeleteReadResponse {
    deleted: u64,
}

async fn delete_read(
    State(service): State<Arc<DispatchService>>,
    Path(recipient_id): Path<String>,
) -> Result<Json<DeleteReadResponse>, ApiError> {
    let deleted = service.delete_read_notifications(&recipient_id).await?;
    Ok(Json(DeleteReadResponse { deleted }))
}
