use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    AppState,
    error::AppError,
    middleware::CurrentUser,
    realtime::{Envelope, HubStats, Publisher},
    result::ApiResult,
};

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub user_id: String,
    /// JSON object with a `type` field, forwarded as is.
    pub message: Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub delivered: usize,
}

pub async fn stats(State(state): State<AppState>) -> Json<ApiResult<HubStats>> {
    Json(ApiResult::success(state.hub.stats()))
}

/// Pushes one message to every open connection of `user_id`. Only the
/// service subjects listed in `NOTIFY_SUBJECTS` may call it.
pub async fn notify(
    sender: CurrentUser,
    State(state): State<AppState>,
    Json(req): Json<NotifyRequest>,
) -> Result<Json<ApiResult<NotifyResponse>>, AppError> {
    if !state.config.may_notify(&sender.id) {
        tracing::warn!(sender = %sender.id, "notify refused");
        return Err(AppError::Forbidden);
    }
    if req.user_id.trim().is_empty() {
        return Err(AppError::InvalidMessage("user_id must not be empty".into()));
    }
    let message =
        Envelope::try_from(req.message).map_err(|e| AppError::InvalidMessage(e.to_string()))?;
    if message.is_auth() {
        return Err(AppError::InvalidMessage("the auth type is reserved".into()));
    }

    let delivered = state.hub.publish(&req.user_id, &message);
    tracing::info!(
        sender = %sender.id,
        recipient = %req.user_id,
        kind = %message.kind,
        delivered,
        "notification pushed"
    );

    Ok(Json(ApiResult::success(NotifyResponse { delivered })))
}
