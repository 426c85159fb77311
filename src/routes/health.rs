use axum::{Json, extract::State};
use serde::Serialize;

use crate::{AppState, error::AppError, result::ApiResult};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub connections: usize,
}

pub async fn health(State(state): State<AppState>) -> Result<Json<ApiResult<HealthResponse>>, AppError> {
    let database = match &state.db {
        Some(db) => {
            db.ping().await?;
            "up"
        }
        None => "disabled",
    };

    Ok(Json(ApiResult::success(HealthResponse {
        status: "ok",
        database,
        connections: state.hub.stats().connections,
    })))
}
