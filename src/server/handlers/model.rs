use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::server::AppState;
use crate::server::error::ApiError;
use crate::storage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(in crate::server) struct ListModelsQuery {
    channel_id: Option<String>,
}

pub(in crate::server) async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ListModelsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let models = storage::list_models(state.db_path(), q.channel_id).await?;
    Ok(Json(models))
}

#[derive(Debug, Deserialize)]
pub(in crate::server) struct ModelLogsQuery {
    limit: Option<i64>,
}

pub(in crate::server) async fn model_logs(
    State(state): State<AppState>,
    axum::extract::Path(model_id): axum::extract::Path<String>,
    Query(q): Query<ModelLogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(_) = storage::get_model(state.db_path(), model_id.clone()).await? else {
        return Err(ApiError::NotFound("model not found".to_string()));
    };

    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let logs = storage::list_probe_logs_for_model(state.db_path(), model_id, limit).await?;
    Ok(Json(logs))
}
