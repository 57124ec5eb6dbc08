use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::server::AppState;
use crate::server::error::{ApiError, map_storage_not_found};
use crate::storage;

pub(in crate::server) async fn list_proxy_keys(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let keys = storage::list_proxy_keys(state.db_path()).await?;
    Ok(Json(keys))
}

pub(in crate::server) async fn create_proxy_key(
    State(state): State<AppState>,
    Json(input): Json<storage::CreateProxyKey>,
) -> Result<impl IntoResponse, ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name 不能为空".to_string()));
    }

    let key = storage::create_proxy_key(state.db_path(), input).await?;
    Ok((StatusCode::CREATED, Json(key)))
}

pub(in crate::server) async fn update_proxy_key(
    State(state): State<AppState>,
    axum::extract::Path(key_id): axum::extract::Path<String>,
    Json(input): Json<storage::UpdateProxyKey>,
) -> Result<impl IntoResponse, ApiError> {
    match storage::update_proxy_key(state.db_path(), key_id, input).await {
        Ok(key) => Ok(Json(key)),
        Err(e) => Err(map_storage_not_found(e, "proxy key")),
    }
}

pub(in crate::server) async fn delete_proxy_key(
    State(state): State<AppState>,
    axum::extract::Path(key_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match storage::delete_proxy_key(state.db_path(), key_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(map_storage_not_found(e, "proxy key")),
    }
}

pub(in crate::server) async fn regenerate_proxy_key(
    State(state): State<AppState>,
    axum::extract::Path(key_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match storage::regenerate_proxy_key(state.db_path(), key_id).await {
        Ok(key) => Ok(Json(key)),
        Err(e) => Err(map_storage_not_found(e, "proxy key")),
    }
}
