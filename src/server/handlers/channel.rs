use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::probe;
use crate::server::AppState;
use crate::server::error::{ApiError, map_storage_not_found};
use crate::storage;

pub(in crate::server) async fn list_channels(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let channels = storage::list_channels(state.db_path()).await?;
    Ok(Json(channels))
}

pub(in crate::server) async fn create_channel(
    State(state): State<AppState>,
    Json(input): Json<storage::CreateChannel>,
) -> Result<impl IntoResponse, ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name 不能为空".to_string()));
    }
    if input.base_url.trim().is_empty() {
        return Err(ApiError::BadRequest("base_url 不能为空".to_string()));
    }
    if let Some(proxy) = input.proxy_url.as_deref()
        && !proxy.trim().is_empty()
        && !is_supported_proxy(proxy)
    {
        return Err(ApiError::BadRequest(
            "proxy_url 仅支持 http://、https://、socks5://".to_string(),
        ));
    }

    let channel = storage::create_channel(state.db_path(), input).await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

fn is_supported_proxy(url: &str) -> bool {
    let url = url.trim().to_ascii_lowercase();
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("socks5://")
}

pub(in crate::server) async fn update_channel(
    State(state): State<AppState>,
    axum::extract::Path(channel_id): axum::extract::Path<String>,
    Json(input): Json<storage::UpdateChannel>,
) -> Result<impl IntoResponse, ApiError> {
    match storage::update_channel(state.db_path(), channel_id, input).await {
        Ok(channel) => Ok(Json(channel)),
        Err(e) => Err(map_storage_not_found(e, "channel")),
    }
}

pub(in crate::server) async fn delete_channel(
    State(state): State<AppState>,
    axum::extract::Path(channel_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match storage::delete_channel(state.db_path(), channel_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(map_storage_not_found(e, "channel")),
    }
}

/// Fetch the channel's `/v1/models` listing and register models we have not
/// seen, honoring the channel keyword filter.
pub(in crate::server) async fn sync_channel(
    State(state): State<AppState>,
    axum::extract::Path(channel_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(channel) = storage::get_channel(state.db_path(), channel_id).await? else {
        return Err(ApiError::NotFound("channel not found".to_string()));
    };

    let result = probe::sync_channel_models(state.db_path(), &state.transport, &channel).await;
    Ok(Json(result))
}

#[derive(Serialize)]
struct ImportResponse {
    added: usize,
}

pub(in crate::server) async fn import_channels(
    State(state): State<AppState>,
    Json(items): Json<Vec<storage::ChannelExport>>,
) -> Result<impl IntoResponse, ApiError> {
    let added = storage::import_channels(state.db_path(), items).await?;
    Ok(Json(ImportResponse { added }))
}

pub(in crate::server) async fn export_channels(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let items = storage::export_channels(state.db_path()).await?;
    Ok(Json(items))
}
