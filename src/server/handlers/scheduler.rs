use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::probe;
use crate::server::AppState;
use crate::server::error::ApiError;
use crate::storage;

pub(in crate::server) async fn get_config(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let config =
        storage::get_scheduler_config(state.db_path(), state.config.scheduler_defaults()).await?;
    Ok(Json(config))
}

/// Validation happens before anything is written; a bad patch leaves the
/// stored config untouched. A successful update re-arms the cron entry.
pub(in crate::server) async fn update_config(
    State(state): State<AppState>,
    Json(patch): Json<storage::SchedulerConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(cron) = patch.cron.as_deref()
        && let Err(e) = probe::validate_cron(cron)
    {
        return Err(ApiError::BadRequest(e.to_string()));
    }
    if let Some(tz) = patch.timezone.as_deref()
        && let Err(e) = probe::validate_timezone(tz)
    {
        return Err(ApiError::BadRequest(e.to_string()));
    }

    let current =
        storage::get_scheduler_config(state.db_path(), state.config.scheduler_defaults()).await?;
    let min = patch.min_delay_ms.unwrap_or(current.min_delay_ms);
    let max = patch.max_delay_ms.unwrap_or(current.max_delay_ms);
    if min > max {
        return Err(ApiError::BadRequest(
            "minDelayMs 不能大于 maxDelayMs".to_string(),
        ));
    }
    if patch.channel_concurrency == Some(0) || patch.global_concurrency == Some(0) {
        return Err(ApiError::BadRequest("并发数必须 >= 1".to_string()));
    }

    let config = storage::update_scheduler_config(
        state.db_path(),
        state.config.scheduler_defaults(),
        patch,
    )
    .await?;

    let next = *state.scheduler_notify.borrow() + 1;
    let _ = state.scheduler_notify.send(next);
    tracing::info!(cron = %config.cron, enabled = config.enabled, "scheduler config updated");

    Ok(Json(config))
}
