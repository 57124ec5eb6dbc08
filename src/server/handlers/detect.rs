use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::events::{self, AppEvent};
use crate::probe::{self, TriggerError};
use crate::server::AppState;
use crate::server::error::ApiError;
use crate::storage;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(in crate::server) struct DetectInput {
    channel_id: Option<String>,
    model_id: Option<String>,
    model_ids: Option<Vec<String>>,
    /// Full detection only: refresh each channel's model list first.
    #[serde(default)]
    sync: bool,
}

/// `POST /api/detect` — full, per-channel or per-model detection. A
/// conflicting run answers 409 with the current queue snapshot. The body is
/// optional; an absent one means a full run.
pub(in crate::server) async fn trigger_detection(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, ApiError> {
    let input: DetectInput = if body.is_empty() {
        DetectInput::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("请求体不是合法 JSON：{e}")))?
    };
    let defaults = state.config.scheduler_defaults();

    let result = if let Some(model_id) = input.model_id {
        let Some(model) = storage::get_model(state.db_path(), model_id.clone()).await? else {
            return Err(ApiError::NotFound("model not found".to_string()));
        };
        probe::trigger_channel_detection(
            state.db_path(),
            &state.detection,
            defaults,
            model.channel_id,
            Some(vec![model_id]),
        )
        .await
    } else if let Some(channel_id) = input.channel_id {
        probe::trigger_channel_detection(
            state.db_path(),
            &state.detection,
            defaults,
            channel_id,
            input.model_ids,
        )
        .await
    } else {
        probe::trigger_full_detection(
            state.db_path(),
            &state.transport,
            &state.detection,
            defaults,
            input.sync,
        )
        .await
    };

    match result {
        Ok(summary) => Ok(Json(summary).into_response()),
        Err(TriggerError::Busy) => {
            let progress = state.detection.queue.snapshot();
            Ok((
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "detection already running",
                    "progress": progress,
                })),
            )
                .into_response())
        }
        Err(TriggerError::Storage(e)) => {
            if e.to_string().starts_with("channel not found") {
                return Err(ApiError::NotFound("channel not found".to_string()));
            }
            Err(ApiError::Internal(e))
        }
    }
}

#[derive(Serialize)]
struct StopResponse {
    cleared: usize,
}

/// `DELETE /api/detect` — pause-and-drain. Idempotent: a second call finds
/// nothing left to clear.
pub(in crate::server) async fn stop_detection(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let cleared = probe::pause_and_drain(&state.detection);
    Ok(Json(StopResponse { cleared }))
}

pub(in crate::server) async fn detection_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.detection.queue.snapshot()))
}

/// `GET /api/sse/progress` — progress bus subscription. Starts with a
/// `connected` event and heartbeats while idle; a lagging subscriber loses
/// events, never stalls the workers.
pub(in crate::server) async fn sse_progress(
    State(_state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    struct SubscriberState {
        rx: broadcast::Receiver<AppEvent>,
        heartbeat: tokio::time::Interval,
        connected_sent: bool,
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let sub = SubscriberState {
        rx: events::subscribe(),
        heartbeat,
        connected_sent: false,
    };

    let stream = stream::unfold(sub, |mut sub| async move {
        if !sub.connected_sent {
            sub.connected_sent = true;
            return Some((to_sse_event(&AppEvent::Connected), sub));
        }

        loop {
            tokio::select! {
                _ = sub.heartbeat.tick() => {
                    return Some((to_sse_event(&AppEvent::Heartbeat), sub));
                }
                received = sub.rx.recv() => match received {
                    Ok(event) => return Some((to_sse_event(&event), sub)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "sse subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    });

    Sse::new(stream)
}

fn to_sse_event(event: &AppEvent) -> Result<Event, Infallible> {
    Ok(Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}")))
}
