use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::auth;
use crate::proxy::{self, RelayError, RelayRequest};
use crate::server::AppState;
use crate::server::error::relay_error_response;
use crate::storage::EndpointKind;

async fn relay(
    state: AppState,
    endpoint: EndpointKind,
    headers: HeaderMap,
    body: Bytes,
    path_model: Option<String>,
    path_stream: bool,
) -> Response {
    let result = proxy::forward(
        state.db_path(),
        &state.transport,
        &state.cycler,
        RelayRequest {
            endpoint,
            headers,
            body,
            path_model,
            path_stream,
        },
    )
    .await;

    match result {
        Ok(resp) => resp.into_response(),
        Err(e) => relay_error_response(e),
    }
}

pub(in crate::server) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, EndpointKind::Chat, headers, body, None, false).await
}

pub(in crate::server) async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, EndpointKind::Claude, headers, body, None, false).await
}

pub(in crate::server) async fn responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, EndpointKind::Codex, headers, body, None, false).await
}

/// Gemini puts the model and the action in the path:
/// `/v1beta/models/{model}:generateContent|streamGenerateContent`.
pub(in crate::server) async fn gemini_generate(
    State(state): State<AppState>,
    axum::extract::Path(model_action): axum::extract::Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return relay_error_response(RelayError::BadRequest(
            "路径缺少 :generateContent 操作".to_string(),
        ));
    };

    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return relay_error_response(RelayError::BadRequest(format!(
                "不支持的操作：{action}"
            )));
        }
    };

    relay(
        state,
        EndpointKind::Gemini,
        headers,
        body,
        Some(model.to_string()),
        stream,
    )
    .await
}

/// `GET /v1/models` — reachable models the presenting key may see, as an
/// OpenAI-style listing with `<channel>/<model>` ids.
pub(in crate::server) async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let policy = match auth::authenticate(state.db_path(), &headers).await {
        Ok(policy) => policy,
        Err(e) => return relay_error_response(e.into()),
    };

    let models = match crate::storage::list_reachable_models(state.db_path()).await {
        Ok(models) => models,
        Err(e) => return relay_error_response(RelayError::Storage(e)),
    };

    let data: Vec<serde_json::Value> = models
        .into_iter()
        .filter(|m| policy.permits(&m.channel_id, &m.model_id))
        .map(|m| {
            json!({
                "id": format!("{}/{}", m.channel_name, m.model_name),
                "object": "model",
                "created": 0,
                "owned_by": m.channel_name,
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data})).into_response()
}
