use axum::Json;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::server::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
pub(in crate::server) struct LoginInput {
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_in_secs: i64,
}

pub(in crate::server) async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginInput>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(stored) = state.config.admin_password.as_deref() else {
        return Err(ApiError::Unavailable(
            "ADMIN_PASSWORD 未配置，登录不可用".to_string(),
        ));
    };

    if !auth::verify_password(stored, &input.password) {
        return Err(ApiError::Unauthorized("密码错误".to_string()));
    }

    let token = auth::issue_admin_token()?;
    Ok(Json(LoginResponse {
        token,
        expires_in_secs: 7 * 24 * 3600,
    }))
}

/// Gate for the admin API. Without a configured admin password the gateway
/// runs open, like a local tool.
pub(in crate::server) async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.admin_password.is_none() {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if auth::verify_admin_token(token) => next.run(req).await,
        _ => ApiError::Unauthorized("管理令牌缺失或无效".to_string()).into_response(),
    }
}
