use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

use axum::http::HeaderMap;
use base64::Engine as _;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::storage;

const ADMIN_TOKEN_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing api key")]
    Missing,
    #[error("invalid api key")]
    Invalid,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What a validated proxy key may reach. `allow_all` short-circuits the
/// allow-lists; empty lists deny everything.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub allow_all: bool,
    pub channel_ids: HashSet<String>,
    pub model_ids: HashSet<String>,
}

impl AccessPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            channel_ids: HashSet::new(),
            model_ids: HashSet::new(),
        }
    }

    pub fn permits(&self, channel_id: &str, model_id: &str) -> bool {
        if self.allow_all {
            return true;
        }
        self.channel_ids.contains(channel_id) || self.model_ids.contains(model_id)
    }
}

/// First non-empty credential wins, across the three header conventions the
/// proxied protocols use.
pub fn extract_inbound_key(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(s) = v.to_str()
    {
        let token = s.strip_prefix("Bearer ").unwrap_or(s).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(v) = headers.get(name)
            && let Ok(s) = v.to_str()
        {
            let token = s.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// The built-in gateway key: `PROXY_API_KEY` if set, else generated once and
/// stable for the process lifetime. Never stored; always allow-all.
pub fn builtin_key() -> &'static str {
    static KEY: OnceLock<String> = OnceLock::new();
    KEY.get_or_init(|| match std::env::var("PROXY_API_KEY") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => {
            let key = random_secret();
            tracing::info!("PROXY_API_KEY 未设置，已生成进程内置密钥");
            key
        }
    })
}

/// Resolve the inbound credential to an access policy. Database key usage
/// bookkeeping is spawned and forgotten.
pub async fn authenticate(db_path: PathBuf, headers: &HeaderMap) -> Result<AccessPolicy, AuthError> {
    let Some(presented) = extract_inbound_key(headers) else {
        return Err(AuthError::Missing);
    };

    if presented == builtin_key() {
        return Ok(AccessPolicy::allow_all());
    }

    let Some(key) = storage::find_proxy_key_by_secret(db_path.clone(), presented).await? else {
        return Err(AuthError::Invalid);
    };
    if !key.enabled {
        return Err(AuthError::Invalid);
    }

    let key_id = key.id.clone();
    tokio::spawn(async move {
        let _ = storage::touch_proxy_key_usage(db_path, key_id).await;
    });

    Ok(AccessPolicy {
        allow_all: key.allow_all_models,
        channel_ids: key.allowed_channel_ids.into_iter().collect(),
        model_ids: key.allowed_model_ids.into_iter().collect(),
    })
}

/// Stored admin passwords may be bcrypt hashes (`$2…`) or plaintext.
pub fn verify_password(stored: &str, presented: &str) -> bool {
    if stored.starts_with("$2") {
        bcrypt::verify(presented, stored).unwrap_or(false)
    } else {
        stored == presented
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

fn jwt_secret() -> &'static [u8] {
    static SECRET: OnceLock<Vec<u8>> = OnceLock::new();
    SECRET
        .get_or_init(|| match std::env::var("JWT_SECRET") {
            Ok(v) if !v.trim().is_empty() => v.into_bytes(),
            _ => {
                tracing::warn!("JWT_SECRET 未设置，管理会话在进程重启后失效");
                random_secret().into_bytes()
            }
        })
        .as_slice()
}

pub fn issue_admin_token() -> anyhow::Result<String> {
    let now = storage::now_ms() / 1000;
    let claims = AdminClaims {
        sub: "admin".to_string(),
        iat: now,
        exp: now + ADMIN_TOKEN_TTL_SECS,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret()),
    )
    .map_err(|e| anyhow::anyhow!("签发管理令牌失败：{e}"))
}

pub fn verify_admin_token(token: &str) -> bool {
    jsonwebtoken::decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(jwt_secret()),
        &Validation::default(),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer k1"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("k2"));
        assert_eq!(extract_inbound_key(&headers).unwrap(), "k1");
    }

    #[test]
    fn goog_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("gk"));
        assert_eq!(extract_inbound_key(&headers).unwrap(), "gk");
    }

    #[test]
    fn empty_headers_yield_none() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(extract_inbound_key(&headers).is_none());
    }

    #[test]
    fn empty_allow_lists_deny() {
        let policy = AccessPolicy {
            allow_all: false,
            channel_ids: HashSet::new(),
            model_ids: HashSet::new(),
        };
        assert!(!policy.permits("c", "m"));
    }

    #[test]
    fn either_list_grants() {
        let policy = AccessPolicy {
            allow_all: false,
            channel_ids: HashSet::from(["c1".to_string()]),
            model_ids: HashSet::from(["m9".to_string()]),
        };
        assert!(policy.permits("c1", "mX"));
        assert!(policy.permits("cX", "m9"));
        assert!(!policy.permits("cX", "mX"));
    }

    #[test]
    fn plaintext_and_bcrypt_passwords() {
        assert!(verify_password("hunter2", "hunter2"));
        assert!(!verify_password("hunter2", "other"));
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        assert!(verify_password(&hashed, "hunter2"));
        assert!(!verify_password(&hashed, "other"));
    }

    #[test]
    fn admin_token_roundtrip() {
        let token = issue_admin_token().unwrap();
        assert!(verify_admin_token(&token));
        assert!(!verify_admin_token("not-a-token"));
    }
}
