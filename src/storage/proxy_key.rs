use base64::Engine as _;
use rand::RngCore as _;
use rusqlite::{OptionalExtension as _, Row, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::{json_string_vec, now_ms, to_json_string_vec, with_conn};

#[derive(Debug, Clone, Serialize)]
pub struct ProxyKey {
    pub id: String,
    pub name: String,
    pub secret: String,
    pub enabled: bool,
    pub allow_all_models: bool,
    pub allowed_channel_ids: Vec<String>,
    pub allowed_model_ids: Vec<String>,
    pub last_used_at_ms: Option<i64>,
    pub usage_count: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

const KEY_COLUMNS: &str = "id, name, secret, enabled, allow_all_models, allowed_channel_ids, allowed_model_ids, last_used_at_ms, usage_count, created_at_ms, updated_at_ms";

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ProxyKey> {
    let allowed_channels: String = row.get(5)?;
    let allowed_models: String = row.get(6)?;
    Ok(ProxyKey {
        id: row.get(0)?,
        name: row.get(1)?,
        secret: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        allow_all_models: row.get::<_, i64>(4)? != 0,
        allowed_channel_ids: json_string_vec(&allowed_channels),
        allowed_model_ids: json_string_vec(&allowed_models),
        last_used_at_ms: row.get(7)?,
        usage_count: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

pub(crate) fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "mg-{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

pub async fn list_proxy_keys(db_path: PathBuf) -> anyhow::Result<Vec<ProxyKey>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM proxy_keys ORDER BY created_at_ms ASC"
        ))?;
        let rows = stmt.query_map([], row_to_key)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn get_proxy_key(db_path: PathBuf, key_id: String) -> anyhow::Result<Option<ProxyKey>> {
    with_conn(db_path, move |conn| {
        conn.prepare(&format!("SELECT {KEY_COLUMNS} FROM proxy_keys WHERE id = ?1"))?
            .query_row([key_id], row_to_key)
            .optional()
            .map_err(Into::into)
    })
    .await
}

pub async fn find_proxy_key_by_secret(
    db_path: PathBuf,
    secret: String,
) -> anyhow::Result<Option<ProxyKey>> {
    with_conn(db_path, move |conn| {
        conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM proxy_keys WHERE secret = ?1"
        ))?
        .query_row([secret], row_to_key)
        .optional()
        .map_err(Into::into)
    })
    .await
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProxyKey {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub allow_all_models: bool,
    #[serde(default)]
    pub allowed_channel_ids: Vec<String>,
    #[serde(default)]
    pub allowed_model_ids: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_proxy_key(db_path: PathBuf, input: CreateProxyKey) -> anyhow::Result<ProxyKey> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let id = Uuid::new_v4().to_string();
        let secret = generate_secret();
        conn.execute(
            r#"
            INSERT INTO proxy_keys (id, name, secret, enabled, allow_all_models, allowed_channel_ids, allowed_model_ids, usage_count, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            "#,
            params![
                id,
                input.name,
                secret,
                if input.enabled { 1 } else { 0 },
                if input.allow_all_models { 1 } else { 0 },
                to_json_string_vec(&input.allowed_channel_ids),
                to_json_string_vec(&input.allowed_model_ids),
                ts,
            ],
        )?;

        Ok(ProxyKey {
            id,
            name: input.name,
            secret,
            enabled: input.enabled,
            allow_all_models: input.allow_all_models,
            allowed_channel_ids: input.allowed_channel_ids,
            allowed_model_ids: input.allowed_model_ids,
            last_used_at_ms: None,
            usage_count: 0,
            created_at_ms: ts,
            updated_at_ms: ts,
        })
    })
    .await
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProxyKey {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub allow_all_models: Option<bool>,
    pub allowed_channel_ids: Option<Vec<String>>,
    pub allowed_model_ids: Option<Vec<String>>,
}

pub async fn update_proxy_key(
    db_path: PathBuf,
    key_id: String,
    input: UpdateProxyKey,
) -> anyhow::Result<ProxyKey> {
    with_conn(db_path, move |conn| {
        let mut key = conn
            .prepare(&format!("SELECT {KEY_COLUMNS} FROM proxy_keys WHERE id = ?1"))?
            .query_row([&key_id], row_to_key)
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("proxy key not found: {key_id}"))?;

        if let Some(v) = input.name {
            key.name = v;
        }
        if let Some(v) = input.enabled {
            key.enabled = v;
        }
        if let Some(v) = input.allow_all_models {
            key.allow_all_models = v;
        }
        if let Some(v) = input.allowed_channel_ids {
            key.allowed_channel_ids = v;
        }
        if let Some(v) = input.allowed_model_ids {
            key.allowed_model_ids = v;
        }
        key.updated_at_ms = now_ms();

        conn.execute(
            r#"
            UPDATE proxy_keys
            SET name = ?2, enabled = ?3, allow_all_models = ?4,
                allowed_channel_ids = ?5, allowed_model_ids = ?6, updated_at_ms = ?7
            WHERE id = ?1
            "#,
            params![
                key.id,
                key.name,
                if key.enabled { 1 } else { 0 },
                if key.allow_all_models { 1 } else { 0 },
                to_json_string_vec(&key.allowed_channel_ids),
                to_json_string_vec(&key.allowed_model_ids),
                key.updated_at_ms,
            ],
        )?;

        Ok(key)
    })
    .await
}

pub async fn regenerate_proxy_key(db_path: PathBuf, key_id: String) -> anyhow::Result<ProxyKey> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let secret = generate_secret();
        let updated = conn.execute(
            r#"UPDATE proxy_keys SET secret = ?2, updated_at_ms = ?3 WHERE id = ?1"#,
            params![key_id, secret, ts],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("proxy key not found: {key_id}"));
        }

        conn.prepare(&format!("SELECT {KEY_COLUMNS} FROM proxy_keys WHERE id = ?1"))?
            .query_row([&key_id], row_to_key)
            .map_err(Into::into)
    })
    .await
}

pub async fn delete_proxy_key(db_path: PathBuf, key_id: String) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let deleted = conn.execute(r#"DELETE FROM proxy_keys WHERE id = ?1"#, params![key_id])?;
        if deleted == 0 {
            return Err(anyhow::anyhow!("proxy key not found"));
        }
        Ok(())
    })
    .await
}

/// Usage bookkeeping is fire-and-forget on the request path; callers spawn
/// this and ignore the result.
pub async fn touch_proxy_key_usage(db_path: PathBuf, key_id: String) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        conn.execute(
            r#"
            UPDATE proxy_keys
            SET usage_count = usage_count + 1, last_used_at_ms = ?2
            WHERE id = ?1
            "#,
            params![key_id, now_ms()],
        )?;
        Ok(())
    })
    .await
}
