use rusqlite::{Connection, OptionalExtension as _, Row, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::{now_ms, with_conn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub proxy_url: Option<String>,
    pub model_filter: Option<String>,
    pub enabled: bool,
    pub sort_order: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Trailing `/` and a trailing `/v1` are stripped so the adapters can append
/// full protocol paths without doubling segments.
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let base_url: String = row.get(2)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: normalize_base_url(&base_url),
        api_key: row.get(3)?,
        proxy_url: row.get(4)?,
        model_filter: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        sort_order: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

const CHANNEL_COLUMNS: &str = "id, name, base_url, api_key, proxy_url, model_filter, enabled, sort_order, created_at_ms, updated_at_ms";

pub async fn list_channels(db_path: PathBuf) -> anyhow::Result<Vec<Channel>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY sort_order ASC, name ASC"
        ))?;
        let rows = stmt.query_map([], row_to_channel)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn list_enabled_channels(db_path: PathBuf) -> anyhow::Result<Vec<Channel>> {
    let channels = list_channels(db_path).await?;
    Ok(channels.into_iter().filter(|c| c.enabled).collect())
}

pub async fn get_channel(db_path: PathBuf, channel_id: String) -> anyhow::Result<Option<Channel>> {
    with_conn(db_path, move |conn| {
        conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"
        ))?
        .query_row([channel_id], row_to_channel)
        .optional()
        .map_err(Into::into)
    })
    .await
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateChannel {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub proxy_url: Option<String>,
    pub model_filter: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_channel(db_path: PathBuf, input: CreateChannel) -> anyhow::Result<Channel> {
    with_conn(db_path, move |conn| {
        let channel = insert_channel(conn, input)?;
        Ok(channel)
    })
    .await
}

fn insert_channel(conn: &Connection, input: CreateChannel) -> anyhow::Result<Channel> {
    let ts = now_ms();
    let id = Uuid::new_v4().to_string();
    let base_url = normalize_base_url(&input.base_url);
    conn.execute(
        r#"
        INSERT INTO channels (id, name, base_url, api_key, proxy_url, model_filter, enabled, sort_order, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            id,
            input.name,
            base_url,
            input.api_key,
            input.proxy_url,
            input.model_filter,
            if input.enabled { 1 } else { 0 },
            input.sort_order,
            ts,
            ts,
        ],
    )?;

    Ok(Channel {
        id,
        name: input.name,
        base_url,
        api_key: input.api_key,
        proxy_url: input.proxy_url,
        model_filter: input.model_filter,
        enabled: input.enabled,
        sort_order: input.sort_order,
        created_at_ms: ts,
        updated_at_ms: ts,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateChannel {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub proxy_url: Option<Option<String>>,
    pub model_filter: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub sort_order: Option<i64>,
}

pub async fn update_channel(
    db_path: PathBuf,
    channel_id: String,
    input: UpdateChannel,
) -> anyhow::Result<Channel> {
    with_conn(db_path, move |conn| {
        let mut channel = conn
            .prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"
            ))?
            .query_row([&channel_id], row_to_channel)
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("channel not found: {channel_id}"))?;

        if let Some(v) = input.name {
            channel.name = v;
        }
        if let Some(v) = input.base_url {
            channel.base_url = normalize_base_url(&v);
        }
        if let Some(v) = input.api_key {
            channel.api_key = v;
        }
        if let Some(v) = input.proxy_url {
            channel.proxy_url = v;
        }
        if let Some(v) = input.model_filter {
            channel.model_filter = v;
        }
        if let Some(v) = input.enabled {
            channel.enabled = v;
        }
        if let Some(v) = input.sort_order {
            channel.sort_order = v;
        }
        channel.updated_at_ms = now_ms();

        conn.execute(
            r#"
            UPDATE channels
            SET name = ?2, base_url = ?3, api_key = ?4, proxy_url = ?5, model_filter = ?6,
                enabled = ?7, sort_order = ?8, updated_at_ms = ?9
            WHERE id = ?1
            "#,
            params![
                channel.id,
                channel.name,
                channel.base_url,
                channel.api_key,
                channel.proxy_url,
                channel.model_filter,
                if channel.enabled { 1 } else { 0 },
                channel.sort_order,
                channel.updated_at_ms,
            ],
        )?;

        Ok(channel)
    })
    .await
}

/// Deleting a channel cascades to its models and their probe logs in one
/// transaction.
pub async fn delete_channel(db_path: PathBuf, channel_id: String) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            r#"
            DELETE FROM probe_logs
            WHERE model_id IN (SELECT id FROM models WHERE channel_id = ?1)
            "#,
            params![channel_id],
        )?;
        tx.execute(
            r#"DELETE FROM models WHERE channel_id = ?1"#,
            params![channel_id],
        )?;
        let deleted = tx.execute(r#"DELETE FROM channels WHERE id = ?1"#, params![channel_id])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(anyhow::anyhow!("channel not found"));
        }
        Ok(())
    })
    .await
}

/// Portable channel snapshot used by the export/import reconcile (remote
/// mirror boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelExport {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub proxy_url: Option<String>,
    pub model_filter: Option<String>,
    pub enabled: bool,
    pub sort_order: i64,
}

pub async fn export_channels(db_path: PathBuf) -> anyhow::Result<Vec<ChannelExport>> {
    let channels = list_channels(db_path).await?;
    Ok(channels
        .into_iter()
        .map(|c| ChannelExport {
            name: c.name,
            base_url: c.base_url,
            api_key: c.api_key,
            proxy_url: c.proxy_url,
            model_filter: c.model_filter,
            enabled: c.enabled,
            sort_order: c.sort_order,
        })
        .collect())
}

/// Idempotent reconcile: `(base_url, api_key)` is the natural identity of a
/// channel, so re-importing the same snapshot inserts nothing new.
pub async fn import_channels(
    db_path: PathBuf,
    items: Vec<ChannelExport>,
) -> anyhow::Result<usize> {
    with_conn(db_path, move |conn| {
        let mut existing = std::collections::HashSet::<(String, String)>::new();
        {
            let mut stmt = conn.prepare(r#"SELECT base_url, api_key FROM channels"#)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let base_url: String = row.get(0)?;
                existing.insert((normalize_base_url(&base_url), row.get(1)?));
            }
        }

        let tx = conn.unchecked_transaction()?;
        let mut added = 0usize;
        for item in items {
            let key = (normalize_base_url(&item.base_url), item.api_key.clone());
            if !existing.insert(key) {
                continue;
            }
            insert_channel(
                &tx,
                CreateChannel {
                    name: item.name,
                    base_url: item.base_url,
                    api_key: item.api_key,
                    proxy_url: item.proxy_url,
                    model_filter: item.model_filter,
                    sort_order: item.sort_order,
                    enabled: item.enabled,
                },
            )?;
            added += 1;
        }
        tx.commit()?;
        Ok(added)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::normalize_base_url;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("https://u.example/"), "https://u.example");
        assert_eq!(normalize_base_url("https://u.example/v1"), "https://u.example");
        assert_eq!(normalize_base_url("https://u.example/v1/"), "https://u.example");
        assert_eq!(
            normalize_base_url("https://u.example/openai/v1"),
            "https://u.example/openai"
        );
        assert_eq!(
            normalize_base_url("https://u.example/v1beta"),
            "https://u.example/v1beta"
        );
    }
}
