use rusqlite::{OptionalExtension as _, Row, params};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use super::endpoint::EndpointKind;
use super::{now_ms, with_conn};

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub detected_endpoints: Vec<EndpointKind>,
    pub last_status: Option<bool>,
    pub last_latency_ms: Option<i64>,
    pub last_checked_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

const MODEL_COLUMNS: &str = "id, channel_id, name, detected_endpoints, last_status, last_latency_ms, last_checked_at_ms, created_at_ms, updated_at_ms";

fn parse_endpoints(raw: &str) -> Vec<EndpointKind> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn endpoints_to_json(endpoints: &[EndpointKind]) -> String {
    let names: Vec<&str> = endpoints.iter().map(|e| e.as_str()).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<Model> {
    let endpoints: String = row.get(3)?;
    Ok(Model {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        name: row.get(2)?,
        detected_endpoints: parse_endpoints(&endpoints),
        last_status: row.get::<_, Option<i64>>(4)?.map(|v| v != 0),
        last_latency_ms: row.get(5)?,
        last_checked_at_ms: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

pub async fn list_models(
    db_path: PathBuf,
    channel_id: Option<String>,
) -> anyhow::Result<Vec<Model>> {
    with_conn(db_path, move |conn| {
        let mut out = Vec::new();
        if let Some(channel_id) = channel_id {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models WHERE channel_id = ?1 ORDER BY name ASC"
            ))?;
            let rows = stmt.query_map([channel_id], row_to_model)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models ORDER BY channel_id ASC, name ASC"
            ))?;
            let rows = stmt.query_map([], row_to_model)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    })
    .await
}

pub async fn get_model(db_path: PathBuf, model_id: String) -> anyhow::Result<Option<Model>> {
    with_conn(db_path, move |conn| {
        conn.prepare(&format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?1"))?
            .query_row([model_id], row_to_model)
            .optional()
            .map_err(Into::into)
    })
    .await
}

/// Insert model rows that the channel reported but we do not yet track.
/// `(channel_id, name)` is the natural key; existing rows are left alone.
pub async fn insert_missing_models(
    db_path: PathBuf,
    channel_id: String,
    names: Vec<String>,
) -> anyhow::Result<usize> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let tx = conn.unchecked_transaction()?;
        let mut added = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO models (id, channel_id, name, detected_endpoints, created_at_ms, updated_at_ms)
                VALUES (?1, ?2, ?3, '[]', ?4, ?4)
                ON CONFLICT(channel_id, name) DO NOTHING
                "#,
            )?;
            for name in names {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let id = Uuid::new_v4().to_string();
                added += stmt.execute(params![id, channel_id, name, ts])?;
            }
        }
        tx.commit()?;
        Ok(added)
    })
    .await
}

/// A successful probe confirms the endpoint: it joins `detected_endpoints`
/// (set semantics) and the freshness columns are refreshed.
pub async fn record_probe_success(
    db_path: PathBuf,
    model_id: String,
    endpoint: EndpointKind,
    latency_ms: i64,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let tx = conn.unchecked_transaction()?;
        let raw: Option<String> = tx
            .query_row(
                r#"SELECT detected_endpoints FROM models WHERE id = ?1"#,
                [&model_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(anyhow::anyhow!("model not found: {model_id}"));
        };

        let mut endpoints = parse_endpoints(&raw);
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }

        tx.execute(
            r#"
            UPDATE models
            SET detected_endpoints = ?2, last_status = 1, last_latency_ms = ?3,
                last_checked_at_ms = ?4, updated_at_ms = ?4
            WHERE id = ?1
            "#,
            params![model_id, endpoints_to_json(&endpoints), latency_ms, ts],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await
}

/// A failed probe only refreshes freshness; a transient failure must not
/// un-detect an endpoint that succeeded before.
pub async fn record_probe_failure(db_path: PathBuf, model_id: String) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let updated = conn.execute(
            r#"
            UPDATE models
            SET last_status = 0, last_checked_at_ms = ?2, updated_at_ms = ?2
            WHERE id = ?1
            "#,
            params![model_id, ts],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("model not found: {model_id}"));
        }
        Ok(())
    })
    .await
}

/// Model joined with its channel for `/v1/models` enumeration. Only models
/// with at least one historically confirmed endpoint qualify.
#[derive(Debug, Clone, Serialize)]
pub struct ReachableModel {
    pub model_id: String,
    pub model_name: String,
    pub channel_id: String,
    pub channel_name: String,
}

pub async fn list_reachable_models(db_path: PathBuf) -> anyhow::Result<Vec<ReachableModel>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT m.id, m.name, c.id, c.name
            FROM models m
            JOIN channels c ON c.id = m.channel_id
            WHERE c.enabled = 1 AND m.detected_endpoints != '[]'
            ORDER BY c.sort_order ASC, c.name ASC, m.name ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReachableModel {
                model_id: row.get(0)?,
                model_name: row.get(1)?,
                channel_id: row.get(2)?,
                channel_name: row.get(3)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

/// Routing view: every enabled channel owning `model_name`, in the
/// deterministic `sort_order` then `name` order the router selects by.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub model_id: String,
    pub model_name: String,
    pub detected_endpoints: Vec<EndpointKind>,
    pub last_status: Option<bool>,
    pub channel_id: String,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub proxy_url: Option<String>,
    pub channel_updated_at_ms: i64,
}

pub async fn list_route_candidates(
    db_path: PathBuf,
    model_name: String,
) -> anyhow::Result<Vec<RouteCandidate>> {
    with_conn(db_path, move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT m.id, m.name, m.detected_endpoints, m.last_status,
                   c.id, c.name, c.base_url, c.api_key, c.proxy_url, c.updated_at_ms
            FROM models m
            JOIN channels c ON c.id = m.channel_id
            WHERE c.enabled = 1 AND m.name = ?1
            ORDER BY c.sort_order ASC, c.name ASC
            "#,
        )?;
        let rows = stmt.query_map([model_name], |row| {
            let endpoints: String = row.get(2)?;
            let base_url: String = row.get(6)?;
            Ok(RouteCandidate {
                model_id: row.get(0)?,
                model_name: row.get(1)?,
                detected_endpoints: parse_endpoints(&endpoints),
                last_status: row.get::<_, Option<i64>>(3)?.map(|v| v != 0),
                channel_id: row.get(4)?,
                channel_name: row.get(5)?,
                base_url: super::channel::normalize_base_url(&base_url),
                api_key: row.get(7)?,
                proxy_url: row.get(8)?,
                channel_updated_at_ms: row.get(9)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}
