use rusqlite::{Row, params};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use super::endpoint::EndpointKind;
use super::{now_ms, with_conn};

const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeLog {
    pub id: String,
    pub model_id: String,
    pub endpoint: EndpointKind,
    pub success: bool,
    pub latency_ms: i64,
    pub upstream_status: Option<i64>,
    pub error_message: Option<String>,
    pub response_preview: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CreateProbeLog {
    pub model_id: String,
    pub endpoint: EndpointKind,
    pub success: bool,
    pub latency_ms: i64,
    pub upstream_status: Option<i64>,
    pub error_message: Option<String>,
    pub response_preview: Option<String>,
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = String::with_capacity(max_len + 1);
    let keep = max_len.saturating_sub(1);
    for ch in s.chars() {
        if out.len() + ch.len_utf8() > keep {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

/// Probe logs are append-only; rows are never updated in place.
pub async fn insert_probe_log(db_path: PathBuf, input: CreateProbeLog) -> anyhow::Result<ProbeLog> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        let id = Uuid::new_v4().to_string();
        let error_message = input.error_message.map(|m| truncate(&m, MAX_MESSAGE_LEN));
        let response_preview = input
            .response_preview
            .map(|m| truncate(&m, MAX_MESSAGE_LEN));
        conn.execute(
            r#"
            INSERT INTO probe_logs (id, model_id, endpoint, success, latency_ms, upstream_status, error_message, response_preview, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                input.model_id,
                input.endpoint.as_str(),
                if input.success { 1 } else { 0 },
                input.latency_ms,
                input.upstream_status,
                error_message,
                response_preview,
                ts,
            ],
        )?;

        Ok(ProbeLog {
            id,
            model_id: input.model_id,
            endpoint: input.endpoint,
            success: input.success,
            latency_ms: input.latency_ms,
            upstream_status: input.upstream_status,
            error_message,
            response_preview,
            created_at_ms: ts,
        })
    })
    .await
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<ProbeLog> {
    let endpoint: String = row.get(2)?;
    Ok(ProbeLog {
        id: row.get(0)?,
        model_id: row.get(1)?,
        endpoint: endpoint.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into_boxed_dyn_error(),
            )
        })?,
        success: row.get::<_, i64>(3)? != 0,
        latency_ms: row.get(4)?,
        upstream_status: row.get(5)?,
        error_message: row.get(6)?,
        response_preview: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

pub async fn list_probe_logs_for_model(
    db_path: PathBuf,
    model_id: String,
    limit: i64,
) -> anyhow::Result<Vec<ProbeLog>> {
    with_conn(db_path, move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, model_id, endpoint, success, latency_ms, upstream_status, error_message, response_preview, created_at_ms
            FROM probe_logs
            WHERE model_id = ?1
            ORDER BY created_at_ms DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![model_id, limit], row_to_log)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn purge_probe_logs_before(db_path: PathBuf, cutoff_ms: i64) -> anyhow::Result<usize> {
    with_conn(db_path, move |conn| {
        let deleted = conn.execute(
            r#"DELETE FROM probe_logs WHERE created_at_ms < ?1"#,
            params![cutoff_ms],
        )?;
        Ok(deleted)
    })
    .await
}
