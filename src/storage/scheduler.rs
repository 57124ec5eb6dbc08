use rusqlite::{Connection, OptionalExtension as _, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{now_ms, with_conn};

const KEY_ENABLED: &str = "detection_enabled";
const KEY_CRON: &str = "detection_cron";
const KEY_TIMEZONE: &str = "detection_timezone";
const KEY_CHANNEL_CONCURRENCY: &str = "channel_concurrency";
const KEY_GLOBAL_CONCURRENCY: &str = "global_concurrency";
const KEY_MIN_DELAY_MS: &str = "min_delay_ms";
const KEY_MAX_DELAY_MS: &str = "max_delay_ms";
const KEY_PROBE_ALL: &str = "probe_all_channels";
const KEY_SELECTED_CHANNELS: &str = "selected_channel_ids";
const KEY_SELECTED_MODELS: &str = "selected_model_ids";

/// Singleton scheduler configuration. Stored as key/value rows; read and
/// written as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
    pub channel_concurrency: u32,
    pub global_concurrency: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub probe_all_channels: bool,
    pub selected_channel_ids: Vec<String>,
    /// Selected model ids keyed by channel id; empty list means the whole
    /// channel.
    pub selected_model_ids: HashMap<String, Vec<String>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 3 * * *".to_string(),
            timezone: "UTC".to_string(),
            channel_concurrency: 5,
            global_concurrency: 30,
            min_delay_ms: 3000,
            max_delay_ms: 5000,
            probe_all_channels: true,
            selected_channel_ids: Vec::new(),
            selected_model_ids: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigPatch {
    pub enabled: Option<bool>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub channel_concurrency: Option<u32>,
    pub global_concurrency: Option<u32>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub probe_all_channels: Option<bool>,
    pub selected_channel_ids: Option<Vec<String>>,
    pub selected_model_ids: Option<HashMap<String, Vec<String>>>,
}

fn get_value(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM scheduler_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn set_value(conn: &Connection, key: &str, value: &str, ts: i64) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO scheduler_config (key, value, updated_at_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
          value = excluded.value,
          updated_at_ms = excluded.updated_at_ms
        "#,
        params![key, value, ts],
    )?;
    Ok(())
}

fn parse_bool(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn read_config(conn: &Connection, defaults: &SchedulerConfig) -> anyhow::Result<SchedulerConfig> {
    let mut out = defaults.clone();

    if let Some(v) = get_value(conn, KEY_ENABLED)? {
        out.enabled = parse_bool(&v);
    }
    if let Some(v) = get_value(conn, KEY_CRON)? {
        out.cron = v;
    }
    if let Some(v) = get_value(conn, KEY_TIMEZONE)? {
        out.timezone = v;
    }
    if let Some(v) = get_value(conn, KEY_CHANNEL_CONCURRENCY)?
        && let Ok(n) = v.trim().parse::<u32>()
    {
        out.channel_concurrency = n;
    }
    if let Some(v) = get_value(conn, KEY_GLOBAL_CONCURRENCY)?
        && let Ok(n) = v.trim().parse::<u32>()
    {
        out.global_concurrency = n;
    }
    if let Some(v) = get_value(conn, KEY_MIN_DELAY_MS)?
        && let Ok(n) = v.trim().parse::<u64>()
    {
        out.min_delay_ms = n;
    }
    if let Some(v) = get_value(conn, KEY_MAX_DELAY_MS)?
        && let Ok(n) = v.trim().parse::<u64>()
    {
        out.max_delay_ms = n;
    }
    if let Some(v) = get_value(conn, KEY_PROBE_ALL)? {
        out.probe_all_channels = parse_bool(&v);
    }
    if let Some(v) = get_value(conn, KEY_SELECTED_CHANNELS)?
        && let Ok(ids) = serde_json::from_str::<Vec<String>>(&v)
    {
        out.selected_channel_ids = ids;
    }
    if let Some(v) = get_value(conn, KEY_SELECTED_MODELS)?
        && let Ok(ids) = serde_json::from_str::<HashMap<String, Vec<String>>>(&v)
    {
        out.selected_model_ids = ids;
    }

    Ok(out)
}

fn write_config(conn: &Connection, config: &SchedulerConfig) -> anyhow::Result<()> {
    let ts = now_ms();
    let tx = conn.unchecked_transaction()?;
    set_value(&tx, KEY_ENABLED, if config.enabled { "true" } else { "false" }, ts)?;
    set_value(&tx, KEY_CRON, &config.cron, ts)?;
    set_value(&tx, KEY_TIMEZONE, &config.timezone, ts)?;
    set_value(&tx, KEY_CHANNEL_CONCURRENCY, &config.channel_concurrency.to_string(), ts)?;
    set_value(&tx, KEY_GLOBAL_CONCURRENCY, &config.global_concurrency.to_string(), ts)?;
    set_value(&tx, KEY_MIN_DELAY_MS, &config.min_delay_ms.to_string(), ts)?;
    set_value(&tx, KEY_MAX_DELAY_MS, &config.max_delay_ms.to_string(), ts)?;
    set_value(
        &tx,
        KEY_PROBE_ALL,
        if config.probe_all_channels { "true" } else { "false" },
        ts,
    )?;
    set_value(
        &tx,
        KEY_SELECTED_CHANNELS,
        &serde_json::to_string(&config.selected_channel_ids)?,
        ts,
    )?;
    set_value(
        &tx,
        KEY_SELECTED_MODELS,
        &serde_json::to_string(&config.selected_model_ids)?,
        ts,
    )?;
    tx.commit()?;
    Ok(())
}

pub async fn get_scheduler_config(
    db_path: PathBuf,
    defaults: SchedulerConfig,
) -> anyhow::Result<SchedulerConfig> {
    with_conn(db_path, move |conn| read_config(conn, &defaults)).await
}

/// Persist the process defaults once so later reads are stable even if the
/// environment changes between restarts.
pub async fn seed_scheduler_config(
    db_path: PathBuf,
    defaults: SchedulerConfig,
) -> anyhow::Result<SchedulerConfig> {
    with_conn(db_path, move |conn| {
        let seeded: Option<String> = get_value(conn, KEY_CRON)?;
        if seeded.is_none() {
            write_config(conn, &defaults)?;
        }
        read_config(conn, &defaults)
    })
    .await
}

/// The whole singleton is rewritten in one transaction; partial updates are
/// merged onto the current row set first.
pub async fn update_scheduler_config(
    db_path: PathBuf,
    defaults: SchedulerConfig,
    patch: SchedulerConfigPatch,
) -> anyhow::Result<SchedulerConfig> {
    with_conn(db_path, move |conn| {
        let mut config = read_config(conn, &defaults)?;

        if let Some(v) = patch.enabled {
            config.enabled = v;
        }
        if let Some(v) = patch.cron {
            config.cron = v;
        }
        if let Some(v) = patch.timezone {
            config.timezone = v;
        }
        if let Some(v) = patch.channel_concurrency {
            config.channel_concurrency = v;
        }
        if let Some(v) = patch.global_concurrency {
            config.global_concurrency = v;
        }
        if let Some(v) = patch.min_delay_ms {
            config.min_delay_ms = v;
        }
        if let Some(v) = patch.max_delay_ms {
            config.max_delay_ms = v;
        }
        if let Some(v) = patch.probe_all_channels {
            config.probe_all_channels = v;
        }
        if let Some(v) = patch.selected_channel_ids {
            config.selected_channel_ids = v;
        }
        if let Some(v) = patch.selected_model_ids {
            config.selected_model_ids = v;
        }

        write_config(conn, &config)?;
        Ok(config)
    })
    .await
}
