use anyhow::Context as _;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

mod channel;
mod endpoint;
mod model;
mod probe_log;
mod proxy_key;
mod scheduler;

pub use channel::{
    Channel, ChannelExport, CreateChannel, UpdateChannel, create_channel, delete_channel,
    export_channels, get_channel, import_channels, list_channels, list_enabled_channels,
    update_channel,
};
pub use endpoint::{EndpointKind, endpoints_for_model};
pub use model::{
    Model, RouteCandidate, ReachableModel, get_model, insert_missing_models, list_models,
    list_reachable_models, list_route_candidates, record_probe_failure, record_probe_success,
};
pub use probe_log::{
    CreateProbeLog, ProbeLog, insert_probe_log, list_probe_logs_for_model, purge_probe_logs_before,
};
pub use proxy_key::{
    CreateProxyKey, ProxyKey, UpdateProxyKey, create_proxy_key, delete_proxy_key,
    find_proxy_key_by_secret, get_proxy_key, list_proxy_keys, regenerate_proxy_key,
    touch_proxy_key_usage, update_proxy_key,
};
pub use scheduler::{
    SchedulerConfig, SchedulerConfigPatch, get_scheduler_config, seed_scheduler_config,
    update_scheduler_config,
};

pub fn init_db(db_path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open(db_path).with_context(|| "打开 SQLite 文件失败")?;

    let migration = include_str!("../../migrations/001_init.sql");
    conn.execute_batch(migration)
        .with_context(|| "执行 migrations/001_init.sql 失败")?;

    Ok(())
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn with_conn<T, F>(db_path: PathBuf, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("打开 SQLite 文件失败：{}", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        f(&conn)
    })
    .await
    .context("等待 sqlite blocking 任务失败")?
}

fn json_string_vec(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn to_json_string_vec(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}
