use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::storage::{self, SchedulerConfig};
use crate::transport::Transport;

use super::{Detection, TriggerError, trigger_full_detection, trigger_selective_detection};

const CLEANUP_CRON: &str = "0 2 * * *";

/// Scheduler cron strings are classic 5-field expressions; the `cron` crate
/// wants a seconds column, so one is prepended before parsing.
pub fn validate_cron(expr: &str) -> anyhow::Result<()> {
    parse_schedule(expr).map(|_| ())
}

pub fn validate_timezone(tz: &str) -> anyhow::Result<()> {
    parse_timezone(tz).map(|_| ())
}

fn parse_schedule(expr: &str) -> anyhow::Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        anyhow::bail!("cron 表达式需要 5 个字段，收到 {fields} 个");
    }
    cron::Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| anyhow::anyhow!("cron 表达式无效：{e}"))
}

fn parse_timezone(tz: &str) -> anyhow::Result<chrono_tz::Tz> {
    tz.parse::<chrono_tz::Tz>()
        .map_err(|_| anyhow::anyhow!("未知时区：{tz}"))
}

fn next_fire(expr: &str, tz: &str, after: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let schedule = parse_schedule(expr)?;
    let tz = parse_timezone(tz)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("cron 表达式没有下一次触发时间"))
}

fn until(next: DateTime<Utc>) -> Duration {
    (next - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Single cron entry for scheduled detection. A config update pokes the
/// watch channel and the loop rebuilds its schedule from the store.
pub async fn cron_loop(
    db_path: PathBuf,
    transport: Arc<Transport>,
    detection: Arc<Detection>,
    defaults: SchedulerConfig,
    mut notify: watch::Receiver<u64>,
) {
    loop {
        let config = match storage::get_scheduler_config(db_path.clone(), defaults.clone()).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(err = %e, "load scheduler config failed");
                defaults.clone()
            }
        };

        if !config.enabled {
            if notify.changed().await.is_err() {
                break;
            }
            continue;
        }

        let next = match next_fire(&config.cron, &config.timezone, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(cron = %config.cron, err = %e, "invalid detection schedule");
                if notify.changed().await.is_err() {
                    break;
                }
                continue;
            }
        };

        tracing::info!(cron = %config.cron, next = %next, "detection schedule armed");

        tokio::select! {
            _ = tokio::time::sleep(until(next)) => {}
            changed = notify.changed() => {
                if changed.is_err() { break; }
                continue;
            }
        }

        let result = if config.probe_all_channels {
            trigger_full_detection(
                db_path.clone(),
                &transport,
                &detection,
                defaults.clone(),
                true,
            )
            .await
        } else {
            trigger_selective_detection(db_path.clone(), &detection, defaults.clone(), &config)
                .await
        };

        match result {
            Ok(summary) => {
                tracing::info!(jobs = summary.job_count, "scheduled detection dispatched");
            }
            Err(TriggerError::Busy) => {
                tracing::warn!("scheduled detection skipped, queue busy");
            }
            Err(TriggerError::Storage(e)) => {
                tracing::warn!(err = %e, "scheduled detection failed");
            }
        }
    }
}

/// Daily retention sweep over probe logs and daily log files.
pub async fn cleanup_loop(db_path: PathBuf, log_dir: PathBuf, retention_days: i64) {
    loop {
        let wait = match next_fire(CLEANUP_CRON, "UTC", Utc::now()) {
            Ok(next) => until(next),
            Err(_) => Duration::from_secs(24 * 3600),
        };
        tokio::time::sleep(wait).await;

        let cutoff = storage::now_ms() - retention_days.max(1) * 86_400_000;
        match storage::purge_probe_logs_before(db_path.clone(), cutoff).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, retention_days, "probe log retention cleanup done");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "probe log retention cleanup failed"),
        }

        let log_dir = log_dir.clone();
        let res = tokio::task::spawn_blocking(move || {
            crate::logging::purge_old_log_files(&log_dir, retention_days)
        })
        .await;
        match res {
            Ok(Ok(deleted)) if deleted > 0 => {
                tracing::info!(deleted, "log file retention cleanup done");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(err = %e, "log file retention cleanup failed"),
            Err(e) => tracing::warn!(err = %e, "log file cleanup task join failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(validate_cron("0 3 * * *").is_ok());
        assert!(validate_cron("*/15 * * * 1-5").is_ok());
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert!(validate_cron("0 3 * *").is_err());
        assert!(validate_cron("0 0 3 * * *").is_err());
        assert!(validate_cron("not a cron").is_err());
    }

    #[test]
    fn timezone_validation() {
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("Asia/Shanghai").is_ok());
        assert!(validate_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn next_fire_is_in_the_future() {
        let now = Utc::now();
        let next = next_fire("0 3 * * *", "UTC", now).unwrap();
        assert!(next > now);
    }
}
