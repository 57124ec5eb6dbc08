use std::path::PathBuf;

use crate::storage::SchedulerConfig;

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: Option<PathBuf>,
    pub admin_password: Option<String>,
    pub cron_schedule: String,
    pub cron_timezone: String,
    pub channel_concurrency: u32,
    pub max_global_concurrency: u32,
    pub detection_min_delay_ms: u64,
    pub detection_max_delay_ms: u64,
    pub global_proxy: Option<String>,
    pub log_retention_days: i64,
    pub auto_detect_enabled: bool,
    pub detect_prompt: String,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        }
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        if env_opt("REDIS_URL").is_some() {
            tracing::warn!(
                "REDIS_URL is set but ignored; queue, semaphores and progress bus are in-process"
            );
        }

        Self {
            host: env_opt("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env_parse("PORT", 3210),
            database_path: env_opt("DATABASE_URL").map(database_path_from_url),
            admin_password: env_opt("ADMIN_PASSWORD"),
            cron_schedule: env_opt("CRON_SCHEDULE").unwrap_or_else(|| "0 3 * * *".to_string()),
            cron_timezone: env_opt("CRON_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
            channel_concurrency: env_parse("CHANNEL_CONCURRENCY", 5),
            max_global_concurrency: env_parse("MAX_GLOBAL_CONCURRENCY", 30),
            detection_min_delay_ms: env_parse("DETECTION_MIN_DELAY_MS", 3000),
            detection_max_delay_ms: env_parse("DETECTION_MAX_DELAY_MS", 5000),
            global_proxy: env_opt("GLOBAL_PROXY"),
            log_retention_days: env_parse("LOG_RETENTION_DAYS", 7),
            auto_detect_enabled: env_bool("AUTO_DETECT_ENABLED", false),
            detect_prompt: env_opt("DETECT_PROMPT")
                .unwrap_or_else(|| "1+1=2? yes or no".to_string()),
        }
    }

    /// Defaults used to seed the scheduler singleton on first start.
    pub fn scheduler_defaults(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.auto_detect_enabled,
            cron: self.cron_schedule.clone(),
            timezone: self.cron_timezone.clone(),
            channel_concurrency: self.channel_concurrency,
            global_concurrency: self.max_global_concurrency,
            min_delay_ms: self.detection_min_delay_ms,
            max_delay_ms: self.detection_max_delay_ms,
            ..SchedulerConfig::default()
        }
    }
}

/// `DATABASE_URL` accepts a bare filesystem path or a `sqlite://` URL.
fn database_path_from_url(url: String) -> PathBuf {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(&url);
    PathBuf::from(path)
}
