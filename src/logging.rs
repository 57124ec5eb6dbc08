use anyhow::Context as _;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use time::{Date, OffsetDateTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn today_local() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}

fn format_ymd(date: Date) -> anyhow::Result<String> {
    static FMT: OnceLock<Vec<time::format_description::FormatItem<'static>>> = OnceLock::new();
    let fmt = FMT.get_or_init(|| {
        time::format_description::parse("[year]-[month]-[day]").expect("valid format")
    });
    Ok(date.format(fmt).context("格式化日期失败")?)
}

fn open_daily_log_file(log_dir: &Path, date: Date) -> anyhow::Result<File> {
    let name = format!("{}.log", format_ymd(date)?);
    let path = log_dir.join(name);
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("打开日志文件失败：{}", path.display()))?)
}

struct LocalDailyFileAppender {
    log_dir: PathBuf,
    current_date: Date,
    file: File,
}

impl LocalDailyFileAppender {
    fn new(log_dir: PathBuf) -> anyhow::Result<Self> {
        let current_date = today_local();
        let file = open_daily_log_file(&log_dir, current_date)?;
        Ok(Self {
            log_dir,
            current_date,
            file,
        })
    }

    fn maybe_rollover(&mut self) -> anyhow::Result<()> {
        let date = today_local();
        if date != self.current_date {
            self.current_date = date;
            self.file = open_daily_log_file(&self.log_dir, date)?;
        }
        Ok(())
    }
}

impl std::io::Write for LocalDailyFileAppender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Err(e) = self.maybe_rollover() {
            return Err(std::io::Error::other(e));
        }
        std::io::Write::write(&mut self.file, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut self.file)
    }
}

pub fn init(data_dir: &Path) -> anyhow::Result<()> {
    let log_dir = crate::app::logs_dir(data_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("创建日志目录失败：{}", log_dir.display()))?;

    let env_filter = match std::env::var("MODELGATE_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::new(v),
        _ => EnvFilter::new("info"),
    };

    let file_appender =
        LocalDailyFileAppender::new(log_dir.clone()).context("初始化日志文件写入器失败")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    FILE_GUARD
        .set(file_guard)
        .map_err(|_| anyhow::anyhow!("日志系统已初始化"))?;

    Ok(())
}

/// Delete daily log files older than the retention window. Files that do not
/// parse as `YYYY-MM-DD.log` are left alone.
pub fn purge_old_log_files(log_dir: &Path, retention_days: i64) -> anyhow::Result<usize> {
    let cutoff = today_local() - time::Duration::days(retention_days.max(1));
    let mut deleted = 0usize;

    let entries = match std::fs::read_dir(log_dir) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("读取日志目录失败：{}", log_dir.display()));
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".log") else {
            continue;
        };
        let Some(date) = parse_ymd(stem) else {
            continue;
        };
        if date < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            deleted += 1;
        }
    }

    Ok(deleted)
}

fn parse_ymd(s: &str) -> Option<Date> {
    let mut parts = s.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()
}
