use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::Config;
use crate::storage::{self, SchedulerConfig};
use crate::transport::Transport;

pub mod adapter;
pub mod detector;
mod limits;
mod queue;
mod scheduler;
mod worker;

pub use detector::{ProbeOutcome, ProbeSpec, fetch_model_list, run_probe};
pub use limits::DetectionLimits;
pub use queue::{JobQueue, JobSpec, ProbeJob, QueueSnapshot};
pub use scheduler::{cleanup_loop, cron_loop, validate_cron, validate_timezone};
pub use worker::run_worker;

/// Inter-probe jitter bounds, refreshed from the scheduler config on every
/// trigger.
#[derive(Debug, Clone, Copy)]
pub struct Jitter {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Shared state of the probing engine: the job queue, the admission
/// counters and the worker tuning knobs.
pub struct Detection {
    pub queue: JobQueue,
    pub limits: DetectionLimits,
    jitter: Mutex<Jitter>,
    pub prompt: String,
}

impl Detection {
    pub fn new(config: &Config) -> Self {
        Self {
            queue: JobQueue::new(),
            limits: DetectionLimits::new(config.max_global_concurrency, config.channel_concurrency),
            jitter: Mutex::new(Jitter {
                min_delay_ms: config.detection_min_delay_ms,
                max_delay_ms: config.detection_max_delay_ms,
            }),
            prompt: config.detect_prompt.clone(),
        }
    }

    pub fn jitter(&self) -> Jitter {
        *self.jitter.lock().expect("jitter lock")
    }

    fn apply_scheduler_config(&self, config: &SchedulerConfig) {
        self.limits
            .set_caps(config.global_concurrency, config.channel_concurrency);
        let mut jitter = self.jitter.lock().expect("jitter lock");
        jitter.min_delay_ms = config.min_delay_ms.min(config.max_delay_ms);
        jitter.max_delay_ms = config.max_delay_ms.max(config.min_delay_ms);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub channel_id: String,
    pub channel_name: String,
    pub added: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSummary {
    pub channel_count: usize,
    pub model_count: usize,
    pub job_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_results: Option<Vec<SyncResult>>,
}

#[derive(thiserror::Error, Debug)]
pub enum TriggerError {
    #[error("detection already running")]
    Busy,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Keyword filter for synced model lists: comma-separated substrings, any
/// match keeps the model (case-insensitive). No filter keeps everything.
fn matches_model_filter(filter: Option<&str>, model_name: &str) -> bool {
    let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return true;
    };
    let name = model_name.to_ascii_lowercase();
    filter
        .split(',')
        .map(|kw| kw.trim().to_ascii_lowercase())
        .filter(|kw| !kw.is_empty())
        .any(|kw| name.contains(&kw))
}

/// Fetch a channel's model listing and register previously-unknown models,
/// honoring the channel keyword filter.
pub async fn sync_channel_models(
    db_path: PathBuf,
    transport: &Transport,
    channel: &storage::Channel,
) -> SyncResult {
    let listed =
        fetch_model_list(transport, &channel.base_url, first_key(&channel.api_key), channel.proxy_url.clone())
            .await;

    match listed {
        Ok(names) => {
            let kept: Vec<String> = names
                .into_iter()
                .filter(|n| matches_model_filter(channel.model_filter.as_deref(), n))
                .collect();
            match storage::insert_missing_models(db_path, channel.id.clone(), kept).await {
                Ok(added) => SyncResult {
                    channel_id: channel.id.clone(),
                    channel_name: channel.name.clone(),
                    added,
                    error: None,
                },
                Err(e) => SyncResult {
                    channel_id: channel.id.clone(),
                    channel_name: channel.name.clone(),
                    added: 0,
                    error: Some(e.to_string()),
                },
            }
        }
        Err(e) => SyncResult {
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            added: 0,
            error: Some(e.to_string()),
        },
    }
}

/// Probes authenticate with the first credential of a multi-key channel;
/// round-robin is a relay concern.
fn first_key(api_key: &str) -> &str {
    crate::router::split_credentials(api_key)
        .first()
        .copied()
        .unwrap_or(api_key)
}

fn jobs_for_models(channel: &storage::Channel, models: &[storage::Model]) -> Vec<JobSpec> {
    let api_key = first_key(&channel.api_key).to_string();
    let mut jobs = Vec::new();
    for model in models {
        for endpoint in storage::endpoints_for_model(&model.name) {
            jobs.push(JobSpec {
                channel_id: channel.id.clone(),
                channel_name: channel.name.clone(),
                base_url: channel.base_url.clone(),
                api_key: api_key.clone(),
                proxy: channel.proxy_url.clone(),
                model_id: model.id.clone(),
                model_name: model.name.clone(),
                endpoint,
            });
        }
    }
    jobs
}

async fn load_and_apply_config(
    db_path: PathBuf,
    detection: &Detection,
    defaults: SchedulerConfig,
) -> anyhow::Result<SchedulerConfig> {
    let config = storage::get_scheduler_config(db_path, defaults).await?;
    detection.apply_scheduler_config(&config);
    Ok(config)
}

/// Enqueue probes for every enabled channel. Refuses while any detection
/// work is outstanding; clears a lingering stop flag before enqueueing.
pub async fn trigger_full_detection(
    db_path: PathBuf,
    transport: &Transport,
    detection: &Detection,
    defaults: SchedulerConfig,
    with_sync: bool,
) -> Result<TriggerSummary, TriggerError> {
    if detection.queue.is_busy() {
        return Err(TriggerError::Busy);
    }
    load_and_apply_config(db_path.clone(), detection, defaults).await?;
    detection.queue.clear_stop();

    let channels = storage::list_enabled_channels(db_path.clone()).await?;

    let sync_results = if with_sync {
        let mut results = Vec::with_capacity(channels.len());
        for channel in &channels {
            results.push(sync_channel_models(db_path.clone(), transport, channel).await);
        }
        Some(results)
    } else {
        None
    };

    let mut model_count = 0usize;
    let mut jobs = Vec::new();
    for channel in &channels {
        let models = storage::list_models(db_path.clone(), Some(channel.id.clone())).await?;
        model_count += models.len();
        jobs.extend(jobs_for_models(channel, &models));
    }

    let job_count = detection.queue.enqueue(jobs);
    tracing::info!(
        channels = channels.len(),
        models = model_count,
        jobs = job_count,
        with_sync,
        "full detection triggered"
    );

    Ok(TriggerSummary {
        channel_count: channels.len(),
        model_count,
        job_count,
        sync_results,
    })
}

/// Probe one channel (optionally restricted to a set of its models).
/// Refuses only while that channel is in flight.
pub async fn trigger_channel_detection(
    db_path: PathBuf,
    detection: &Detection,
    defaults: SchedulerConfig,
    channel_id: String,
    model_ids: Option<Vec<String>>,
) -> Result<TriggerSummary, TriggerError> {
    if detection.queue.channel_busy(&channel_id) {
        return Err(TriggerError::Busy);
    }
    load_and_apply_config(db_path.clone(), detection, defaults).await?;
    detection.queue.clear_stop();

    let channel = storage::get_channel(db_path.clone(), channel_id.clone())
        .await?
        .ok_or_else(|| anyhow::anyhow!("channel not found: {channel_id}"))?;

    let mut models = storage::list_models(db_path.clone(), Some(channel.id.clone())).await?;
    if let Some(ids) = model_ids.filter(|ids| !ids.is_empty()) {
        models.retain(|m| ids.contains(&m.id));
    }

    let model_count = models.len();
    let job_count = detection.queue.enqueue(jobs_for_models(&channel, &models));
    tracing::info!(
        channel = %channel.name,
        models = model_count,
        jobs = job_count,
        "channel detection triggered"
    );

    Ok(TriggerSummary {
        channel_count: 1,
        model_count,
        job_count,
        sync_results: None,
    })
}

/// Cron-selected subset: the configured channels, each optionally narrowed
/// to selected model ids.
pub async fn trigger_selective_detection(
    db_path: PathBuf,
    detection: &Detection,
    defaults: SchedulerConfig,
    config: &SchedulerConfig,
) -> Result<TriggerSummary, TriggerError> {
    if detection.queue.is_busy() {
        return Err(TriggerError::Busy);
    }
    load_and_apply_config(db_path.clone(), detection, defaults).await?;
    detection.queue.clear_stop();

    let mut channel_count = 0usize;
    let mut model_count = 0usize;
    let mut jobs = Vec::new();
    for channel_id in &config.selected_channel_ids {
        let Some(channel) = storage::get_channel(db_path.clone(), channel_id.clone()).await? else {
            continue;
        };
        if !channel.enabled {
            continue;
        }
        channel_count += 1;

        let mut models = storage::list_models(db_path.clone(), Some(channel.id.clone())).await?;
        if let Some(selected) = config.selected_model_ids.get(channel_id)
            && !selected.is_empty()
        {
            models.retain(|m| selected.contains(&m.id));
        }
        model_count += models.len();
        jobs.extend(jobs_for_models(&channel, &models));
    }

    let job_count = detection.queue.enqueue(jobs);
    tracing::info!(
        channels = channel_count,
        models = model_count,
        jobs = job_count,
        "selective detection triggered"
    );

    Ok(TriggerSummary {
        channel_count,
        model_count,
        job_count,
        sync_results: None,
    })
}

/// Stop everything: flag set, pending jobs dropped, in-flight probes
/// cancelled, counters zeroed. Idempotent; the second call clears nothing.
pub fn pause_and_drain(detection: &Detection) -> usize {
    detection.queue.set_stop();
    let cleared = detection.queue.drain();
    detection.limits.reset();
    tracing::info!(cleared, "detection stopped and queue drained");
    cleared
}
