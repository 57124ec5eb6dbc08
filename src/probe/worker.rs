use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::events::{self, AppEvent, ProbeProgress, ProbeStatus};
use crate::storage::{self, CreateProbeLog};
use crate::transport::{FetchError, Transport};

use super::detector::{ProbeOutcome, ProbeSpec};
use super::queue::{MAX_ATTEMPTS, ProbeJob, REQUEUE_DELAY_MS, RETRY_BASE_MS};
use super::{Detection, detector};

pub const STOPPED_MESSAGE: &str = "Detection stopped by user";

const IDLE_POLL: Duration = Duration::from_millis(250);

/// One worker task: lease, gate through the semaphores, jitter, probe,
/// record, publish. Spawn as many as the global concurrency cap.
pub async fn run_worker(db_path: PathBuf, transport: Arc<Transport>, detection: Arc<Detection>) {
    loop {
        let Some((job, cancel)) = detection.queue.lease() else {
            // Delayed jobs have no wakeup of their own, hence the timed poll.
            tokio::select! {
                _ = detection.queue.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        };

        if detection.queue.stop_requested() {
            detection.queue.drop_leased(&job);
            continue;
        }

        if !detection.limits.try_acquire(&job.spec.channel_id) {
            detection.queue.requeue_with_delay(job, REQUEUE_DELAY_MS);
            continue;
        }

        let channel_id = job.spec.channel_id.clone();
        process_leased(&db_path, &transport, &detection, job, cancel).await;
        detection.limits.release(&channel_id);
    }
}

async fn process_leased(
    db_path: &PathBuf,
    transport: &Transport,
    detection: &Detection,
    job: ProbeJob,
    cancel: CancellationToken,
) {
    let started = Instant::now();

    // Anti-burst jitter, taken while holding both slots.
    let jitter = detection.jitter();
    let wait_ms = if jitter.max_delay_ms > jitter.min_delay_ms {
        rand::thread_rng().gen_range(jitter.min_delay_ms..=jitter.max_delay_ms)
    } else {
        jitter.min_delay_ms
    };
    tokio::select! {
        _ = cancel.cancelled() => {
            record_final(db_path, detection, &job, cancelled_outcome(&started)).await;
            return;
        }
        _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
    }

    let spec = ProbeSpec {
        base_url: job.spec.base_url.clone(),
        api_key: job.spec.api_key.clone(),
        proxy: job.spec.proxy.clone(),
        model_name: job.spec.model_name.clone(),
        endpoint: job.spec.endpoint,
        prompt: detection.prompt.clone(),
    };

    match detector::run_probe(transport, &spec, &cancel).await {
        Ok(outcome) => record_final(db_path, detection, &job, outcome).await,
        Err(FetchError::Cancelled) => {
            record_final(db_path, detection, &job, cancelled_outcome(&started)).await;
        }
        Err(e) => {
            if job.attempt < MAX_ATTEMPTS {
                let delay = RETRY_BASE_MS << (job.attempt - 1);
                tracing::debug!(
                    job = %job.id,
                    attempt = job.attempt,
                    delay_ms = delay,
                    err = %e,
                    "probe transport error, retrying"
                );
                let mut retry = job;
                retry.attempt += 1;
                detection.queue.retry_later(retry, delay);
                return;
            }

            let outcome = ProbeOutcome {
                success: false,
                latency_ms: started.elapsed().as_millis() as i64,
                upstream_status: None,
                error_message: Some(e.to_string()),
                response_preview: None,
            };
            record_final(db_path, detection, &job, outcome).await;
        }
    }
}

fn cancelled_outcome(started: &Instant) -> ProbeOutcome {
    ProbeOutcome {
        success: false,
        latency_ms: started.elapsed().as_millis() as i64,
        upstream_status: None,
        error_message: Some(STOPPED_MESSAGE.to_string()),
        response_preview: None,
    }
}

/// Persist the probe outcome and fan out the progress event. Storage
/// failures are logged, never fatal to the worker.
async fn record_final(
    db_path: &PathBuf,
    detection: &Detection,
    job: &ProbeJob,
    outcome: ProbeOutcome,
) {
    let log = CreateProbeLog {
        model_id: job.spec.model_id.clone(),
        endpoint: job.spec.endpoint,
        success: outcome.success,
        latency_ms: outcome.latency_ms,
        upstream_status: outcome.upstream_status,
        error_message: outcome.error_message.clone(),
        response_preview: outcome.response_preview.clone(),
    };
    if let Err(e) = storage::insert_probe_log(db_path.clone(), log).await {
        tracing::warn!(job = %job.id, err = %e, "insert probe log failed");
        events::publish(AppEvent::Error {
            message: format!("probe log write failed: {e}"),
        });
    }

    let model_update = if outcome.success {
        storage::record_probe_success(
            db_path.clone(),
            job.spec.model_id.clone(),
            job.spec.endpoint,
            outcome.latency_ms,
        )
        .await
    } else {
        storage::record_probe_failure(db_path.clone(), job.spec.model_id.clone()).await
    };
    if let Err(e) = model_update {
        tracing::warn!(job = %job.id, err = %e, "update model probe state failed");
    }

    let is_model_complete = detection.queue.finish(job, outcome.success);

    tracing::debug!(
        job = %job.id,
        channel = %job.spec.channel_name,
        model = %job.spec.model_name,
        endpoint = %job.spec.endpoint,
        success = outcome.success,
        latency_ms = outcome.latency_ms,
        error = outcome.error_message.as_deref().unwrap_or("-"),
        "probe finished"
    );

    events::publish(AppEvent::Progress(ProbeProgress {
        channel_id: job.spec.channel_id.clone(),
        model_id: job.spec.model_id.clone(),
        model_name: job.spec.model_name.clone(),
        status: if outcome.success {
            ProbeStatus::Success
        } else {
            ProbeStatus::Fail
        },
        latency: outcome.latency_ms,
        endpoint_type: job.spec.endpoint,
        is_model_complete,
    }));
}
