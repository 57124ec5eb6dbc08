use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::storage::EndpointKind;
use crate::storage::now_ms;

pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_MS: i64 = 5_000;
/// Delay before re-offering a job that found the semaphores saturated.
pub const REQUEUE_DELAY_MS: i64 = 1_000;

const STOP_TTL_MS: i64 = 3_600_000;
const COMPLETED_RETAIN_MS: i64 = 3_600_000;
const COMPLETED_CAP: usize = 1_000;
const FAILED_RETAIN_MS: i64 = 86_400_000;
const FAILED_CAP: usize = 500;

const SNAPSHOT_WAITING_CAP: usize = 1_000;
const SNAPSHOT_DELAYED_CAP: usize = 1_000;
const SNAPSHOT_ACTIVE_CAP: usize = 100;

/// Work order for one `(channel, model, endpoint)` probe.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub channel_id: String,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub proxy: Option<String>,
    pub model_id: String,
    pub model_name: String,
    pub endpoint: EndpointKind,
}

#[derive(Debug, Clone)]
pub struct ProbeJob {
    pub id: String,
    pub spec: JobSpec,
    pub attempt: u32,
}

struct ActiveJob {
    token: CancellationToken,
    channel_id: String,
    model_id: String,
}

#[derive(Default)]
struct QueueInner {
    waiting: VecDeque<ProbeJob>,
    delayed: Vec<(i64, ProbeJob)>,
    active: HashMap<String, ActiveJob>,
    completed: VecDeque<(i64, String)>,
    failed: VecDeque<(i64, String)>,
    /// Outstanding jobs per model for the current detection run; drives
    /// `is_model_complete` on progress events.
    pending_per_model: HashMap<String, u32>,
    stop_until_ms: Option<i64>,
    seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub testing_channel_ids: Vec<String>,
    pub testing_model_ids: Vec<String>,
}

/// In-process job store: waiting deque, delayed jobs with a ready-at time,
/// active jobs with their cancellation handles, and bounded retention of
/// finished ids.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    pub notify: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("job queue lock")
    }

    /// Enqueue a batch. Job ids embed the enqueue timestamp and a sequence
    /// number, so simultaneous runs never collide while a retried job keeps
    /// its identity.
    pub fn enqueue(&self, specs: Vec<JobSpec>) -> usize {
        let count = specs.len();
        let now = now_ms();
        let mut inner = self.lock();
        for spec in specs {
            inner.seq += 1;
            let id = format!(
                "{}-{}-{}-{}-{}",
                spec.channel_id, spec.model_id, spec.endpoint, now, inner.seq
            );
            *inner
                .pending_per_model
                .entry(spec.model_id.clone())
                .or_insert(0) += 1;
            inner.waiting.push_back(ProbeJob {
                id,
                spec,
                attempt: 1,
            });
        }
        drop(inner);
        self.notify.notify_waiters();
        count
    }

    /// Lease the next ready job and register its cancellation handle.
    pub fn lease(&self) -> Option<(ProbeJob, CancellationToken)> {
        let now = now_ms();
        let mut inner = self.lock();

        // Promote delayed jobs whose ready-at has passed.
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].0 <= now {
                let (_, job) = inner.delayed.remove(i);
                inner.waiting.push_back(job);
            } else {
                i += 1;
            }
        }

        let job = inner.waiting.pop_front()?;
        let token = CancellationToken::new();
        inner.active.insert(
            job.id.clone(),
            ActiveJob {
                token: token.clone(),
                channel_id: job.spec.channel_id.clone(),
                model_id: job.spec.model_id.clone(),
            },
        );
        Some((job, token))
    }

    /// Put a leased job back with a delay (semaphore saturated). The job
    /// keeps its pending slot.
    pub fn requeue_with_delay(&self, job: ProbeJob, delay_ms: i64) {
        let mut inner = self.lock();
        inner.active.remove(&job.id);
        let ready_at = now_ms() + delay_ms.max(0);
        inner.delayed.push((ready_at, job));
    }

    /// Schedule a transport retry. The attempt counter was already bumped by
    /// the caller.
    pub fn retry_later(&self, job: ProbeJob, delay_ms: i64) {
        self.requeue_with_delay(job, delay_ms);
    }

    /// Record the final outcome of a leased job. Returns true when this was
    /// the model's last outstanding job.
    pub fn finish(&self, job: &ProbeJob, success: bool) -> bool {
        let now = now_ms();
        let mut inner = self.lock();
        inner.active.remove(&job.id);

        if success {
            inner.completed.push_back((now, job.id.clone()));
            prune_retained(&mut inner.completed, now, COMPLETED_RETAIN_MS, COMPLETED_CAP);
        } else {
            inner.failed.push_back((now, job.id.clone()));
            prune_retained(&mut inner.failed, now, FAILED_RETAIN_MS, FAILED_CAP);
        }

        settle_pending(&mut inner, &job.spec.model_id)
    }

    /// Acknowledge-and-drop a leased job without an outcome (stop observed
    /// before the probe started).
    pub fn drop_leased(&self, job: &ProbeJob) -> bool {
        let mut inner = self.lock();
        inner.active.remove(&job.id);
        settle_pending(&mut inner, &job.spec.model_id)
    }

    pub fn set_stop(&self) {
        self.lock().stop_until_ms = Some(now_ms() + STOP_TTL_MS);
    }

    pub fn clear_stop(&self) {
        self.lock().stop_until_ms = None;
    }

    pub fn stop_requested(&self) -> bool {
        let mut inner = self.lock();
        match inner.stop_until_ms {
            Some(until) if until > now_ms() => true,
            Some(_) => {
                // TTL expired.
                inner.stop_until_ms = None;
                false
            }
            None => false,
        }
    }

    /// Drop all waiting and delayed jobs and cancel the active ones.
    /// Returns the number of dropped (not yet running) jobs.
    pub fn drain(&self) -> usize {
        let mut inner = self.lock();

        let mut cleared = 0usize;
        let waiting: Vec<ProbeJob> = inner.waiting.drain(..).collect();
        let delayed: Vec<(i64, ProbeJob)> = std::mem::take(&mut inner.delayed);
        for job in waiting.iter().chain(delayed.iter().map(|(_, j)| j)) {
            settle_pending(&mut inner, &job.spec.model_id);
            cleared += 1;
        }

        for active in inner.active.values() {
            active.token.cancel();
        }

        cleared
    }

    pub fn is_busy(&self) -> bool {
        let inner = self.lock();
        !(inner.waiting.is_empty() && inner.delayed.is_empty() && inner.active.is_empty())
    }

    pub fn channel_busy(&self, channel_id: &str) -> bool {
        let inner = self.lock();
        inner
            .waiting
            .iter()
            .chain(inner.delayed.iter().map(|(_, j)| j))
            .any(|j| j.spec.channel_id == channel_id)
            || inner
                .active
                .values()
                .any(|a| a.channel_id == channel_id)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();

        let mut channel_ids = Vec::new();
        let mut model_ids = Vec::new();
        let mut push_ids = |channel_id: &str, model_id: &str| {
            if !channel_ids.iter().any(|c| c == channel_id) {
                channel_ids.push(channel_id.to_string());
            }
            if !model_ids.iter().any(|m| m == model_id) {
                model_ids.push(model_id.to_string());
            }
        };

        for job in inner.waiting.iter().take(SNAPSHOT_WAITING_CAP) {
            push_ids(&job.spec.channel_id, &job.spec.model_id);
        }
        for (_, job) in inner.delayed.iter().take(SNAPSHOT_DELAYED_CAP) {
            push_ids(&job.spec.channel_id, &job.spec.model_id);
        }
        for active in inner.active.values().take(SNAPSHOT_ACTIVE_CAP) {
            push_ids(&active.channel_id, &active.model_id);
        }

        QueueSnapshot {
            waiting: inner.waiting.len(),
            active: inner.active.len(),
            delayed: inner.delayed.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            testing_channel_ids: channel_ids,
            testing_model_ids: model_ids,
        }
    }
}

fn settle_pending(inner: &mut QueueInner, model_id: &str) -> bool {
    match inner.pending_per_model.get_mut(model_id) {
        Some(remaining) => {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                inner.pending_per_model.remove(model_id);
                true
            } else {
                false
            }
        }
        None => true,
    }
}

fn prune_retained(list: &mut VecDeque<(i64, String)>, now: i64, retain_ms: i64, cap: usize) {
    while let Some((ts, _)) = list.front() {
        if now - *ts > retain_ms {
            list.pop_front();
        } else {
            break;
        }
    }
    while list.len() > cap {
        list.pop_front();
    }
}
