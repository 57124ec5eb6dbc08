use std::sync::OnceLock;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::storage::EndpointKind;

/// One probe finished. `latency` is milliseconds; `is_model_complete` flips
/// to true when the last outstanding endpoint of the model finished for the
/// current detection run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeProgress {
    pub channel_id: String,
    pub model_id: String,
    pub model_name: String,
    pub status: ProbeStatus,
    pub latency: i64,
    pub endpoint_type: EndpointKind,
    pub is_model_complete: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ProbeStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppEvent {
    Connected,
    Progress(ProbeProgress),
    Heartbeat,
    Error { message: String },
}

fn sender() -> &'static broadcast::Sender<AppEvent> {
    static SENDER: OnceLock<broadcast::Sender<AppEvent>> = OnceLock::new();
    SENDER.get_or_init(|| {
        let (tx, _rx) = broadcast::channel(1024);
        tx
    })
}

pub fn subscribe() -> broadcast::Receiver<AppEvent> {
    sender().subscribe()
}

/// Fan-out is lossy on purpose: a slow subscriber lags and drops, it never
/// back-pressures the workers.
pub fn publish(event: AppEvent) {
    let _ = sender().send(event);
}
