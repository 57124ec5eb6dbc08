use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::probe::Detection;
use crate::router::KeyCycler;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub db_path: Arc<PathBuf>,
    pub config: Arc<Config>,
    pub transport: Arc<Transport>,
    pub detection: Arc<Detection>,
    pub cycler: Arc<KeyCycler>,
    /// Bumped on scheduler config changes; the cron loop rebuilds its entry.
    pub scheduler_notify: watch::Sender<u64>,
}

impl AppState {
    pub(crate) fn db_path(&self) -> PathBuf {
        self.db_path.as_ref().clone()
    }
}
