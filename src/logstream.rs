//! Observable run progress: persisted log lines plus a live broadcast feed.
//!
//! Every emitted line is written to the store first (which assigns the
//! per-run sequence number) and then fanned out to subscribers as a JSON
//! frame. Persistence is the source of truth; the broadcast is best-effort
//! and send errors from having no subscribers are ignored.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{ExecutionLog, ExecutionRun, LogLevel, RunStatus};
use crate::store::StoreHandle;

/// Buffered frames per subscriber before lagging kicks in.
const BROADCAST_CAPACITY: usize = 256;

/// A frame on the live event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Log { log: ExecutionLog },
    Status { run_id: String, status: RunStatus },
    RunFinished { run: ExecutionRun },
}

#[derive(Clone)]
pub struct LogStream {
    store: StoreHandle,
    tx: broadcast::Sender<String>,
}

impl LogStream {
    pub fn new(store: StoreHandle) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { store, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    /// Append a log line for a run and broadcast it.
    ///
    /// A store failure here is reported but does not abort the caller:
    /// losing a log line must never fail a run.
    pub async fn emit(&self, run_id: &str, step: &str, level: LogLevel, message: &str) {
        let run_id = run_id.to_string();
        let step = step.to_string();
        let message = message.to_string();
        let appended = self
            .store
            .call(move |store| store.append_log(&run_id, &step, level, &message))
            .await;
        match appended {
            Ok(log) => self.broadcast(&Event::Log { log }),
            Err(e) => tracing::warn!("failed to persist log line: {:#}", e),
        }
    }

    pub async fn info(&self, run_id: &str, step: &str, message: &str) {
        self.emit(run_id, step, LogLevel::Info, message).await;
    }

    pub async fn warn(&self, run_id: &str, step: &str, message: &str) {
        self.emit(run_id, step, LogLevel::Warn, message).await;
    }

    pub async fn error(&self, run_id: &str, step: &str, message: &str) {
        self.emit(run_id, step, LogLevel::Error, message).await;
    }

    /// Announce a status change on the live feed. The durable transition has
    /// already happened in the store by the time this is called.
    pub fn status(&self, run_id: &str, status: RunStatus) {
        self.broadcast(&Event::Status {
            run_id: run_id.to_string(),
            status,
        });
    }

    pub fn finished(&self, run: ExecutionRun) {
        self.broadcast(&Event::RunFinished { run });
    }

    fn broadcast(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => tracing::warn!("failed to serialize event: {}", e),
        }
    }
}
