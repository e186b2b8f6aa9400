use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use hostq_core::{ExecutionId, UpcomingActivity};

/// Sends an activated activity to its host. Results come back later through
/// `Engine::complete`, keyed by execution id.
pub trait Transport: Send + Sync {
    fn dispatch(&self, activity: &UpcomingActivity) -> Result<()>;
}

/// Accepts everything; used when the caller drives results by hand.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn dispatch(&self, activity: &UpcomingActivity) -> Result<()> {
        tracing::debug!(execution_id = %activity.execution_id, "dispatch (noop)");
        Ok(())
    }
}

/// Remembers what was dispatched; can be switched to refuse dispatches.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<ExecutionId>>,
    offline: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ExecutionId> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Transport for RecordingTransport {
    fn dispatch(&self, activity: &UpcomingActivity) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("host {} unreachable", activity.host_id));
        }
        self.sent
            .lock()
            .map_err(|_| anyhow!("transport log poisoned"))?
            .push(activity.execution_id.clone());
        Ok(())
    }
}
