//! Shared sync progress record.
//!
//! Writers replace the whole [`SyncProgress`] value under the channel's write
//! lock; readers only ever get a cloned snapshot.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use wotrack_core::{SyncProgress, SyncStatus};

static GLOBAL: LazyLock<ProgressTracker> = LazyLock::new(ProgressTracker::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("progress can only be reset from a finished run (current status {0:?})")]
    NotTerminal(SyncStatus),
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<SyncProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncProgress::idle(Utc::now()));
        Self { tx: Arc::new(tx) }
    }

    /// The process-wide tracker shared by the pipeline, scheduler and web surface.
    pub fn global() -> &'static ProgressTracker {
        &GLOBAL
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    /// IDLE/COMPLETED/ERROR -> RUNNING. Rejected while another run is RUNNING.
    pub fn begin(&self, total: usize, message: impl Into<String>) -> Result<(), ProgressError> {
        let message = message.into();
        let mut rejected = false;
        self.tx.send_if_modified(|current| {
            if current.status == SyncStatus::Running {
                rejected = true;
                return false;
            }
            *current = SyncProgress {
                total,
                current: 0,
                status: SyncStatus::Running,
                message,
                last_update: Utc::now(),
            };
            true
        });
        if rejected {
            Err(ProgressError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    /// Set the row total once the snapshot has been loaded.
    pub fn set_total(&self, total: usize, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|current| {
            if current.status != SyncStatus::Running {
                return false;
            }
            *current = SyncProgress {
                total,
                current: current.current.min(total),
                status: SyncStatus::Running,
                message,
                last_update: Utc::now(),
            };
            true
        });
    }

    /// Publish rows processed so far. `current` never decreases and never
    /// exceeds `total`.
    pub fn advance(&self, processed: usize, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|current| {
            if current.status != SyncStatus::Running {
                return false;
            }
            *current = SyncProgress {
                total: current.total,
                current: processed.max(current.current).min(current.total),
                status: SyncStatus::Running,
                message,
                last_update: Utc::now(),
            };
            true
        });
    }

    /// RUNNING -> COMPLETED or ERROR.
    pub fn finish(&self, status: SyncStatus, message: impl Into<String>) {
        debug_assert!(status.is_terminal());
        let message = message.into();
        self.tx.send_if_modified(|current| {
            if current.status != SyncStatus::Running {
                return false;
            }
            *current = SyncProgress {
                total: current.total,
                current: current.current,
                status,
                message,
                last_update: Utc::now(),
            };
            true
        });
    }

    /// COMPLETED/ERROR -> IDLE.
    pub fn reset(&self) -> Result<SyncProgress, ProgressError> {
        let mut outcome = Err(ProgressError::NotTerminal(SyncStatus::Idle));
        self.tx.send_if_modified(|current| {
            if !current.status.is_terminal() {
                outcome = Err(ProgressError::NotTerminal(current.status));
                return false;
            }
            *current = SyncProgress::idle(Utc::now());
            outcome = Ok(current.clone());
            true
        });
        outcome
    }
}
