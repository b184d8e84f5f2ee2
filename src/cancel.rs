//! Cooperative cancellation shared between the orchestrator, the retry loop
//! and running subprocesses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag.
///
/// Cloning yields a handle to the same flag. Raising it prevents new attempts
/// from starting; whether running subprocesses are killed depends on the
/// [CancelPolicy].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    raised: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            log::info!(target: "orchestrator", "Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// What happens to a subprocess that is already running when cancellation is
/// raised.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Kill the subprocess; the attempt ends as cancelled.
    #[default]
    Kill,
    /// Let the subprocess run to completion.
    Finish,
}
