//! Config Entry State Machine
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress (reload)
//!                            ↘ SetupRetry → SetupInProgress (scheduled retry)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use crate::entry::ConfigEntryState;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Validate a transition, returning the target state on success
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let reason = match (self, to) {
            (NotLoaded, SetupInProgress)
            | (SetupInProgress, Loaded | SetupError | SetupRetry)
            | (SetupError | SetupRetry, SetupInProgress | UnloadInProgress)
            | (Loaded, UnloadInProgress)
            | (UnloadInProgress, NotLoaded | FailedUnload) => return Ok(to),

            (FailedUnload, _) => "FailedUnload is terminal",
            (Loaded, SetupInProgress) => "already loaded, unload first",
            (NotLoaded, _) => "setup has not started",
            (SetupInProgress, _) => "setup still in progress",
            (UnloadInProgress, _) => "unload still in progress",
            _ => "transition not allowed",
        };

        Err(InvalidTransition {
            from: self,
            to,
            reason,
        })
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

/// Delay before setup retry number `tries` (1-based)
///
/// `2^min(tries, 4) * 5` seconds plus up to 100 ms of jitter:
/// 10s, 20s, 40s, 80s, 80s, ...
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base = Duration::from_secs(2_u64.pow(tries.min(4)) * 5);
    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
    base + jitter
}
