//! Run-scoped context shared by every stage and command invocation.
//!
//! One root context is created per run. Stages derive children carrying a
//! scoped timeout; tasks derive grandchildren for per-node deadlines. All
//! process-wide state (cancellation, timeout table) lives here rather than
//! in globals.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::types::Stage;

/// Named timeout slots, one per stage plus the whole-run budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutKey {
    Global,
    Kerberos,
    VaultStorer,
    Ping,
    Push,
}

impl TimeoutKey {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Kerberos => TimeoutKey::Kerberos,
            Stage::VaultStorer => TimeoutKey::VaultStorer,
            Stage::Ping => TimeoutKey::Ping,
            Stage::Push => TimeoutKey::Push,
        }
    }
}

/// Cancellation plus the resolved timeout table.
///
/// Cloning is cheap; children share the parent's cancellation lineage, so
/// cancelling the root reaches every task and in-flight command.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    timeouts: BTreeMap<TimeoutKey, Duration>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeouts: BTreeMap::new(),
        }
    }

    /// The cancellation token commands and channel operations select on.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Derive a child context: same timeout table, child cancellation token.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            timeouts: self.timeouts.clone(),
        }
    }

    /// Set a timeout for `key`, first-writer-wins: if an ancestor already
    /// fixed this key the override is ignored.
    pub fn with_override_timeout(mut self, key: TimeoutKey, timeout: Duration) -> Self {
        self.timeouts.entry(key).or_insert(timeout);
        self
    }

    pub fn timeout(&self, key: TimeoutKey) -> Option<Duration> {
        self.timeouts.get(&key).copied()
    }

    pub fn timeout_or(&self, key: TimeoutKey, default: Duration) -> Duration {
        self.timeout(key).unwrap_or(default)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
