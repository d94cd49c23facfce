//! Worker scaffolding shared by every stage.
//!
//! A worker consumes configs from its channel triple until the driver closes
//! it, fans one task out per config, and reports exactly one `(service, ok)`
//! verdict per config plus zero or more notifications. Dispatch over the
//! five variants goes through [`WorkerKind`]; the per-variant actions live
//! in their own modules.
//!
//! Failure semantics: a task failure never aborts its siblings; a failed
//! service always gets `ok = false` and at least one notification. Close
//! order on every exit path is success-out first, notifications-out second.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channels::{StageOutcome, WorkerEnds};
use crate::config::Config;
use crate::context::{RunContext, TimeoutKey};
use crate::retry;
use crate::schedd::ScheddCache;
use crate::service::ServiceConfig;
use crate::types::{Notification, Stage, WorkerError, WorkerKind};
use crate::{kerberos, ping, push, vault};

/// Worker-option key: run the token fetch attached to the terminal.
pub const OPTION_INTERACTIVE: &str = "interactive";

/// Shared dependencies every stage action draws on.
pub struct StageTools {
    pub config: Arc<Config>,
    pub schedd: Arc<ScheddCache>,
}

/// Notification emitter handed to actions. Sends race the cancellation
/// token so a worker never blocks on notifications-out during shutdown, and
/// the sink counts deliveries so the scaffolding can guarantee at least one
/// notification per failed service.
pub struct NotifySink {
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    sent: AtomicUsize,
}

impl NotifySink {
    pub(crate) fn new(tx: mpsc::Sender<Notification>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            sent: AtomicUsize::new(0),
        }
    }

    /// Best-effort send: gives up when the run is cancelled or the router
    /// went away.
    pub(crate) async fn send(&self, notification: Notification) {
        tokio::select! {
            sent = self.tx.send(notification) => {
                if sent.is_ok() {
                    self.sent.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    pub(crate) fn delivered(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl WorkerKind {
    /// The stage this worker serves, for timeout lookup and reporting.
    pub fn stage(&self) -> Stage {
        match self {
            WorkerKind::Kerberos => Stage::Kerberos,
            WorkerKind::GetToken | WorkerKind::StoreAndGetToken => Stage::VaultStorer,
            WorkerKind::Ping => Stage::Ping,
            WorkerKind::PushTokens => Stage::Push,
        }
    }
}

/// Dispatch table: variant to action.
async fn run_action(
    kind: WorkerKind,
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
    sink: &NotifySink,
) -> Result<(), WorkerError> {
    match kind {
        WorkerKind::Kerberos => kerberos::get_and_verify_ticket(ctx, tools, config).await,
        WorkerKind::GetToken => {
            let interactive =
                config.worker_option(WorkerKind::GetToken, OPTION_INTERACTIVE) == Some("true");
            vault::get_token(ctx, tools, config, interactive).await
        }
        WorkerKind::StoreAndGetToken => vault::store_and_get_token(ctx, tools, config).await,
        WorkerKind::Ping => ping::probe_nodes(ctx, tools, config, sink).await,
        WorkerKind::PushTokens => push::push_tokens(ctx, tools, config, sink).await,
    }
}

const FALLBACK_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// One config through one stage: retry-wrapped action under the stage
/// timeout, one outcome, notifications on failure.
async fn process_one(
    kind: WorkerKind,
    ctx: RunContext,
    tools: Arc<StageTools>,
    config: Arc<ServiceConfig>,
    notifications: mpsc::Sender<Notification>,
) -> StageOutcome {
    let service = config.name().clone();
    let stage = kind.stage();
    let stage_timeout = ctx.timeout_or(TimeoutKey::for_stage(stage), FALLBACK_STAGE_TIMEOUT);
    let sink = NotifySink::new(notifications, ctx.cancellation().clone());
    let settings = config.retry_settings(kind);

    let attempt = retry::retry(ctx.cancellation(), settings, || {
        run_action(kind, &ctx, &tools, &config, &sink)
    });

    let result = match tokio::time::timeout(stage_timeout, attempt).await {
        Ok(result) => result,
        Err(_elapsed) => Err(WorkerError::Timeout(stage_timeout)),
    };

    match result {
        Ok(()) => {
            tracing::info!(service = %service, stage = %stage, "stage succeeded");
            StageOutcome { service, ok: true }
        }
        Err(err) => {
            match &err {
                WorkerError::Timeout(after) => {
                    tracing::warn!(service = %service, stage = %stage, timeout = ?after, "stage timed out")
                }
                WorkerError::Cancelled => {
                    tracing::debug!(service = %service, stage = %stage, "stage cancelled")
                }
                other => {
                    tracing::error!(service = %service, stage = %stage, error = %other, "stage failed")
                }
            }
            if sink.delivered() == 0 {
                sink.send(Notification::setup(service.clone(), err.to_string()))
                    .await;
            }
            StageOutcome { service, ok: false }
        }
    }
}

/// Run one worker invocation to completion.
///
/// Reads configs until the driver closes the channel, processes them
/// concurrently, streams verdicts, then closes success-out followed by
/// notifications-out.
pub async fn run_worker(kind: WorkerKind, ctx: RunContext, tools: Arc<StageTools>, ends: WorkerEnds) {
    let WorkerEnds {
        mut configs,
        success,
        notifications,
    } = ends;

    let mut tasks: JoinSet<StageOutcome> = JoinSet::new();
    while let Some(config) = configs.recv().await {
        tasks.spawn(process_one(
            kind,
            ctx.child(),
            tools.clone(),
            config,
            notifications.clone(),
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                tokio::select! {
                    _ = success.send(outcome) => {}
                    _ = ctx.cancellation().cancelled() => {}
                }
            }
            Err(join_err) => {
                tracing::error!(worker = %kind, error = %join_err, "worker task panicked");
            }
        }
    }

    // Close order contract: success-out first, then notifications-out.
    drop(success);
    drop(notifications);
}
