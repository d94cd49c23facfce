//! Reachability stage action.
//!
//! Every destination node is probed concurrently. A dead node does not fail
//! the service; it is pruned from the config's node list and reported as a
//! per-node push error. The service fails only when no node survives.

use tokio::task::JoinSet;

use crate::context::{RunContext, TimeoutKey};
use crate::process::{self, CommandError};
use crate::service::ServiceConfig;
use crate::types::{Notification, WorkerError};
use crate::worker::{NotifySink, StageTools};

/// Extras key: flags prepended to every probe invocation.
pub const EXTRA_PING_OPTIONS: &str = "pingOptions";

const DEFAULT_PING_OPTIONS: &str = "-c 1 -W 5";

/// Probe every node; prune and report the unreachable ones.
pub(crate) async fn probe_nodes(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
    sink: &NotifySink,
) -> Result<(), WorkerError> {
    let service = config.name().clone();
    let nodes = config.nodes();
    let per_node_timeout = ctx.timeout(TimeoutKey::Ping);
    let options = config
        .extra(EXTRA_PING_OPTIONS)
        .unwrap_or(DEFAULT_PING_OPTIONS)
        .to_string();

    let mut probes: JoinSet<(String, Result<(), WorkerError>)> = JoinSet::new();
    for node in nodes {
        let ctx = ctx.child();
        let program = tools.config.executables.ping.clone();
        let options = options.clone();
        let env = config.environment().clone();
        probes.spawn(async move {
            let mut args: Vec<String> = options.split_whitespace().map(str::to_string).collect();
            args.push(node.clone());

            let result = process::run_command(ctx.cancellation(), &program, &args, &env, per_node_timeout)
                .await;
            let verdict = match result {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(WorkerError::Transient(output.describe())),
                Err(CommandError::Cancelled { .. }) => Err(WorkerError::Cancelled),
                Err(other) => Err(WorkerError::Transient(other.to_string())),
            };
            (node, verdict)
        });
    }

    let mut cancelled = false;
    while let Some(joined) = probes.join_next().await {
        let Ok((node, verdict)) = joined else {
            continue;
        };
        match verdict {
            Ok(()) => {}
            Err(WorkerError::Cancelled) => cancelled = true,
            Err(err) => {
                tracing::warn!(service = %service, node, error = %err, "node failed its reachability probe");
                config.register_unpingable_node(&node);
                sink.send(Notification::push(
                    service.clone(),
                    node.clone(),
                    format!("node {node} is unreachable: {err}"),
                ))
                .await;
            }
        }
    }

    if cancelled {
        return Err(WorkerError::Cancelled);
    }
    if config.nodes().is_empty() {
        return Err(WorkerError::Transient(
            "no destination node passed its reachability probe".to_string(),
        ));
    }
    Ok(())
}
