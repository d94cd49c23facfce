//! Distribution stage action.
//!
//! The minted vault token is transported to every surviving node
//! concurrently with the configured file copier. Any node failure fails the
//! service; the per-service retry wrapper re-runs the whole fan-out.

use tokio::task::JoinSet;

use crate::context::{RunContext, TimeoutKey};
use crate::process::{self, CommandError};
use crate::service::ServiceConfig;
use crate::types::{Notification, WorkerError};
use crate::vault::EXTRA_VAULT_TOKEN_FILE;
use crate::worker::{NotifySink, StageTools};

/// Extras key: flags prepended to every copier invocation.
pub const EXTRA_FILE_COPIER_OPTIONS: &str = "fileCopierOptions";
/// Extras key: destination path template with `experiment`, `role`, `uid`
/// variables.
pub const EXTRA_DESTINATION_TEMPLATE: &str = "roleFileDestinationTemplate";

const DEFAULT_FILE_COPIER_OPTIONS: &str = "--perms --chmod=u=r,go=";

/// Render the per-node destination path from the role-file template.
fn render_destination(template: &str, config: &ServiceConfig) -> Result<String, WorkerError> {
    let mut context = tera::Context::new();
    context.insert("experiment", config.name().experiment());
    context.insert("role", config.name().role());
    context.insert("uid", &config.uid());
    tera::Tera::one_off(template, &context, false)
        .map_err(|e| WorkerError::Transient(format!("destination template: {e}")))
}

/// Copy the vault token to every node in the (pruned) node list.
pub(crate) async fn push_tokens(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
    sink: &NotifySink,
) -> Result<(), WorkerError> {
    let service = config.name().clone();
    let token_file = config
        .extra(EXTRA_VAULT_TOKEN_FILE)
        .ok_or_else(|| WorkerError::Transient(format!("{service}: no vault token file configured")))?
        .to_string();
    let template = config
        .extra(EXTRA_DESTINATION_TEMPLATE)
        .ok_or_else(|| WorkerError::Transient(format!("{service}: no destination template configured")))?;
    let destination = render_destination(template, config)?;
    let options = config
        .extra(EXTRA_FILE_COPIER_OPTIONS)
        .unwrap_or(DEFAULT_FILE_COPIER_OPTIONS)
        .to_string();
    let account = config.account().to_string();
    let per_node_timeout = ctx.timeout(TimeoutKey::Push);

    let mut copies: JoinSet<(String, Result<(), WorkerError>)> = JoinSet::new();
    for node in config.nodes() {
        let ctx = ctx.child();
        let program = tools.config.executables.file_copier.clone();
        let options = options.clone();
        let env = config.environment().clone();
        let token_file = token_file.clone();
        let destination = destination.clone();
        let account = account.clone();
        copies.spawn(async move {
            let mut args: Vec<String> = options.split_whitespace().map(str::to_string).collect();
            args.push(token_file);
            args.push(format!("{account}@{node}:{destination}"));

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

    let mut failed = 0usize;
    let mut cancelled = false;
    while let Some(joined) = copies.join_next().await {
        let Ok((node, verdict)) = joined else {
            failed += 1;
            continue;
        };
        match verdict {
            Ok(()) => {
                tracing::debug!(service = %service, node, "vault token pushed");
            }
            Err(WorkerError::Cancelled) => cancelled = true,
            Err(err) => {
                failed += 1;
                sink.send(Notification::push(
                    service.clone(),
                    node.clone(),
                    format!("pushing token to {node} failed: {err}"),
                ))
                .await;
            }
        }
    }

    if cancelled {
        return Err(WorkerError::Cancelled);
    }
    if failed > 0 {
        return Err(WorkerError::Transient(format!(
            "token push failed for {failed} node(s)"
        )));
    }
    Ok(())
}
