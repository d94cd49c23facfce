//! Kerberos stage action: obtain a ticket from the service keytab, then
//! confirm it is usable.

use crate::context::RunContext;
use crate::process::{self, CommandError};
use crate::service::ServiceConfig;
use crate::types::WorkerError;
use crate::worker::StageTools;

/// Extras key: absolute keytab path for the service account.
pub const EXTRA_KEYTAB: &str = "keytab";
/// Extras key: principal the keytab holds.
pub const EXTRA_PRINCIPAL: &str = "kerberosPrincipal";

fn command_failed(err: CommandError) -> WorkerError {
    match err {
        CommandError::Cancelled { .. } => WorkerError::Cancelled,
        other => WorkerError::Transient(other.to_string()),
    }
}

/// `kinit -k -t <keytab> <principal>` followed by `klist -s`.
pub(crate) async fn get_and_verify_ticket(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
) -> Result<(), WorkerError> {
    let service = config.name();
    let keytab = config
        .extra(EXTRA_KEYTAB)
        .ok_or_else(|| WorkerError::Transient(format!("{service}: no keytab configured")))?;
    let principal = config
        .extra(EXTRA_PRINCIPAL)
        .ok_or_else(|| WorkerError::Transient(format!("{service}: no principal configured")))?;

    let args = vec![
        "-k".to_string(),
        "-t".to_string(),
        keytab.to_string(),
        principal.to_string(),
    ];
    let output = process::run_command(
        ctx.cancellation(),
        &tools.config.executables.kinit,
        &args,
        config.environment(),
        None,
    )
    .await
    .map_err(command_failed)?;

    if !output.success() {
        return Err(WorkerError::Transient(format!(
            "kinit for {principal}: {}",
            output.describe()
        )));
    }

    let output = process::run_command(
        ctx.cancellation(),
        &tools.config.executables.klist,
        &["-s".to_string()],
        config.environment(),
        None,
    )
    .await
    .map_err(command_failed)?;

    if !output.success() {
        return Err(WorkerError::Transient(format!(
            "ticket verification for {principal}: {}",
            output.describe()
        )));
    }

    tracing::debug!(service = %service, principal, "kerberos ticket acquired");
    Ok(())
}
