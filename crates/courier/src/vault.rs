//! Vault-token stage actions.
//!
//! Two routes to a vault token: `store_and_get_token` drives the
//! credential-server storage client against each credd endpoint in order,
//! and `get_token` invokes the token-fetch command directly. Both honor the
//! non-interactive contract: an output line announcing an OIDC prompt is a
//! terminal authentication-needed failure, surfaced distinctly to operators.

use std::collections::BTreeSet;

use crate::context::RunContext;
use crate::process::{self, CommandError, CommandOutput};
use crate::service::ServiceConfig;
use crate::token;
use crate::types::WorkerError;
use crate::worker::StageTools;

/// Marker the token-fetch tooling prints right before blocking on a browser
/// round-trip. Seeing it in a non-interactive run means the stored refresh
/// credential has expired.
pub const AUTH_NEEDED_MARKER: &str = "Attempting OIDC authentication";

/// Extras key: where the minted vault token lands.
pub const EXTRA_VAULT_TOKEN_FILE: &str = "vaultTokenFile";

fn command_failed(err: CommandError) -> WorkerError {
    match err {
        CommandError::Cancelled { .. } => WorkerError::Cancelled,
        other => WorkerError::Transient(other.to_string()),
    }
}

fn scan_for_auth_prompt(output: &CommandOutput) -> Result<(), WorkerError> {
    if output.combined().contains(AUTH_NEEDED_MARKER) {
        return Err(WorkerError::AuthNeeded(
            "token fetch requires interactive OIDC authentication".to_string(),
        ));
    }
    Ok(())
}

/// Skip the stage when the current tokens are still comfortably valid.
async fn tokens_still_fresh(tools: &StageTools, config: &ServiceConfig) -> bool {
    let Some(vault_token_file) = config.extra(EXTRA_VAULT_TOKEN_FILE) else {
        return false;
    };
    let Ok(vault_token) = tokio::fs::read_to_string(vault_token_file).await else {
        return false;
    };
    if token::validate_vault_token(&vault_token).is_err() {
        return false;
    }

    let bearer_file = token::bearer_token_file(config.uid());
    let Ok(bearer) = tokio::fs::read_to_string(&bearer_file).await else {
        return false;
    };
    match token::bearer_remaining_lifetime(&bearer) {
        Ok(remaining) => remaining >= tools.config.min_token_lifetime,
        Err(_) => false,
    }
}

/// Fetch a vault token directly from the vault server.
///
/// Non-interactive runs scan combined output for [`AUTH_NEEDED_MARKER`];
/// interactive runs attach the command to the terminal. Success requires the
/// token file to exist and pass the structural check.
pub(crate) async fn get_token(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
    interactive: bool,
) -> Result<(), WorkerError> {
    let service = config.name();

    if tokens_still_fresh(tools, config).await {
        tracing::info!(service = %service, "existing tokens satisfy minTokenLifetime; skipping fetch");
        return Ok(());
    }

    let token_file = config
        .extra(EXTRA_VAULT_TOKEN_FILE)
        .ok_or_else(|| WorkerError::Transient(format!("{service}: no vault token file configured")))?;

    let mut args = vec![
        "-a".to_string(),
        config.vault_server().to_string(),
        "-i".to_string(),
        service.experiment().to_string(),
    ];
    if service.role() != crate::types::DEFAULT_ROLE {
        args.push("-r".to_string());
        args.push(service.role().to_string());
    }
    args.push(format!("--vaulttokenfile={token_file}"));

    let program = &tools.config.executables.token_fetcher;
    let output = if interactive {
        process::run_command_interactive(ctx.cancellation(), program, &args, config.environment(), None)
            .await
            .map_err(command_failed)?
    } else {
        let output = process::run_command(ctx.cancellation(), program, &args, config.environment(), None)
            .await
            .map_err(command_failed)?;
        scan_for_auth_prompt(&output)?;
        output
    };

    if !output.success() {
        return Err(WorkerError::Transient(format!(
            "token fetch for {service}: {}",
            output.describe()
        )));
    }

    let contents = tokio::fs::read_to_string(token_file)
        .await
        .map_err(|e| WorkerError::TokenInvalid(format!("vault token file unreadable: {e}")))?;
    token::validate_vault_token(&contents)
        .map_err(|e| WorkerError::TokenInvalid(e.to_string()))?;

    // The fetch usually derives a bearer token too; when it did and an
    // issuer group is configured, hold it to the claims contract.
    let issuer_group = &tools.config.issuer_group;
    if !issuer_group.is_empty() {
        let bearer_file = token::bearer_token_file(config.uid());
        if let Ok(bearer) = tokio::fs::read_to_string(&bearer_file).await {
            let role = (service.role() != crate::types::DEFAULT_ROLE).then(|| service.role());
            token::validate_bearer_token(&bearer, issuer_group, role)
                .map_err(|e| WorkerError::TokenInvalid(e.to_string()))?;
        }
    }

    tracing::debug!(service = %service, token_file, "vault token fetched");
    Ok(())
}

/// Resolve the credd endpoints to try, in authoritative order.
///
/// A config assembled with explicit endpoints (fixed credd override) wins;
/// otherwise the collector is asked once per process via the schedd cache.
async fn credd_endpoints(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
) -> Result<Vec<String>, WorkerError> {
    if !config.credd_endpoints().is_empty() {
        return Ok(config.credd_endpoints().to_vec());
    }

    let collector = config
        .environment()
        .collector_host()
        .ok_or_else(|| WorkerError::Transient("no collector host configured".to_string()))?;
    let constraint = tools.config.schedd_constraint.as_deref();
    let schedds: BTreeSet<String> = tools
        .schedd
        .get(ctx.cancellation(), collector, constraint)
        .await
        .map_err(|e| WorkerError::Transient(e.to_string()))?;
    Ok(schedds.into_iter().collect())
}

/// Store a refresh credential on the credential server, minting a vault
/// token as a side effect. Endpoints are tried in order; the first success
/// wins; an authentication prompt is terminal.
pub(crate) async fn store_and_get_token(
    ctx: &RunContext,
    tools: &StageTools,
    config: &ServiceConfig,
) -> Result<(), WorkerError> {
    let service = config.name();

    if tokens_still_fresh(tools, config).await {
        tracing::info!(service = %service, "existing tokens satisfy minTokenLifetime; skipping store");
        return Ok(());
    }

    let endpoints = credd_endpoints(ctx, tools, config).await?;
    if endpoints.is_empty() {
        return Err(WorkerError::Transient(format!(
            "{service}: no credd endpoints available"
        )));
    }

    let args = vec![service.to_string()];
    let mut last_failure = WorkerError::Transient("no endpoints tried".to_string());

    for endpoint in &endpoints {
        if ctx.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let mut env = config.environment().clone();
        env.set_credd_host(endpoint.clone());

        let output = process::run_command(
            ctx.cancellation(),
            &tools.config.executables.vault_storer,
            &args,
            &env,
            None,
        )
        .await
        .map_err(command_failed)?;

        scan_for_auth_prompt(&output)?;

        if output.success() {
            tracing::debug!(service = %service, endpoint, "refresh credential stored");
            return Ok(());
        }

        tracing::warn!(
            service = %service,
            endpoint,
            detail = %output.describe(),
            "credential store attempt failed; trying next endpoint"
        );
        last_failure = WorkerError::Transient(format!(
            "credential store against {endpoint}: {}",
            output.describe()
        ));
    }

    Err(last_failure)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::schedd::ScheddCache;
    use crate::service::{with_account, with_extra, with_nodes, with_uid, with_vault_server};
    use crate::types::ServiceName;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    fn tools_with_fetcher(fetcher: &str) -> Arc<StageTools> {
        let raw = format!(
            "disableNotifications = true\n\
             [executables]\ntoken_fetcher = \"{fetcher}\"\n\
             [experiments.dune.roles.production]\naccount = \"dunepro\"\ndestinationNodes = [\"n1\"]\n"
        );
        let config = Arc::new(Config::parse(&raw).expect("config"));
        let schedd = Arc::new(ScheddCache::new(
            config.executables.condor_status.clone(),
            Duration::from_secs(5),
        ));
        Arc::new(StageTools { config, schedd })
    }

    fn service_config(token_file: &std::path::Path) -> Arc<crate::service::ServiceConfig> {
        crate::service::ServiceConfig::build(
            ServiceName::new("dune", "production"),
            vec![
                with_account("dunepro"),
                with_uid(42001),
                with_nodes(vec!["n1"]),
                with_vault_server("vault.example.org"),
                with_extra(EXTRA_VAULT_TOKEN_FILE, token_file.to_string_lossy()),
            ],
        )
        .expect("build")
    }

    #[tokio::test]
    async fn get_token_succeeds_when_the_fetcher_writes_a_valid_token() {
        let td = tempfile::tempdir().expect("tempdir");
        let token_file = td.path().join("vt_u42001_dune_production");
        let fetcher = write_script(
            td.path(),
            "fetcher",
            "for a in \"$@\"; do case \"$a\" in --vaulttokenfile=*) echo hvs.stub > \"${a#--vaulttokenfile=}\";; esac; done\nexit 0",
        );

        let tools = tools_with_fetcher(&fetcher);
        let config = service_config(&token_file);
        let ctx = crate::context::RunContext::new();

        get_token(&ctx, &tools, &config, false).await.expect("get token");
        assert!(token_file.exists());
    }

    #[tokio::test]
    async fn get_token_flags_auth_prompts_as_terminal() {
        let td = tempfile::tempdir().expect("tempdir");
        let token_file = td.path().join("vt");
        let fetcher = write_script(
            td.path(),
            "fetcher",
            "echo 'Attempting OIDC authentication'\nexit 1",
        );

        let tools = tools_with_fetcher(&fetcher);
        let config = service_config(&token_file);
        let ctx = crate::context::RunContext::new();

        let err = get_token(&ctx, &tools, &config, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::AuthNeeded(_)));
    }

    #[tokio::test]
    async fn get_token_rejects_a_structurally_invalid_token() {
        let td = tempfile::tempdir().expect("tempdir");
        let token_file = td.path().join("vt");
        let fetcher = write_script(
            td.path(),
            "fetcher",
            "for a in \"$@\"; do case \"$a\" in --vaulttokenfile=*) echo not-a-token > \"${a#--vaulttokenfile=}\";; esac; done\nexit 0",
        );

        let tools = tools_with_fetcher(&fetcher);
        let config = service_config(&token_file);
        let ctx = crate::context::RunContext::new();

        let err = get_token(&ctx, &tools, &config, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::TokenInvalid(_)));
    }

    #[tokio::test]
    async fn store_tries_endpoints_in_order_until_one_succeeds() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = td.path().join("credds");
        let storer = write_script(
            td.path(),
            "storer",
            &format!(
                "echo \"$_condor_CREDD_HOST\" >> {log}\n[ \"$_condor_CREDD_HOST\" = \"credd2\" ] && exit 0\nexit 1",
                log = log.display()
            ),
        );

        let raw = format!(
            "disableNotifications = true\n\
             [executables]\nvault_storer = \"{storer}\"\n\
             [experiments.dune.roles.production]\naccount = \"dunepro\"\ndestinationNodes = [\"n1\"]\n"
        );
        let config = Arc::new(Config::parse(&raw).expect("config"));
        let schedd = Arc::new(ScheddCache::new(
            config.executables.condor_status.clone(),
            Duration::from_secs(5),
        ));
        let tools = Arc::new(StageTools { config, schedd });

        let service_config = crate::service::ServiceConfig::build(
            ServiceName::new("dune", "production"),
            vec![
                with_account("dunepro"),
                with_uid(42001),
                with_nodes(vec!["n1"]),
                crate::service::with_credd_endpoints(vec!["credd1", "credd2", "credd3"]),
            ],
        )
        .expect("build");
        let ctx = crate::context::RunContext::new();

        store_and_get_token(&ctx, &tools, &service_config)
            .await
            .expect("store");

        let tried = std::fs::read_to_string(&log).expect("log");
        let tried: Vec<&str> = tried.lines().collect();
        assert_eq!(tried, vec!["credd1", "credd2"]);
    }

    fn output(exit_code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn auth_marker_in_output_is_terminal() {
        let out = output(1, "Attempting OIDC authentication\nvisit https://...");
        let err = scan_for_auth_prompt(&out).unwrap_err();
        assert!(err.is_terminal());
        assert!(matches!(err, WorkerError::AuthNeeded(_)));
    }

    #[test]
    fn clean_output_passes_the_scan() {
        let out = output(0, "Storing condor credentials for dune\n");
        assert!(scan_for_auth_prompt(&out).is_ok());
    }
}
