use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier::config::Config;
use courier::context::RunContext;
use courier::db::Store;
use courier::pipeline::{self, RunReport};
use courier::types::ServiceName;

/// All services refreshed and pushed.
const EXIT_OK: i32 = 0;
/// At least one service failed a stage.
const EXIT_PARTIAL: i32 = 1;
/// Fatal configuration or startup error.
const EXIT_FATAL: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "courier", version)]
#[command(about = "Refresh and distribute vault tokens for batch compute services")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "/etc/courier/courier.toml")]
    config: PathBuf,

    /// Restrict the run to specific services (repeatable), e.g.
    /// `dune_production` or a bare experiment name for the default role.
    #[arg(long = "service")]
    services: Vec<String>,

    /// Restrict the run to every role of specific experiments (repeatable).
    #[arg(long = "experiment")]
    experiments: Vec<String>,

    /// Resolve configuration and print the plan without touching anything.
    #[arg(long)]
    dry_run: bool,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// Override the global run timeout (e.g. "90m").
    #[arg(long)]
    timeout: Option<String>,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Drop every experiment/role the selection flags exclude.
fn restrict_services(config: &mut Config, services: &[String], experiments: &[String]) {
    if services.is_empty() && experiments.is_empty() {
        return;
    }
    let selected: Vec<ServiceName> = services.iter().map(|s| ServiceName::parse(s)).collect();

    config.experiments.retain(|experiment, section| {
        if experiments.contains(experiment) {
            return true;
        }
        section.roles.retain(|role, _| {
            selected
                .iter()
                .any(|s| s.experiment() == experiment && s.role() == role)
        });
        !section.roles.is_empty()
    });
}

async fn dry_run(config: Arc<Config>, store: Store) -> i32 {
    let (assembled, failures) = pipeline::assemble_service_configs(&config, &store).await;

    println!("{} service(s) configured:", assembled.len() + failures.len());
    for (service, service_config) in &assembled {
        println!(
            "  {service}: account={} uid={} nodes=[{}] vault_worker={:?}",
            service_config.account(),
            service_config.uid(),
            service_config.nodes().join(", "),
            config.vault_token_worker_for(service),
        );
    }
    for (service, reason) in &failures {
        println!("  {service}: UNRESOLVABLE ({reason})");
    }

    if failures.is_empty() { EXIT_OK } else { EXIT_PARTIAL }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load(&cli.config)?;
    restrict_services(&mut config, &cli.services, &cli.experiments);
    if config.experiments.is_empty() {
        anyhow::bail!("service selection matched nothing in the configuration");
    }

    if let Some(timeout) = &cli.timeout {
        config.timeouts.global = humantime::parse_duration(timeout)
            .with_context(|| format!("invalid --timeout value {timeout}"))?;
    }

    if let Err(err) = config.validate_executables() {
        if cli.dry_run {
            tracing::warn!(error = %err, "executable check failed (ignored for dry run)");
        } else {
            return Err(err);
        }
    }

    let store = Store::open(&config.db_location)
        .await
        .context("opening the courier database")?;
    let config = Arc::new(config);

    if cli.dry_run {
        return Ok(dry_run(config, store).await);
    }

    let ctx = RunContext::new();
    spawn_signal_handler(&ctx);

    let report = pipeline::run(config, store, ctx).await?;
    Ok(summarize(&report))
}

fn spawn_signal_handler(ctx: &RunContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::warn!("signal received; cancelling the run");
        ctx.cancel();
    });
}

fn summarize(report: &RunReport) -> i32 {
    tracing::info!(
        pushed = report.pushed.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "run finished"
    );
    if report.all_pushed() { EXIT_OK } else { EXIT_PARTIAL }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "fatal startup error");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}
