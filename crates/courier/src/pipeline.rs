//! The pipeline driver.
//!
//! Builds one [`ServiceConfig`] per configured service, runs the fixed stage
//! order (Kerberos, then the vault-token stage in its per-service flavor,
//! then Ping, then Push), and between stages drains each worker's verdicts,
//! deleting failed services so later stages see only survivors. Notifications
//! flow to the routers in parallel; a single admin digest and the exit status
//! fall out at the end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;

use crate::admin::{AdminAggregator, AdminRunReport};
use crate::channels::WorkerChannels;
use crate::config::{Config, VaultTokenWorker};
use crate::context::{RunContext, TimeoutKey};
use crate::db::Store;
use crate::email::{DisabledSender, EmailSender, FanoutSender, MessageSender, WebhookSender};
use crate::environment::CommandEnvironment;
use crate::notify::{NotificationRouter, spawn_service_email_manager};
use crate::schedd::ScheddCache;
use crate::service::{
    ServiceConfig, with_account, with_credd_endpoints, with_environment, with_extra, with_nodes,
    with_retry_settings, with_uid, with_vault_server, with_worker_option,
};
use crate::token;
use crate::types::{Notification, ServiceName, Stage, WorkerKind};
use crate::worker::{OPTION_INTERACTIVE, StageTools, run_worker};
use crate::{kerberos, ping, push, vault};

/// Where in the run a service fell out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Config assembly failed before any stage ran.
    Assembly,
    Stage(Stage),
}

impl std::fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePoint::Assembly => f.write_str("assembly"),
            FailurePoint::Stage(stage) => write!(f, "{stage}"),
        }
    }
}

/// End-of-run accounting, drives the process exit code.
#[derive(Debug)]
pub struct RunReport {
    /// Services that survived every stage.
    pub pushed: Vec<ServiceName>,
    pub failed: BTreeMap<ServiceName, FailurePoint>,
    pub cancelled: bool,
    pub admin: Option<AdminRunReport>,
}

impl RunReport {
    pub fn all_pushed(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Build per-service configs from the loaded configuration, resolving uids
/// through the store. Returns the buildable configs and the per-service
/// assembly failures.
pub async fn assemble_service_configs(
    config: &Config,
    store: &Store,
) -> (
    BTreeMap<ServiceName, Arc<ServiceConfig>>,
    Vec<(ServiceName, String)>,
) {
    let mut assembled = BTreeMap::new();
    let mut failures = Vec::new();

    for service in config.services() {
        match assemble_one(config, store, &service).await {
            Ok(service_config) => {
                assembled.insert(service, service_config);
            }
            Err(reason) => {
                tracing::error!(service = %service, reason, "service config assembly failed");
                failures.push((service, reason));
            }
        }
    }

    match store.confirm_uids().await {
        Ok(rows) => tracing::debug!(mappings = rows.len(), "uid cache confirmed"),
        Err(err) => tracing::warn!(error = %err, "uid cache confirmation failed"),
    }

    (assembled, failures)
}

async fn assemble_one(
    config: &Config,
    store: &Store,
    service: &ServiceName,
) -> std::result::Result<Arc<ServiceConfig>, String> {
    let role = config
        .role_section(service)
        .ok_or_else(|| "service has no role section".to_string())?;

    let uid = match role.desired_uid_override {
        Some(uid) => {
            // Keep the cache warm so later runs can drop the override.
            if let Err(err) = store
                .insert_uids(&[(role.account.clone(), uid)])
                .await
            {
                tracing::warn!(service = %service, error = %err, "failed to cache uid override");
            }
            uid
        }
        None => store
            .uid_by_username(&role.account)
            .await
            .map_err(|err| format!("no uid mapping for account {}: {err}", role.account))?,
    };

    let vault_token_file = token::vault_token_file(&config.token_root, uid, service);
    let vault_token_file = vault_token_file.to_string_lossy().into_owned();

    let mut environment = CommandEnvironment::new();
    let collector = config.collector_host_for(service);
    if !collector.is_empty() {
        environment.set_collector_host(collector);
    }
    environment.set_krb5_cache_path(format!("/tmp/krb5cc_courier_{uid}"));
    let mut fetch_options = config.token_fetch_options_for(service);
    if !fetch_options.is_empty() {
        fetch_options.push(' ');
    }
    fetch_options.push_str(&format!("--vaulttokenfile={vault_token_file}"));
    environment.set_token_fetch_options(fetch_options);

    let principal = config
        .override_for(service, "kerberosPrincipal")
        .unwrap_or_else(|| {
            if config.kerberos_realm.is_empty() {
                role.account.clone()
            } else {
                format!("{}@{}", role.account, config.kerberos_realm)
            }
        });

    let mut options = vec![
        with_account(role.account.clone()),
        with_uid(uid),
        with_nodes(role.destination_nodes.clone()),
        with_environment(environment),
        with_extra(kerberos::EXTRA_KEYTAB, config.keytab_for(service).to_string_lossy()),
        with_extra(kerberos::EXTRA_PRINCIPAL, principal),
        with_extra(vault::EXTRA_VAULT_TOKEN_FILE, vault_token_file),
        with_extra(
            push::EXTRA_DESTINATION_TEMPLATE,
            config.role_file_template_for(service),
        ),
    ];

    let vault_server = config.vault_server_for(service);
    if !vault_server.is_empty() {
        options.push(with_vault_server(vault_server));
    }
    if let Some(credd) = config.credd_host_for(service) {
        options.push(with_credd_endpoints(vec![credd]));
    }
    if let Some(ping_options) = config.ping_options_for(service) {
        options.push(with_extra(ping::EXTRA_PING_OPTIONS, ping_options));
    }
    if let Some(copier_options) = config.file_copier_options_for(service) {
        options.push(with_extra(push::EXTRA_FILE_COPIER_OPTIONS, copier_options));
    }
    if config.vault_token_worker_for(service) == VaultTokenWorker::GetTokenInteractive {
        options.push(with_worker_option(
            WorkerKind::GetToken,
            OPTION_INTERACTIVE,
            "true",
        ));
    }
    for kind in [
        WorkerKind::Kerberos,
        WorkerKind::GetToken,
        WorkerKind::StoreAndGetToken,
        WorkerKind::Ping,
        WorkerKind::PushTokens,
    ] {
        options.push(with_retry_settings(kind, config.retry_settings_for(kind)));
    }

    ServiceConfig::build(service.clone(), options).map_err(|e| e.to_string())
}

fn service_sender(config: &Config, service: &ServiceName) -> Result<Arc<dyn MessageSender>> {
    if config.disable_notifications {
        return Ok(Arc::new(DisabledSender));
    }
    let recipients = config.emails_for(service);
    Ok(Arc::new(EmailSender::new(&config.email, recipients)?))
}

fn admin_sender(config: &Config) -> Result<Arc<dyn MessageSender>> {
    if config.disable_notifications {
        return Ok(Arc::new(DisabledSender));
    }
    let mut senders: Vec<Arc<dyn MessageSender>> = Vec::new();
    if !config.email.admins.is_empty() {
        senders.push(Arc::new(EmailSender::new(
            &config.email,
            config.email.admins.clone(),
        )?));
    }
    if let Some(webhook) = WebhookSender::new(&config.webhook)? {
        senders.push(Arc::new(webhook));
    }
    if senders.is_empty() {
        tracing::warn!("no admin digest transport configured; digests will be dropped");
        return Ok(Arc::new(DisabledSender));
    }
    Ok(Arc::new(FanoutSender::new(senders)))
}

/// Stage-scoped survivor filtering: drain success-out to completion and
/// delete every failed service from the survivor map.
async fn remove_failed_service_configs(
    mut success_out: mpsc::Receiver<crate::channels::StageOutcome>,
    stage: Stage,
    survivors: &mut BTreeMap<ServiceName, Arc<ServiceConfig>>,
    failed: &mut BTreeMap<ServiceName, FailurePoint>,
) {
    while let Some(outcome) = success_out.recv().await {
        if !outcome.ok {
            survivors.remove(&outcome.service);
            failed.insert(outcome.service, FailurePoint::Stage(stage));
        }
    }
}

async fn run_stage(
    kind: WorkerKind,
    ctx: &RunContext,
    tools: &Arc<StageTools>,
    router: &NotificationRouter,
    survivors: &mut BTreeMap<ServiceName, Arc<ServiceConfig>>,
    members: &[ServiceName],
    failed: &mut BTreeMap<ServiceName, FailurePoint>,
) {
    let stage = kind.stage();
    if members.is_empty() {
        tracing::info!(stage = %stage, worker = %kind, "no services for stage; skipping");
        return;
    }
    tracing::info!(stage = %stage, worker = %kind, services = members.len(), "stage starting");

    let WorkerChannels {
        configs_in,
        success_out,
        mut notifications_out,
        worker: ends,
    } = WorkerChannels::new(members.len());

    let worker = tokio::spawn(run_worker(kind, ctx.child(), tools.clone(), ends));

    let source = router.register_source();
    let forwarder = tokio::spawn(async move {
        while let Some(notification) = notifications_out.recv().await {
            if !source.send(notification).await {
                break;
            }
        }
    });

    for name in members {
        if let Some(service_config) = survivors.get(name) {
            if configs_in.send(service_config.clone()).await.is_err() {
                tracing::error!(stage = %stage, "worker went away before all configs were sent");
                break;
            }
        }
    }
    drop(configs_in);

    remove_failed_service_configs(success_out, stage, survivors, failed).await;

    if let Err(err) = worker.await {
        tracing::error!(stage = %stage, error = %err, "worker task failed");
    }
    if let Err(err) = forwarder.await {
        tracing::error!(stage = %stage, error = %err, "notification forwarder failed");
    }
}

/// Run the whole batch refresh.
pub async fn run(config: Arc<Config>, store: Store, ctx: RunContext) -> Result<RunReport> {
    let ctx = ctx
        .with_override_timeout(TimeoutKey::Global, config.timeouts.global)
        .with_override_timeout(TimeoutKey::Kerberos, config.timeouts.kerberos)
        .with_override_timeout(TimeoutKey::VaultStorer, config.timeouts.vaultstorer)
        .with_override_timeout(TimeoutKey::Ping, config.timeouts.ping)
        .with_override_timeout(TimeoutKey::Push, config.timeouts.push);

    let tools = Arc::new(StageTools {
        config: config.clone(),
        schedd: Arc::new(ScheddCache::new(
            config.executables.condor_status.clone(),
            config.timeouts.vaultstorer,
        )),
    });

    // Whole-run budget: cancel everything when it elapses.
    let watchdog = {
        let ctx = ctx.clone();
        let budget = config.timeouts.global;
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            tracing::error!(budget = ?budget, "global timeout elapsed; cancelling the run");
            ctx.cancel();
        })
    };

    // Notification plumbing comes up before the first stage.
    let services = config.services();
    let mut manager_handles = Vec::with_capacity(services.len());
    let mut manager_inboxes = BTreeMap::new();
    for service in &services {
        let sender = service_sender(&config, service)?;
        let (tx, rx) = mpsc::channel::<Notification>(8);
        manager_handles.push(spawn_service_email_manager(service.clone(), rx, sender));
        manager_inboxes.insert(service.clone(), tx);
    }

    let (admin_tx, admin_rx) = mpsc::channel(64);
    let mut router = NotificationRouter::spawn(manager_inboxes, admin_tx);

    let preloaded = store
        .all_error_counts()
        .await
        .context("preloading error counters")?;
    let aggregator = AdminAggregator::new(
        admin_rx,
        store.clone(),
        config.notification_minimum,
        preloaded,
        ctx.cancellation().clone(),
        admin_sender(&config)?,
    )
    .spawn();

    let (mut survivors, assembly_failures) = assemble_service_configs(&config, &store).await;

    let mut failed: BTreeMap<ServiceName, FailurePoint> = BTreeMap::new();
    if !assembly_failures.is_empty() {
        let source = router.register_source();
        for (service, reason) in assembly_failures {
            source
                .send(Notification::setup(service.clone(), reason))
                .await;
            failed.insert(service, FailurePoint::Assembly);
        }
    }

    // Stage order is fixed and cannot be reordered.
    let members: Vec<ServiceName> = survivors.keys().cloned().collect();
    run_stage(
        WorkerKind::Kerberos,
        &ctx,
        &tools,
        &router,
        &mut survivors,
        &members,
        &mut failed,
    )
    .await;

    if !ctx.is_cancelled() {
        // The vault-token stage runs in per-service flavors.
        let mut store_members = Vec::new();
        let mut get_members = Vec::new();
        for service in survivors.keys() {
            match config.vault_token_worker_for(service) {
                VaultTokenWorker::StoreAndGetToken => store_members.push(service.clone()),
                VaultTokenWorker::GetToken | VaultTokenWorker::GetTokenInteractive => {
                    get_members.push(service.clone())
                }
            }
        }
        run_stage(
            WorkerKind::StoreAndGetToken,
            &ctx,
            &tools,
            &router,
            &mut survivors,
            &store_members,
            &mut failed,
        )
        .await;
        run_stage(
            WorkerKind::GetToken,
            &ctx,
            &tools,
            &router,
            &mut survivors,
            &get_members,
            &mut failed,
        )
        .await;
    }

    if !ctx.is_cancelled() {
        let members: Vec<ServiceName> = survivors.keys().cloned().collect();
        run_stage(
            WorkerKind::Ping,
            &ctx,
            &tools,
            &router,
            &mut survivors,
            &members,
            &mut failed,
        )
        .await;
    }

    if !ctx.is_cancelled() {
        let members: Vec<ServiceName> = survivors.keys().cloned().collect();
        run_stage(
            WorkerKind::PushTokens,
            &ctx,
            &tools,
            &router,
            &mut survivors,
            &members,
            &mut failed,
        )
        .await;
    }

    // Wind the notification subsystem down: router first, then managers,
    // then the aggregator's verdict.
    router.join().await;
    for handle in manager_handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "service email manager failed");
        }
    }
    let admin = match aggregator.await {
        Ok(report) => Some(report),
        Err(err) => {
            tracing::error!(error = %err, "admin aggregator failed");
            None
        }
    };

    watchdog.abort();

    let cancelled = ctx.is_cancelled();
    let report = RunReport {
        pushed: survivors.keys().cloned().collect(),
        failed,
        cancelled,
        admin,
    };

    for service in &report.pushed {
        tracing::info!(service = %service, "service fully refreshed");
    }
    for (service, point) in &report.failed {
        tracing::warn!(service = %service, failed_at = %point, "service failed this run");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    struct Fixture {
        _td: tempfile::TempDir,
        config: Arc<Config>,
        store: Store,
    }

    /// A single-service config whose external tools are all stub scripts.
    async fn fixture(
        td: tempfile::TempDir,
        kinit: &str,
        storer: &str,
        ping: &str,
        copier: &str,
        nodes: &str,
        extra_globals: &str,
    ) -> Fixture {
        let ok = write_script(td.path(), "ok", "exit 0");
        let db = td.path().join("courier.db");
        let raw = format!(
            "disableNotifications = true\n\
             dbLocation = \"{db}\"\n\
             serviceCreddVaultTokenPathRoot = \"{root}\"\n\
             pingOptions = \"-c 1\"\n\
             {extra_globals}\n\
             [executables]\n\
             kinit = \"{kinit}\"\nklist = \"{ok}\"\n\
             vault_storer = \"{storer}\"\ntoken_fetcher = \"{ok}\"\n\
             ping = \"{ping}\"\nfile_copier = \"{copier}\"\ncondor_status = \"{ok}\"\n\
             [experiments.dune]\nemails = []\n\
             condorCreddHostOverride = \"credd1.example.org\"\n\
             [experiments.dune.roles.production]\n\
             account = \"dunepro\"\ndesiredUIDOverride = 42001\n\
             destinationNodes = [{nodes}]\n",
            db = db.display(),
            root = td.path().display(),
        );
        let config = Arc::new(Config::parse(&raw).expect("config"));
        let store = Store::open(&db).await.expect("store");
        Fixture {
            _td: td,
            config,
            store,
        }
    }

    fn service() -> ServiceName {
        ServiceName::new("dune", "production")
    }

    #[tokio::test]
    async fn happy_path_pushes_the_service_with_no_failures() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let f = fixture(td, &ok, &ok, &ok, &ok, "\"n1\"", "").await;

        let report = run(f.config.clone(), f.store.clone(), RunContext::new())
            .await
            .expect("run");

        assert_eq!(report.pushed, vec![service()]);
        assert!(report.failed.is_empty());
        assert!(!report.cancelled);
        assert!(report.all_pushed());
        let admin = report.admin.expect("admin report");
        assert!(admin.digest.is_none());
        assert!(admin.persisted);
    }

    #[tokio::test]
    async fn kerberos_failure_stops_the_service_before_later_stages() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let fail = write_script(td.path(), "fail", "exit 1");
        let touched = td.path().join("storer_ran");
        let storer = write_script(
            td.path(),
            "storer",
            &format!("touch {}\nexit 0", touched.display()),
        );
        let f = fixture(td, &fail, &storer, &ok, &ok, "\"n1\"", "notificationMinimum = 1").await;

        let report = run(f.config.clone(), f.store.clone(), RunContext::new())
            .await
            .expect("run");

        assert!(report.pushed.is_empty());
        assert_eq!(
            report.failed.get(&service()),
            Some(&FailurePoint::Stage(Stage::Kerberos))
        );
        assert!(!report.all_pushed());
        // The vault storer never ran for a service that failed Kerberos.
        assert!(!touched.exists());
        // Threshold 1: the single setup error reaches the digest.
        let admin = report.admin.expect("admin report");
        let digest = admin.digest.expect("digest");
        assert!(digest.contains("dune_production"));
    }

    #[tokio::test]
    async fn unreachable_node_is_pruned_but_the_service_still_pushes() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let selective_ping = write_script(
            td.path(),
            "selective_ping",
            "for a in \"$@\"; do [ \"$a\" = \"n2\" ] && exit 1; done\nexit 0",
        );
        let push_log = td.path().join("pushed");
        let logging_copier = write_script(
            td.path(),
            "copier",
            &format!("echo \"$@\" >> {}\nexit 0", push_log.display()),
        );
        let f = fixture(
            td,
            &ok,
            &ok,
            &selective_ping,
            &logging_copier,
            "\"n1\", \"n2\", \"n3\"",
            "",
        )
        .await;

        let report = run(f.config.clone(), f.store.clone(), RunContext::new())
            .await
            .expect("run");

        assert_eq!(report.pushed, vec![service()]);
        assert!(report.failed.is_empty());

        let pushes = std::fs::read_to_string(&push_log).expect("push log");
        assert_eq!(pushes.lines().count(), 2);
        assert!(pushes.contains("@n1:"));
        assert!(pushes.contains("@n3:"));
        assert!(!pushes.contains("@n2:"));
    }

    #[tokio::test]
    async fn every_node_unreachable_fails_the_service_at_ping() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let fail = write_script(td.path(), "fail", "exit 1");
        let push_log = td.path().join("pushed");
        let logging_copier = write_script(
            td.path(),
            "copier",
            &format!("echo ran >> {}\nexit 0", push_log.display()),
        );
        let f = fixture(td, &ok, &ok, &fail, &logging_copier, "\"n1\", \"n2\"", "").await;

        let report = run(f.config.clone(), f.store.clone(), RunContext::new())
            .await
            .expect("run");

        assert!(report.pushed.is_empty());
        assert_eq!(
            report.failed.get(&service()),
            Some(&FailurePoint::Stage(Stage::Ping))
        );
        // No push sub-task ran for a service with no surviving nodes.
        assert!(!push_log.exists());
    }

    #[tokio::test]
    async fn missing_uid_mapping_is_an_assembly_failure() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let db = td.path().join("courier.db");
        let raw = format!(
            "disableNotifications = true\ndbLocation = \"{db}\"\n\
             [executables]\nkinit = \"{ok}\"\nklist = \"{ok}\"\nvault_storer = \"{ok}\"\n\
             token_fetcher = \"{ok}\"\nping = \"{ok}\"\nfile_copier = \"{ok}\"\ncondor_status = \"{ok}\"\n\
             [experiments.dune]\nemails = []\n\
             [experiments.dune.roles.production]\n\
             account = \"dunepro\"\ndestinationNodes = [\"n1\"]\n",
            db = db.display(),
        );
        let config = Arc::new(Config::parse(&raw).expect("config"));
        let store = Store::open(&db).await.expect("store");

        let report = run(config, store, RunContext::new()).await.expect("run");

        assert!(report.pushed.is_empty());
        assert_eq!(
            report.failed.get(&service()),
            Some(&FailurePoint::Assembly)
        );
    }

    #[tokio::test]
    async fn uid_resolves_from_the_store_when_no_override_is_set() {
        let td = tempfile::tempdir().expect("tempdir");
        let ok = write_script(td.path(), "ok2", "exit 0");
        let db = td.path().join("courier.db");
        let raw = format!(
            "disableNotifications = true\ndbLocation = \"{db}\"\n\
             serviceCreddVaultTokenPathRoot = \"{root}\"\n\
             [executables]\nkinit = \"{ok}\"\nklist = \"{ok}\"\nvault_storer = \"{ok}\"\n\
             token_fetcher = \"{ok}\"\nping = \"{ok}\"\nfile_copier = \"{ok}\"\ncondor_status = \"{ok}\"\n\
             [experiments.dune]\nemails = []\ncondorCreddHostOverride = \"credd1\"\n\
             [experiments.dune.roles.production]\n\
             account = \"dunepro\"\ndestinationNodes = [\"n1\"]\n",
            db = db.display(),
            root = td.path().display(),
        );
        let config = Arc::new(Config::parse(&raw).expect("config"));
        let store = Store::open(&db).await.expect("store");
        store
            .insert_uids(&[("dunepro".to_string(), 4242)])
            .await
            .expect("seed uid");

        let (assembled, failures) = assemble_service_configs(&config, &store).await;
        assert!(failures.is_empty());
        let service_config = assembled.get(&service()).expect("assembled");
        assert_eq!(service_config.uid(), 4242);
    }
}
