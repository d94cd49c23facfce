//! Configuration file support (`courier.toml`).
//!
//! The file is hierarchical: global keys at the top level, per-experiment
//! sections under `[experiments.<name>]`, per-service sections under
//! `[experiments.<name>.roles.<role>]`. Any `<key>Override` found at a
//! service or experiment path shadows the global `<key>`; resolution walks
//! role, then experiment, then the global table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::context::TimeoutKey;
use crate::retry::RetrySettings;
use crate::types::{ServiceName, WorkerKind, deserialize_duration};

/// How a service obtains its vault token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VaultTokenWorker {
    /// Store a refresh credential on the credential server, minting a vault
    /// token as a side effect (default).
    #[default]
    StoreAndGetToken,
    /// Fetch a vault token directly, scanning output for auth prompts.
    GetToken,
    /// Fetch a vault token with the command attached to the terminal.
    GetTokenInteractive,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailSection {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub smtphost: String,
    #[serde(default = "default_smtp_port")]
    pub smtpport: u16,
    /// Recipients of the end-of-run admin digest.
    #[serde(default)]
    pub admins: Vec<String>,
}

fn default_smtp_port() -> u16 {
    25
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_timeout_global", deserialize_with = "deserialize_duration")]
    pub global: Duration,
    #[serde(default = "default_timeout_kerberos", deserialize_with = "deserialize_duration")]
    pub kerberos: Duration,
    #[serde(default = "default_timeout_vaultstorer", deserialize_with = "deserialize_duration")]
    pub vaultstorer: Duration,
    #[serde(default = "default_timeout_ping", deserialize_with = "deserialize_duration")]
    pub ping: Duration,
    #[serde(default = "default_timeout_push", deserialize_with = "deserialize_duration")]
    pub push: Duration,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            global: default_timeout_global(),
            kerberos: default_timeout_kerberos(),
            vaultstorer: default_timeout_vaultstorer(),
            ping: default_timeout_ping(),
            push: default_timeout_push(),
        }
    }
}

fn default_timeout_global() -> Duration {
    Duration::from_secs(2 * 3600)
}
fn default_timeout_kerberos() -> Duration {
    Duration::from_secs(120)
}
fn default_timeout_vaultstorer() -> Duration {
    Duration::from_secs(600)
}
fn default_timeout_ping() -> Duration {
    Duration::from_secs(60)
}
fn default_timeout_push() -> Duration {
    Duration::from_secs(300)
}

impl TimeoutsSection {
    pub fn for_key(&self, key: TimeoutKey) -> Duration {
        match key {
            TimeoutKey::Global => self.global,
            TimeoutKey::Kerberos => self.kerberos,
            TimeoutKey::VaultStorer => self.vaultstorer,
            TimeoutKey::Ping => self.ping,
            TimeoutKey::Push => self.push,
        }
    }

    fn for_worker(&self, kind: WorkerKind) -> Duration {
        match kind {
            WorkerKind::Kerberos => self.kerberos,
            WorkerKind::GetToken | WorkerKind::StoreAndGetToken => self.vaultstorer,
            WorkerKind::Ping => self.ping,
            WorkerKind::PushTokens => self.push,
        }
    }
}

/// External tool names, overridable for packaging differences and tests.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutablesSection {
    #[serde(default = "default_kinit")]
    pub kinit: String,
    #[serde(default = "default_klist")]
    pub klist: String,
    #[serde(default = "default_vault_storer")]
    pub vault_storer: String,
    #[serde(default = "default_token_fetcher")]
    pub token_fetcher: String,
    #[serde(default = "default_ping")]
    pub ping: String,
    #[serde(default = "default_file_copier")]
    pub file_copier: String,
    #[serde(default = "default_condor_status")]
    pub condor_status: String,
}

impl Default for ExecutablesSection {
    fn default() -> Self {
        Self {
            kinit: default_kinit(),
            klist: default_klist(),
            vault_storer: default_vault_storer(),
            token_fetcher: default_token_fetcher(),
            ping: default_ping(),
            file_copier: default_file_copier(),
            condor_status: default_condor_status(),
        }
    }
}

fn default_kinit() -> String {
    "kinit".to_string()
}
fn default_klist() -> String {
    "klist".to_string()
}
fn default_vault_storer() -> String {
    "condor_vault_storer".to_string()
}
fn default_token_fetcher() -> String {
    "htgettoken".to_string()
}
fn default_ping() -> String {
    "ping".to_string()
}
fn default_file_copier() -> String {
    "rsync".to_string()
}
fn default_condor_status() -> String {
    "condor_status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSection {
    pub account: String,
    #[serde(rename = "destinationNodes")]
    pub destination_nodes: Vec<String>,
    #[serde(rename = "desiredUIDOverride")]
    pub desired_uid_override: Option<u32>,
    /// Untyped `<key>Override` entries consulted by [`Config::override_for`].
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSection {
    #[serde(default)]
    pub emails: Vec<String>,
    pub roles: BTreeMap<String, RoleSection>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub email: EmailSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub executables: ExecutablesSection,
    #[serde(rename = "workerType", default)]
    pub worker_type: BTreeMap<String, RetrySettings>,
    #[serde(default)]
    pub experiments: BTreeMap<String, ExperimentSection>,

    #[serde(
        rename = "minTokenLifetime",
        default = "default_min_token_lifetime",
        deserialize_with = "deserialize_duration"
    )]
    pub min_token_lifetime: Duration,
    #[serde(rename = "disableNotifications", default)]
    pub disable_notifications: bool,
    #[serde(rename = "notificationMinimum", default = "default_notification_minimum")]
    pub notification_minimum: u32,
    #[serde(rename = "ORIG_HTGETTOKENOPTS", default)]
    pub orig_htgettokenopts: String,
    #[serde(rename = "serviceCreddVaultTokenPathRoot", default = "default_token_root")]
    pub token_root: PathBuf,
    #[serde(rename = "defaultRoleFileDestinationTemplate", default = "default_role_file_template")]
    pub role_file_template: String,
    #[serde(rename = "keytabPath", default = "default_keytab_path")]
    pub keytab_path: PathBuf,
    #[serde(rename = "dbLocation", default = "default_db_location")]
    pub db_location: PathBuf,
    #[serde(rename = "condorCollectorHost", default)]
    pub collector_host: String,
    #[serde(rename = "condorScheddConstraint")]
    pub schedd_constraint: Option<String>,
    #[serde(rename = "vaultServer", default)]
    pub vault_server: String,
    #[serde(rename = "kerberosRealm", default)]
    pub kerberos_realm: String,
    #[serde(rename = "issuerGroup", default)]
    pub issuer_group: String,
    #[serde(rename = "pingOptions", default)]
    pub ping_options: Option<String>,
    #[serde(rename = "fileCopierOptions", default)]
    pub file_copier_options: Option<String>,
    #[serde(rename = "vaultTokenWorker", default)]
    pub vault_token_worker: VaultTokenWorker,
}

fn default_min_token_lifetime() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}
fn default_notification_minimum() -> u32 {
    3
}
fn default_token_root() -> PathBuf {
    PathBuf::from("/var/lib/courier/tokens")
}
fn default_role_file_template() -> String {
    "/tmp/{{experiment}}_{{role}}_{{uid}}".to_string()
}
fn default_keytab_path() -> PathBuf {
    PathBuf::from("/opt/courier/keytabs")
}
fn default_db_location() -> PathBuf {
    PathBuf::from("/var/lib/courier/courier.db")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: every violation here is fatal (exit 2).
    fn validate(&self) -> Result<()> {
        if self.experiments.is_empty() {
            bail!("no experiments configured");
        }
        for (experiment, section) in &self.experiments {
            if section.roles.is_empty() {
                bail!("experiment {experiment} has no roles");
            }
            for (role, role_section) in &section.roles {
                if role_section.account.is_empty() {
                    bail!("experiment {experiment} role {role}: account must not be empty");
                }
                if role_section.destination_nodes.is_empty() {
                    bail!("experiment {experiment} role {role}: destinationNodes must not be empty");
                }
            }
            if !self.disable_notifications && section.emails.is_empty() {
                bail!("experiment {experiment} has no notification emails");
            }
        }

        if !self.disable_notifications && (self.email.from.is_empty() || self.email.smtphost.is_empty()) {
            bail!("email.from and email.smtphost are required unless disableNotifications is set");
        }

        for (name, settings) in &self.worker_type {
            let kind = worker_kind_for_config_key(name)
                .with_context(|| format!("unknown workerType {name}"))?;
            let stage_timeout = self.timeouts.for_worker(kind);
            settings
                .validate_within(stage_timeout)
                .map_err(|reason| anyhow::anyhow!("workerType.{name}: {reason}"))?;
        }

        Ok(())
    }

    /// Check that every external tool resolves on PATH (or is an absolute
    /// path that exists). Fatal at startup; skipped in dry runs.
    pub fn validate_executables(&self) -> Result<()> {
        let tools = [
            &self.executables.kinit,
            &self.executables.klist,
            &self.executables.vault_storer,
            &self.executables.token_fetcher,
            &self.executables.ping,
            &self.executables.file_copier,
            &self.executables.condor_status,
        ];
        for tool in tools {
            which::which(tool)
                .map_err(|e| anyhow::anyhow!("required executable {tool} not found: {e}"))?;
        }
        Ok(())
    }

    /// Every configured service, in stable order.
    pub fn services(&self) -> Vec<ServiceName> {
        self.experiments
            .iter()
            .flat_map(|(experiment, section)| {
                section
                    .roles
                    .keys()
                    .map(|role| ServiceName::new(experiment.clone(), role.clone()))
            })
            .collect()
    }

    pub fn role_section(&self, service: &ServiceName) -> Option<&RoleSection> {
        self.experiments
            .get(service.experiment())
            .and_then(|e| e.roles.get(service.role()))
    }

    /// `<key>Override` resolution: role path first, then experiment path.
    pub fn override_for(&self, service: &ServiceName, key: &str) -> Option<String> {
        let override_key = format!("{key}Override");
        let from_value = |v: &toml::Value| match v {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        };

        if let Some(role) = self.role_section(service) {
            if let Some(v) = role.extra.get(&override_key) {
                return from_value(v);
            }
        }
        if let Some(experiment) = self.experiments.get(service.experiment()) {
            if let Some(v) = experiment.extra.get(&override_key) {
                return from_value(v);
            }
        }
        None
    }

    pub fn collector_host_for(&self, service: &ServiceName) -> String {
        self.override_for(service, "condorCollectorHost")
            .unwrap_or_else(|| self.collector_host.clone())
    }

    pub fn vault_server_for(&self, service: &ServiceName) -> String {
        self.override_for(service, "vaultServer")
            .unwrap_or_else(|| self.vault_server.clone())
    }

    /// A fixed credd pins the service to one endpoint and skips the schedd
    /// query entirely.
    pub fn credd_host_for(&self, service: &ServiceName) -> Option<String> {
        self.override_for(service, "condorCreddHost")
    }

    pub fn keytab_for(&self, service: &ServiceName) -> PathBuf {
        let root = self
            .override_for(service, "keytabPath")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.keytab_path.clone());
        let account = self
            .role_section(service)
            .map(|r| r.account.as_str())
            .unwrap_or_default();
        root.join(format!("{account}.keytab"))
    }

    pub fn ping_options_for(&self, service: &ServiceName) -> Option<String> {
        self.override_for(service, "pingOptions")
            .or_else(|| self.ping_options.clone())
    }

    pub fn file_copier_options_for(&self, service: &ServiceName) -> Option<String> {
        self.override_for(service, "fileCopierOptions")
            .or_else(|| self.file_copier_options.clone())
    }

    pub fn role_file_template_for(&self, service: &ServiceName) -> String {
        self.override_for(service, "roleFileDestinationTemplate")
            .unwrap_or_else(|| self.role_file_template.clone())
    }

    pub fn token_fetch_options_for(&self, service: &ServiceName) -> String {
        self.override_for(service, "ORIG_HTGETTOKENOPTS")
            .unwrap_or_else(|| self.orig_htgettokenopts.clone())
    }

    pub fn vault_token_worker_for(&self, service: &ServiceName) -> VaultTokenWorker {
        match self
            .override_for(service, "vaultTokenWorker")
            .as_deref()
        {
            Some("getToken") => VaultTokenWorker::GetToken,
            Some("getTokenInteractive") => VaultTokenWorker::GetTokenInteractive,
            Some("storeAndGetToken") => VaultTokenWorker::StoreAndGetToken,
            Some(other) => {
                tracing::warn!(service = %service, value = other, "unknown vaultTokenWorker override; using global");
                self.vault_token_worker
            }
            None => self.vault_token_worker,
        }
    }

    pub fn emails_for(&self, service: &ServiceName) -> Vec<String> {
        self.experiments
            .get(service.experiment())
            .map(|e| e.emails.clone())
            .unwrap_or_default()
    }

    pub fn retry_settings_for(&self, kind: WorkerKind) -> RetrySettings {
        self.worker_type
            .get(kind.config_key())
            .copied()
            .unwrap_or_default()
    }
}

fn worker_kind_for_config_key(key: &str) -> Option<WorkerKind> {
    [
        WorkerKind::Kerberos,
        WorkerKind::GetToken,
        WorkerKind::StoreAndGetToken,
        WorkerKind::Ping,
        WorkerKind::PushTokens,
    ]
    .into_iter()
    .find(|k| k.config_key() == key)
}
