//! Per-service configuration bundle.
//!
//! One [`ServiceConfig`] is built per configured service and handed to every
//! stage. Construction goes through an ordered list of option functions with
//! rollback: each option mutates the builder and returns a restorer, and the
//! first failing option unwinds every earlier mutation so a failed build
//! cannot leave partial state behind.
//!
//! After construction the bundle is read-only except for
//! [`ServiceConfig::register_unpingable_node`], which the ping stage uses to
//! prune unreachable destinations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::environment::CommandEnvironment;
use crate::retry::RetrySettings;
use crate::types::{ServiceName, WorkerKind};

/// A failed option function, naming the field it was setting.
#[derive(Debug, Error)]
#[error("service {service}: invalid {field}: {reason}")]
pub struct ServiceConfigError {
    pub service: ServiceName,
    pub field: &'static str,
    pub reason: String,
}

/// Mutable construction state. Options mutate this; `finish` freezes it.
#[derive(Debug, Default)]
pub struct ServiceBuilder {
    account: String,
    uid: u32,
    nodes: Vec<String>,
    vault_server: String,
    credd_endpoints: Vec<String>,
    environment: CommandEnvironment,
    extras: BTreeMap<String, String>,
    worker_options: BTreeMap<WorkerKind, BTreeMap<String, String>>,
    retries: BTreeMap<WorkerKind, RetrySettings>,
}

/// Undoes one option's mutation on the builder.
type Restorer = Box<dyn FnOnce(&mut ServiceBuilder) + Send>;

/// One step of construction: mutate the builder, hand back the restorer.
pub struct ServiceOption(
    #[allow(clippy::type_complexity)]
    Box<dyn FnOnce(&ServiceName, &mut ServiceBuilder) -> Result<Restorer, ServiceConfigError> + Send>,
);

impl ServiceOption {
    fn new<F>(f: F) -> Self
    where
        F: FnOnce(&ServiceName, &mut ServiceBuilder) -> Result<Restorer, ServiceConfigError>
            + Send
            + 'static,
    {
        Self(Box::new(f))
    }
}

fn fail(service: &ServiceName, field: &'static str, reason: impl Into<String>) -> ServiceConfigError {
    ServiceConfigError {
        service: service.clone(),
        field,
        reason: reason.into(),
    }
}

/// Local account the service's credentials belong to. Required, non-empty.
pub fn with_account(account: impl Into<String>) -> ServiceOption {
    let account = account.into();
    ServiceOption::new(move |service, b| {
        if account.is_empty() {
            return Err(fail(service, "account", "must not be empty"));
        }
        let prev = std::mem::replace(&mut b.account, account);
        Ok(Box::new(move |b| b.account = prev))
    })
}

/// Numeric uid tokens are minted for. Required, non-zero.
pub fn with_uid(uid: u32) -> ServiceOption {
    ServiceOption::new(move |service, b| {
        if uid == 0 {
            return Err(fail(service, "uid", "must not be zero"));
        }
        let prev = std::mem::replace(&mut b.uid, uid);
        Ok(Box::new(move |b| b.uid = prev))
    })
}

/// Destination node list. Order is kept; duplicates are dropped.
pub fn with_nodes<I, S>(nodes: I) -> ServiceOption
where
    I: IntoIterator<Item = S> + Send + 'static,
    S: Into<String>,
{
    ServiceOption::new(move |service, b| {
        let mut seen = std::collections::BTreeSet::new();
        let deduped: Vec<String> = nodes
            .into_iter()
            .map(Into::into)
            .filter(|n| seen.insert(n.clone()))
            .collect();
        if deduped.is_empty() {
            return Err(fail(service, "nodes", "must name at least one node"));
        }
        let prev = std::mem::replace(&mut b.nodes, deduped);
        Ok(Box::new(move |b| b.nodes = prev))
    })
}

pub fn with_vault_server(server: impl Into<String>) -> ServiceOption {
    let server = server.into();
    ServiceOption::new(move |service, b| {
        if server.is_empty() {
            return Err(fail(service, "vault server", "must not be empty"));
        }
        let prev = std::mem::replace(&mut b.vault_server, server);
        Ok(Box::new(move |b| b.vault_server = prev))
    })
}

/// Credential-server endpoints, tried in the given order.
pub fn with_credd_endpoints<I, S>(endpoints: I) -> ServiceOption
where
    I: IntoIterator<Item = S> + Send + 'static,
    S: Into<String>,
{
    ServiceOption::new(move |_service, b| {
        let endpoints: Vec<String> = endpoints.into_iter().map(Into::into).collect();
        let prev = std::mem::replace(&mut b.credd_endpoints, endpoints);
        Ok(Box::new(move |b| b.credd_endpoints = prev))
    })
}

pub fn with_environment(environment: CommandEnvironment) -> ServiceOption {
    ServiceOption::new(move |_service, b| {
        let prev = std::mem::replace(&mut b.environment, environment);
        Ok(Box::new(move |b| b.environment = prev))
    })
}

/// Opaque per-stage option (ping flags, ssh flags, destination template...).
pub fn with_extra(key: impl Into<String>, value: impl Into<String>) -> ServiceOption {
    let key = key.into();
    let value = value.into();
    ServiceOption::new(move |_service, b| {
        let prev = b.extras.insert(key.clone(), value);
        Ok(Box::new(move |b| {
            match prev {
                Some(v) => b.extras.insert(key, v),
                None => b.extras.remove(&key),
            };
        }))
    })
}

/// Option scoped to one worker variant.
pub fn with_worker_option(
    kind: WorkerKind,
    key: impl Into<String>,
    value: impl Into<String>,
) -> ServiceOption {
    let key = key.into();
    let value = value.into();
    ServiceOption::new(move |_service, b| {
        let table = b.worker_options.entry(kind).or_default();
        let prev = table.insert(key.clone(), value);
        Ok(Box::new(move |b| {
            let table = b.worker_options.entry(kind).or_default();
            match prev {
                Some(v) => table.insert(key, v),
                None => table.remove(&key),
            };
        }))
    })
}

pub fn with_retry_settings(kind: WorkerKind, settings: RetrySettings) -> ServiceOption {
    ServiceOption::new(move |_service, b| {
        let prev = b.retries.insert(kind, settings);
        Ok(Box::new(move |b| {
            match prev {
                Some(s) => b.retries.insert(kind, s),
                None => b.retries.remove(&kind),
            };
        }))
    })
}

/// Immutable per-service input to every stage.
#[derive(Debug)]
pub struct ServiceConfig {
    name: ServiceName,
    account: String,
    uid: u32,
    // The one legal post-construction mutation: ping prunes dead nodes.
    nodes: Mutex<Vec<String>>,
    vault_server: String,
    credd_endpoints: Vec<String>,
    environment: CommandEnvironment,
    extras: BTreeMap<String, String>,
    worker_options: BTreeMap<WorkerKind, BTreeMap<String, String>>,
    retries: BTreeMap<WorkerKind, RetrySettings>,
}

impl ServiceConfig {
    /// Apply `options` in order; on the first failure run the restorers of
    /// every applied option in reverse and report the failure.
    pub fn build(
        name: ServiceName,
        options: Vec<ServiceOption>,
    ) -> Result<Arc<Self>, ServiceConfigError> {
        let mut builder = ServiceBuilder::default();
        let mut restorers: Vec<Restorer> = Vec::with_capacity(options.len());

        for option in options {
            match (option.0)(&name, &mut builder) {
                Ok(restorer) => restorers.push(restorer),
                Err(err) => {
                    for restorer in restorers.into_iter().rev() {
                        restorer(&mut builder);
                    }
                    return Err(err);
                }
            }
        }

        if builder.account.is_empty() {
            return Err(fail(&name, "account", "is required"));
        }
        if builder.uid == 0 {
            return Err(fail(&name, "uid", "is required"));
        }
        if builder.nodes.is_empty() {
            return Err(fail(&name, "nodes", "are required"));
        }

        Ok(Arc::new(Self {
            name,
            account: builder.account,
            uid: builder.uid,
            nodes: Mutex::new(builder.nodes),
            vault_server: builder.vault_server,
            credd_endpoints: builder.credd_endpoints,
            environment: builder.environment,
            extras: builder.extras,
            worker_options: builder.worker_options,
            retries: builder.retries,
        }))
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Current node list. A snapshot; the ping stage may prune concurrently
    /// with nothing else, stages themselves run sequentially.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.lock().expect("node list lock poisoned").clone()
    }

    pub fn vault_server(&self) -> &str {
        &self.vault_server
    }

    pub fn credd_endpoints(&self) -> &[String] {
        &self.credd_endpoints
    }

    pub fn environment(&self) -> &CommandEnvironment {
        &self.environment
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn worker_option(&self, kind: WorkerKind, key: &str) -> Option<&str> {
        self.worker_options
            .get(&kind)
            .and_then(|t| t.get(key))
            .map(String::as_str)
    }

    pub fn retry_settings(&self, kind: WorkerKind) -> RetrySettings {
        self.retries.get(&kind).copied().unwrap_or_default()
    }

    /// Remove a node that failed its reachability probe. Returns whether the
    /// node was present.
    pub fn register_unpingable_node(&self, node: &str) -> bool {
        let mut nodes = self.nodes.lock().expect("node list lock poisoned");
        let before = nodes.len();
        nodes.retain(|n| n != node);
        nodes.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> ServiceName {
        ServiceName::new("dune", "production")
    }

    fn base_options() -> Vec<ServiceOption> {
        vec![
            with_account("dunepro"),
            with_uid(42001),
            with_nodes(vec!["gpvm01", "gpvm02"]),
            with_vault_server("vault.example.org"),
        ]
    }

    #[test]
    fn build_applies_options_in_order() {
        let config = ServiceConfig::build(name(), base_options()).expect("build");
        assert_eq!(config.account(), "dunepro");
        assert_eq!(config.uid(), 42001);
        assert_eq!(config.nodes(), vec!["gpvm01", "gpvm02"]);
        assert_eq!(config.vault_server(), "vault.example.org");
    }

    #[test]
    fn nodes_are_deduplicated_preserving_order() {
        let mut options = base_options();
        options[2] = with_nodes(vec!["gpvm02", "gpvm01", "gpvm02", "gpvm01"]);
        let config = ServiceConfig::build(name(), options).expect("build");
        assert_eq!(config.nodes(), vec!["gpvm02", "gpvm01"]);
    }

    #[test]
    fn failing_option_reports_the_field() {
        let mut options = base_options();
        options.push(with_uid(0));
        let err = ServiceConfig::build(name(), options).unwrap_err();
        assert_eq!(err.field, "uid");
        assert_eq!(err.service, name());
    }

    #[test]
    fn failing_option_rolls_back_earlier_mutations() {
        // A later failing option must restore the builder; observe the
        // rollback by rebuilding successfully without the bad option.
        let options = vec![
            with_account("dunepro"),
            with_extra("pingOptions", "-c 1"),
            with_uid(0),
        ];
        let err = ServiceConfig::build(name(), options).unwrap_err();
        assert_eq!(err.field, "uid");

        // The builder is discarded either way; what rollback guarantees is
        // that restorers ran without panicking in reverse order, including
        // map-entry restorers.
        let options = vec![
            with_account("dunepro"),
            with_uid(42001),
            with_nodes(vec!["gpvm01"]),
            with_extra("pingOptions", "-c 1"),
            with_extra("pingOptions", "-c 2"),
        ];
        let config = ServiceConfig::build(name(), options).expect("build");
        assert_eq!(config.extra("pingOptions"), Some("-c 2"));
    }

    #[test]
    fn missing_required_fields_fail_the_build() {
        let err = ServiceConfig::build(name(), vec![with_account("dunepro")]).unwrap_err();
        assert_eq!(err.field, "uid");

        let err =
            ServiceConfig::build(name(), vec![with_account("dunepro"), with_uid(1)]).unwrap_err();
        assert_eq!(err.field, "nodes");
    }

    #[test]
    fn worker_options_are_scoped_by_kind() {
        let mut options = base_options();
        options.push(with_worker_option(WorkerKind::GetToken, "interactive", "true"));
        let config = ServiceConfig::build(name(), options).expect("build");

        assert_eq!(
            config.worker_option(WorkerKind::GetToken, "interactive"),
            Some("true")
        );
        assert_eq!(config.worker_option(WorkerKind::Ping, "interactive"), None);
    }

    #[test]
    fn retry_settings_default_to_single_attempt() {
        let config = ServiceConfig::build(name(), base_options()).expect("build");
        let settings = config.retry_settings(WorkerKind::PushTokens);
        assert_eq!(settings.num_retries, 0);
    }

    #[test]
    fn register_unpingable_node_removes_only_that_node() {
        let config = ServiceConfig::build(name(), base_options()).expect("build");
        assert!(config.register_unpingable_node("gpvm01"));
        assert_eq!(config.nodes(), vec!["gpvm02"]);
        assert!(!config.register_unpingable_node("gpvm01"));
    }
}
