//! Typed command environment.
//!
//! Every external command runs under an environment assembled here rather
//! than from ambient process state. The bag is shared immutably across a
//! stage; a worker that needs a divergent environment clones it and mutates
//! the copy.

use std::collections::BTreeMap;

/// Workload-manager credd selection.
pub const CREDD_HOST_VAR: &str = "_condor_CREDD_HOST";
/// Workload-manager collector selection.
pub const COLLECTOR_HOST_VAR: &str = "_condor_COLLECTOR_HOST";
/// Kerberos credential cache location.
pub const KRB5CCNAME_VAR: &str = "KRB5CCNAME";
/// Extra options handed to the token-fetch command.
pub const TOKEN_FETCH_OPTS_VAR: &str = "HTGETTOKENOPTS";
/// Explicit bearer-token file location, consumed by the discovery rule.
pub const BEARER_TOKEN_FILE_VAR: &str = "BEARER_TOKEN_FILE";

/// A bag of environment-variable assignments with named setters for the
/// variables the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEnvironment {
    vars: BTreeMap<String, String>,
}

impl CommandEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the workload manager at a specific credd.
    pub fn set_credd_host(&mut self, host: impl Into<String>) {
        self.vars.insert(CREDD_HOST_VAR.to_string(), host.into());
    }

    pub fn credd_host(&self) -> Option<&str> {
        self.vars.get(CREDD_HOST_VAR).map(String::as_str)
    }

    /// Point the workload manager at a specific collector.
    pub fn set_collector_host(&mut self, host: impl Into<String>) {
        self.vars.insert(COLLECTOR_HOST_VAR.to_string(), host.into());
    }

    pub fn collector_host(&self) -> Option<&str> {
        self.vars.get(COLLECTOR_HOST_VAR).map(String::as_str)
    }

    /// Kerberos cache path. Stored with the `FILE:` prefix the tools expect.
    pub fn set_krb5_cache_path(&mut self, path: impl AsRef<str>) {
        let path = path.as_ref();
        let value = if path.starts_with("FILE:") {
            path.to_string()
        } else {
            format!("FILE:{path}")
        };
        self.vars.insert(KRB5CCNAME_VAR.to_string(), value);
    }

    pub fn krb5_cache_path(&self) -> Option<&str> {
        self.vars.get(KRB5CCNAME_VAR).map(String::as_str)
    }

    pub fn set_token_fetch_options(&mut self, opts: impl Into<String>) {
        self.vars.insert(TOKEN_FETCH_OPTS_VAR.to_string(), opts.into());
    }

    pub fn token_fetch_options(&self) -> Option<&str> {
        self.vars.get(TOKEN_FETCH_OPTS_VAR).map(String::as_str)
    }

    /// Arbitrary assignment for variables without a named setter.
    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// All assignments, for handing to a command builder.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
