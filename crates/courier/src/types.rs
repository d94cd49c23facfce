use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Role assumed when a service is configured without an explicit role.
pub const DEFAULT_ROLE: &str = "Analysis";

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Identity of a managed service: an (experiment, role) pair.
///
/// The serialized name is `experiment_role`, shortened to just `experiment`
/// when the role is [`DEFAULT_ROLE`]. Two services are equal iff both
/// components are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceName {
    experiment: String,
    role: String,
}

impl ServiceName {
    pub fn new(experiment: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            role: role.into(),
        }
    }

    /// A service under the default role.
    pub fn default_role(experiment: impl Into<String>) -> Self {
        Self::new(experiment, DEFAULT_ROLE)
    }

    /// Parse a serialized name. `dune_production` splits on the first `_`;
    /// a bare `dune` gets the default role.
    pub fn parse(name: &str) -> Self {
        match name.split_once('_') {
            Some((experiment, role)) => Self::new(experiment, role),
            None => Self::default_role(name),
        }
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.role == DEFAULT_ROLE {
            write!(f, "{}", self.experiment)
        } else {
            write!(f, "{}_{}", self.experiment, self.role)
        }
    }
}

/// The five worker variants of the pipeline.
///
/// Worker-specific configuration is a table keyed by this kind, so options
/// for one variant never leak into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerKind {
    Kerberos,
    GetToken,
    StoreAndGetToken,
    Ping,
    PushTokens,
}

impl WorkerKind {
    /// Configuration-file key for this worker (`[workerType.<name>]`).
    pub fn config_key(&self) -> &'static str {
        match self {
            WorkerKind::Kerberos => "kerberos",
            WorkerKind::GetToken => "getToken",
            WorkerKind::StoreAndGetToken => "storeAndGetToken",
            WorkerKind::Ping => "ping",
            WorkerKind::PushTokens => "pushTokens",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Pipeline stage, in the fixed order the driver runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Kerberos,
    VaultStorer,
    Ping,
    Push,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Kerberos => "kerberos",
            Stage::VaultStorer => "vaultstorer",
            Stage::Ping => "ping",
            Stage::Push => "push",
        };
        f.write_str(name)
    }
}

/// A message produced by a worker and consumed by the notification routers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A service-level failure not tied to a specific node.
    SetupError {
        message: String,
        service: ServiceName,
    },
    /// A per-node failure during distribution.
    PushError {
        message: String,
        service: ServiceName,
        node: String,
    },
}

impl Notification {
    pub fn setup(service: ServiceName, message: impl Into<String>) -> Self {
        Notification::SetupError {
            message: message.into(),
            service,
        }
    }

    pub fn push(service: ServiceName, node: impl Into<String>, message: impl Into<String>) -> Self {
        Notification::PushError {
            message: message.into(),
            service,
            node: node.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notification::SetupError { message, .. } => message,
            Notification::PushError { message, .. } => message,
        }
    }

    pub fn service(&self) -> &ServiceName {
        match self {
            Notification::SetupError { service, .. } => service,
            Notification::PushError { service, .. } => service,
        }
    }
}

/// Failure taxonomy for a single worker action.
///
/// Transient failures are absorbed by the retry wrapper until exhausted.
/// Terminal failures bypass retries entirely.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// Non-zero exit, network trouble, anything worth another attempt.
    #[error("{0}")]
    Transient(String),

    /// The external command asked for interactive authentication while
    /// running non-interactively. Operators must re-seed the credential.
    #[error("authentication needed: {0}")]
    AuthNeeded(String),

    /// The produced token failed the structural or claims check.
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    /// The per-attempt or per-stage deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The run context was cancelled. Never retried.
    #[error("cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Terminal errors bypass the retry wrapper.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerError::AuthNeeded(_) | WorkerError::TokenInvalid(_) | WorkerError::Cancelled
        )
    }
}
