//! Memoized schedd discovery.
//!
//! The first caller per collector host runs the external query under a
//! one-shot gate; every later caller, concurrent ones included, blocks on
//! the gate and reads the shared entry. A failed first query is cached for
//! the process lifetime and handed to later callers unchanged.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::environment::CommandEnvironment;
use crate::process::{self, CommandError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("schedd query against {collector} failed: {message}")]
pub struct ScheddError {
    pub collector: String,
    pub message: String,
}

type Entry = Arc<OnceCell<Result<BTreeSet<String>, ScheddError>>>;

/// Per-collector cache of schedd names, process lifetime.
pub struct ScheddCache {
    query_program: String,
    query_timeout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ScheddCache {
    pub fn new(query_program: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            query_program: query_program.into(),
            query_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Schedd names registered at `collector`, optionally constrained.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        collector: &str,
        constraint: Option<&str>,
    ) -> Result<BTreeSet<String>, ScheddError> {
        let entry = {
            let mut entries = self.entries.lock().expect("schedd cache lock poisoned");
            entries.entry(collector.to_string()).or_default().clone()
        };

        entry
            .get_or_init(|| self.run_query(cancel, collector, constraint))
            .await
            .clone()
    }

    async fn run_query(
        &self,
        cancel: &CancellationToken,
        collector: &str,
        constraint: Option<&str>,
    ) -> Result<BTreeSet<String>, ScheddError> {
        let mut args = vec![
            "-pool".to_string(),
            collector.to_string(),
            "-schedd".to_string(),
            "-af".to_string(),
            "name".to_string(),
        ];
        if let Some(constraint) = constraint {
            args.push("-constraint".to_string());
            args.push(constraint.to_string());
        }

        let fail = |message: String| ScheddError {
            collector: collector.to_string(),
            message,
        };

        let output = process::run_command(
            cancel,
            &self.query_program,
            &args,
            &CommandEnvironment::new(),
            Some(self.query_timeout),
        )
        .await
        .map_err(|e| match e {
            CommandError::Cancelled { .. } => fail("cancelled".to_string()),
            other => fail(other.to_string()),
        })?;

        if !output.success() {
            return Err(fail(output.describe()));
        }

        let schedds: BTreeSet<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if schedds.is_empty() {
            return Err(fail("query returned no schedds".to_string()));
        }

        tracing::debug!(collector, count = schedds.len(), "schedd query populated cache");
        Ok(schedds)
    }
}
