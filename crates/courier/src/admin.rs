//! Admin aggregation.
//!
//! One task owns the error counters for the whole run. Every admin-bound
//! notification increments the matching counter; a counter reaching the
//! notification threshold marks its service for the digest and resets to
//! zero. When the stream closes the counters are persisted in one
//! transaction (skipped if the run was cancelled) and a single digest goes
//! out covering every service whose threshold fired.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{ServiceErrorCounts, Store};
use crate::email::{AdminReport, MessageSender, render_admin_digest};
use crate::notify::SourceNotification;
use crate::types::{Notification, ServiceName};

/// What the aggregator did at end of run.
#[derive(Debug)]
pub struct AdminRunReport {
    /// The digest body, when at least one threshold fired.
    pub digest: Option<String>,
    /// Whether counters reached the store.
    pub persisted: bool,
}

#[derive(Debug, Default)]
struct ReportEntry {
    setup_errors: Vec<String>,
    push_errors: BTreeMap<String, String>,
    should_send: bool,
}

pub struct AdminAggregator {
    inbox: mpsc::Receiver<SourceNotification>,
    store: Store,
    threshold: u32,
    counts: BTreeMap<ServiceName, ServiceErrorCounts>,
    cancel: CancellationToken,
    sender: Arc<dyn MessageSender>,
}

impl AdminAggregator {
    /// `counts` is the driver's preloaded snapshot from the store; the
    /// aggregator owns it exclusively from here on.
    pub fn new(
        inbox: mpsc::Receiver<SourceNotification>,
        store: Store,
        threshold: u32,
        counts: BTreeMap<ServiceName, ServiceErrorCounts>,
        cancel: CancellationToken,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            inbox,
            store,
            threshold,
            counts,
            cancel,
            sender,
        }
    }

    pub fn spawn(self) -> JoinHandle<AdminRunReport> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> AdminRunReport {
        let mut reports: BTreeMap<ServiceName, ReportEntry> = BTreeMap::new();

        while let Some(SourceNotification {
            source,
            notification,
        }) = self.inbox.recv().await
        {
            let counts = self.counts.entry(source.clone()).or_default();
            let entry = reports.entry(source.clone()).or_default();

            match notification {
                Notification::SetupError { message, .. } => {
                    counts.setup_errors += 1;
                    if counts.setup_errors >= self.threshold {
                        entry.should_send = true;
                        counts.setup_errors = 0;
                    }
                    entry.setup_errors.push(message);
                }
                Notification::PushError { message, node, .. } => {
                    let count = counts.push_errors.entry(node.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.threshold {
                        entry.should_send = true;
                        *count = 0;
                    }
                    entry.push_errors.insert(node, message);
                }
            }
        }

        let persisted = if self.cancel.is_cancelled() {
            tracing::warn!("run cancelled; error counters are not persisted");
            false
        } else {
            match self.store.persist_counts(&self.counts).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist error counters; run continues degraded");
                    false
                }
            }
        };

        let to_send: Vec<AdminReport> = reports
            .into_iter()
            .filter(|(_, entry)| entry.should_send)
            .map(|(service, entry)| AdminReport {
                service: service.to_string(),
                setup_errors: entry.setup_errors,
                push_errors: entry.push_errors,
            })
            .collect();

        let digest = if to_send.is_empty() {
            None
        } else {
            match render_admin_digest(&to_send) {
                Ok(body) => {
                    if let Err(err) = self
                        .sender
                        .send_message("courier admin digest", &body)
                        .await
                    {
                        tracing::error!(error = %err, "failed to deliver admin digest");
                    }
                    Some(body)
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to render admin digest");
                    None
                }
            }
        };

        AdminRunReport { digest, persisted }
    }
}
