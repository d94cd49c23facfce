//! Notification routing.
//!
//! Workers emit [`Notification`]s; the router fans each one into the
//! matching per-service email manager and, wrapped as a
//! [`SourceNotification`], into the admin aggregator's shared stream.
//!
//! Lifecycle: every worker invocation registers a source, which holds the
//! router's ingest stream open. When the last source is released and the
//! driver closes its own handle, the ingest stream closes exactly once, the
//! routing loop drains, and dropping the downstream senders cascades the
//! shutdown into the managers and the aggregator. Closing the router twice
//! is a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::email::{MessageSender, render_service_report};
use crate::types::{Notification, ServiceName};

/// A notification annotated with the service it originated from, as the
/// admin aggregator consumes it.
#[derive(Debug, Clone)]
pub struct SourceNotification {
    pub source: ServiceName,
    pub notification: Notification,
}

/// A registered worker-side handle. Dropping it releases the router's
/// counted latch; the router closes once every source is gone.
#[derive(Debug, Clone)]
pub struct NotificationSource {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSource {
    /// Forward one notification. Returns whether the router was still
    /// listening.
    pub async fn send(&self, notification: Notification) -> bool {
        self.tx.send(notification).await.is_ok()
    }
}

/// Fan-in point for every worker's notifications.
pub struct NotificationRouter {
    ingest: Option<mpsc::Sender<Notification>>,
    task: JoinHandle<()>,
}

impl NotificationRouter {
    /// Spawn the routing loop. `managers` maps each registered service to
    /// its email manager's inbox; `admin` is the aggregator's stream.
    pub fn spawn(
        managers: BTreeMap<ServiceName, mpsc::Sender<Notification>>,
        admin: mpsc::Sender<SourceNotification>,
    ) -> Self {
        let (ingest, mut rx) = mpsc::channel::<Notification>(64);

        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let service = notification.service().clone();

                match managers.get(&service) {
                    Some(manager) => {
                        if manager.send(notification.clone()).await.is_err() {
                            tracing::warn!(service = %service, "service email manager went away");
                        }
                    }
                    None => {
                        tracing::warn!(service = %service, "notification for unregistered service");
                    }
                }

                if admin
                    .send(SourceNotification {
                        source: service.clone(),
                        notification,
                    })
                    .await
                    .is_err()
                {
                    tracing::warn!(service = %service, "admin aggregator went away");
                }
            }
            // Receive stream drained: dropping `managers` and `admin` here
            // closes every downstream inbox.
        });

        Self {
            ingest: Some(ingest),
            task,
        }
    }

    /// Register a notification source for one worker invocation.
    pub fn register_source(&self) -> NotificationSource {
        let tx = self
            .ingest
            .as_ref()
            .expect("router already closed")
            .clone();
        NotificationSource { tx }
    }

    /// Release the driver's handle. Idempotent; the ingest stream closes
    /// when the last outstanding source is dropped as well.
    pub fn close(&mut self) {
        self.ingest.take();
    }

    /// Wait for the routing loop to drain and exit.
    pub async fn join(mut self) {
        self.close();
        if let Err(err) = (&mut self.task).await {
            tracing::error!(error = %err, "notification router task failed");
        }
    }
}

/// Per-service accumulator and delivery task.
///
/// Push errors accumulate keyed by node; a setup error is delivered
/// immediately. Whatever accumulated is flushed when the inbox closes.
pub fn spawn_service_email_manager(
    service: ServiceName,
    mut inbox: mpsc::Receiver<Notification>,
    sender: Arc<dyn MessageSender>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut push_errors: BTreeMap<String, String> = BTreeMap::new();

        while let Some(notification) = inbox.recv().await {
            match notification {
                Notification::SetupError { message, .. } => {
                    deliver(&service, &sender, &[message], &BTreeMap::new()).await;
                }
                Notification::PushError { message, node, .. } => {
                    push_errors.insert(node, message);
                }
            }
        }

        if !push_errors.is_empty() {
            deliver(&service, &sender, &[], &push_errors).await;
        }
    })
}

async fn deliver(
    service: &ServiceName,
    sender: &Arc<dyn MessageSender>,
    setup_errors: &[String],
    push_errors: &BTreeMap<String, String>,
) {
    let body = match render_service_report(service, setup_errors, push_errors) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(service = %service, error = %err, "failed to render service report");
            return;
        }
    };
    let subject = format!("courier errors for {service}");
    if let Err(err) = sender.send_message(&subject, &body).await {
        tracing::error!(service = %service, error = %err, "failed to deliver service report");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct RecordingSender {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(String, String)> {
            self.messages.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_message(&self, subject: &str, body: &str) -> anyhow::Result<()> {
            self.messages
                .lock()
                .expect("lock")
                .push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn service() -> ServiceName {
        ServiceName::new("dune", "production")
    }

    #[tokio::test]
    async fn router_fans_into_manager_and_admin() {
        let (manager_tx, mut manager_rx) = mpsc::channel(8);
        let (admin_tx, mut admin_rx) = mpsc::channel(8);
        let router = NotificationRouter::spawn(
            BTreeMap::from([(service(), manager_tx)]),
            admin_tx,
        );

        let source = router.register_source();
        assert!(source.send(Notification::setup(service(), "kinit failed")).await);
        drop(source);
        router.join().await;

        let to_manager = manager_rx.recv().await.expect("manager copy");
        assert_eq!(to_manager.message(), "kinit failed");
        assert!(manager_rx.recv().await.is_none());

        let to_admin = admin_rx.recv().await.expect("admin copy");
        assert_eq!(to_admin.source, service());
        assert_eq!(to_admin.notification.message(), "kinit failed");
        assert!(admin_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn router_close_is_idempotent() {
        let (admin_tx, _admin_rx) = mpsc::channel(8);
        let mut router = NotificationRouter::spawn(BTreeMap::new(), admin_tx);
        router.close();
        router.close();
        router.join().await;
    }

    #[tokio::test]
    async fn router_stays_open_while_any_source_lives() {
        let (manager_tx, mut manager_rx) = mpsc::channel(8);
        let (admin_tx, mut admin_rx) = mpsc::channel(8);
        let mut router = NotificationRouter::spawn(
            BTreeMap::from([(service(), manager_tx)]),
            admin_tx,
        );

        let first = router.register_source();
        let second = router.register_source();
        router.close();
        drop(first);

        // The remaining source still reaches the routing loop.
        assert!(second.send(Notification::setup(service(), "late failure")).await);
        drop(second);

        assert!(manager_rx.recv().await.is_some());
        assert!(manager_rx.recv().await.is_none());
        assert!(admin_rx.recv().await.is_some());
        assert!(admin_rx.recv().await.is_none());
        router.join().await;
    }

    #[tokio::test]
    async fn setup_errors_are_delivered_immediately() {
        let sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);
        let manager = spawn_service_email_manager(service(), rx, sender.clone());

        tx.send(Notification::setup(service(), "kinit failed"))
            .await
            .expect("send");

        // The message goes out before the inbox closes.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if !sender.take().is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("setup error delivered while inbox still open");

        drop(tx);
        manager.await.expect("manager");

        let messages = sender.take();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("kinit failed"));
    }

    #[tokio::test]
    async fn push_errors_accumulate_until_flush() {
        let sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);
        let manager = spawn_service_email_manager(service(), rx, sender.clone());

        tx.send(Notification::push(service(), "gpvm01", "first failure"))
            .await
            .expect("send");
        tx.send(Notification::push(service(), "gpvm01", "second failure"))
            .await
            .expect("send");
        tx.send(Notification::push(service(), "gpvm02", "other node"))
            .await
            .expect("send");
        drop(tx);
        manager.await.expect("manager");

        let messages = sender.take();
        assert_eq!(messages.len(), 1);
        let body = &messages[0].1;
        // Last write wins per node.
        assert!(body.contains("gpvm01: second failure"));
        assert!(!body.contains("first failure"));
        assert!(body.contains("gpvm02: other node"));
    }

    #[tokio::test]
    async fn empty_accumulator_sends_nothing() {
        let sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);
        let manager = spawn_service_email_manager(service(), rx, sender.clone());
        drop(tx);
        manager.await.expect("manager");
        assert!(sender.take().is_empty());
    }
}
