//! Outbound message delivery.
//!
//! The routers are transport-agnostic: they hand a rendered string to a
//! [`MessageSender`], which is SMTP, a webhook, or a logged no-op when
//! notifications are disabled. Delivery failures are logged, never fatal;
//! the router must keep draining regardless.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::{EmailSection, WebhookSection};
use crate::types::ServiceName;

/// Single-method delivery capability.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, subject: &str, body: &str) -> Result<()>;
}

/// SMTP delivery via the configured relay.
pub struct EmailSender {
    from: String,
    to: Vec<String>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSender {
    pub fn new(section: &EmailSection, to: Vec<String>) -> Result<Self> {
        let transport =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&section.smtphost)
                .port(section.smtpport)
                .build();
        Ok(Self {
            from: section.from.clone(),
            to,
            transport,
        })
    }
}

#[async_trait]
impl MessageSender for EmailSender {
    async fn send_message(&self, subject: &str, body: &str) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.parse().context("invalid from address")?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.parse().context("invalid recipient address")?);
        }
        let message = builder.body(body.to_string()).context("building message")?;

        self.transport
            .send(message)
            .await
            .context("smtp delivery failed")?;
        Ok(())
    }
}

/// Webhook delivery: `POST {"text": "<message>"}`.
pub struct WebhookSender {
    url: String,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(section: &WebhookSection) -> Result<Option<Self>> {
        if !section.enabled {
            return Ok(None);
        }
        let url = section
            .url
            .clone()
            .context("webhook.url is required when webhooks are enabled")?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Some(Self { url, client }))
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    async fn send_message(&self, subject: &str, body: &str) -> Result<()> {
        let payload = serde_json::json!({ "text": format!("{subject}\n{body}") });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("failed to send webhook request")?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned error status {}", response.status());
        }
        Ok(())
    }
}

/// Used when `disableNotifications` is set: aggregation still runs, delivery
/// becomes a log line.
pub struct DisabledSender;

#[async_trait]
impl MessageSender for DisabledSender {
    async fn send_message(&self, subject: &str, body: &str) -> Result<()> {
        tracing::info!(subject, body, "notifications disabled; message dropped");
        Ok(())
    }
}

/// Deliver one message through several transports (admin email plus
/// webhook). Each failure is logged; the fan-out itself never fails.
pub struct FanoutSender {
    senders: Vec<Arc<dyn MessageSender>>,
}

impl FanoutSender {
    pub fn new(senders: Vec<Arc<dyn MessageSender>>) -> Self {
        Self { senders }
    }
}

#[async_trait]
impl MessageSender for FanoutSender {
    async fn send_message(&self, subject: &str, body: &str) -> Result<()> {
        for sender in &self.senders {
            if let Err(err) = sender.send_message(subject, body).await {
                tracing::error!(error = %err, "message delivery failed on one transport");
            }
        }
        Ok(())
    }
}

const SERVICE_REPORT_TEMPLATE: &str = "\
Errors were encountered while refreshing tokens for service {{ service }}.

{% if setup_errors %}Setup errors:
{% for message in setup_errors %}  - {{ message }}
{% endfor %}{% endif %}\
{% if push_errors %}Node errors:
{% for node, message in push_errors %}  - {{ node }}: {{ message }}
{% endfor %}{% endif %}";

/// Render the per-service report handed to that service's operators.
pub fn render_service_report(
    service: &ServiceName,
    setup_errors: &[String],
    push_errors: &BTreeMap<String, String>,
) -> Result<String> {
    let mut context = tera::Context::new();
    context.insert("service", &service.to_string());
    context.insert("setup_errors", setup_errors);
    context.insert("push_errors", push_errors);
    tera::Tera::one_off(SERVICE_REPORT_TEMPLATE, &context, false)
        .context("rendering service report")
}

const ADMIN_DIGEST_TEMPLATE: &str = "\
Token refresh errors crossed the notification threshold for the services
below.

{% for report in reports %}{{ report.service }}:
{% if report.setup_errors %}  setup errors:
{% for message in report.setup_errors %}    - {{ message }}
{% endfor %}{% endif %}\
{% if report.push_errors %}  push errors:
{% for node, message in report.push_errors %}    - {{ node }}: {{ message }}
{% endfor %}{% endif %}
{% endfor %}";

/// One service's slice of the admin digest.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminReport {
    pub service: String,
    pub setup_errors: Vec<String>,
    pub push_errors: BTreeMap<String, String>,
}

/// Render the end-of-run admin digest.
pub fn render_admin_digest(reports: &[AdminReport]) -> Result<String> {
    let mut context = tera::Context::new();
    context.insert("reports", reports);
    tera::Tera::one_off(ADMIN_DIGEST_TEMPLATE, &context, false).context("rendering admin digest")
}
