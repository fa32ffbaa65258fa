//! Shipped job definitions.
//!
//! These are the queues registered by the worker binary: webhook cancellation
//! confirmations and outbound messaging. All downstream clinical-API traffic
//! goes through the [`ConfirmationGateway`] port, implemented by the host
//! application; the definitions here only shape payloads, policy, and
//! outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::jobs::job::{
    Backoff, HandlerError, HandlerOutcome, JobContext, JobOptions, QueueJob,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Gateway Port
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by the downstream gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The tenant's configured endpoint does not exist (404-equivalent)
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    /// The downstream service could not be reached or answered abnormally
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// The downstream service rejected the request
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Check if this failure means the endpoint is permanently missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EndpointNotFound(_))
    }
}

/// Port to the external clinical confirmation API.
///
/// The dispatch subsystem never talks to the clinical API directly; the host
/// application implements this trait and injects it at registration time.
#[async_trait]
pub trait ConfirmationGateway: Send + Sync {
    /// Confirm an exam cancellation with the tenant's configured endpoint.
    async fn confirm_cancellation(
        &self,
        tenant_id: &str,
        external_ids: &[i64],
        procedures: &[i64],
    ) -> std::result::Result<Value, GatewayError>;

    /// Deliver an outbound message envelope.
    async fn send_message(
        &self,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<Value, GatewayError>;
}

/// Gateway that logs and reports success. Used where no clinical API is
/// wired, and in tests.
pub struct LoggingGateway;

#[async_trait]
impl ConfirmationGateway for LoggingGateway {
    async fn confirm_cancellation(
        &self,
        tenant_id: &str,
        external_ids: &[i64],
        procedures: &[i64],
    ) -> std::result::Result<Value, GatewayError> {
        tracing::info!(tenant_id, ?external_ids, ?procedures, "Cancellation confirmed (logging gateway)");
        Ok(json!(true))
    }

    async fn send_message(
        &self,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<Value, GatewayError> {
        tracing::info!(
            tenant_id = %envelope.tenant_id,
            session_id = envelope.session_id,
            "Message sent (logging gateway)"
        );
        Ok(json!(true))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload of a webhook cancellation job. Field names follow the external
/// webhook wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationPayload {
    /// External scheduling ids affected by the cancellation
    #[serde(rename = "idexterno")]
    pub external_ids: Vec<i64>,
    /// Procedure codes of the cancelled exams
    #[serde(rename = "procedimentos")]
    pub procedures: Vec<i64>,
    /// Owning tenant
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
}

/// Envelope of an outbound message job, as produced by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Configured API integration id
    #[serde(rename = "apiId")]
    pub api_id: String,
    /// Messaging session the delivery goes through
    #[serde(rename = "sessionId")]
    pub session_id: i64,
    /// Owning tenant
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Caller-provided correlation key
    #[serde(rename = "externalKey")]
    pub external_key: String,
    /// Message body and contact details, opaque to the dispatch subsystem
    #[serde(default)]
    pub body: Option<Value>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Definitions
// ═══════════════════════════════════════════════════════════════════════════════

/// Job: confirm an exam cancellation against the tenant's webhook endpoint.
pub struct WebhookCancelJob {
    gateway: Arc<dyn ConfirmationGateway>,
}

impl WebhookCancelJob {
    pub fn new(gateway: Arc<dyn ConfirmationGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl QueueJob for WebhookCancelJob {
    fn key(&self) -> &'static str {
        "WebhookCancel"
    }

    fn options(&self) -> JobOptions {
        JobOptions::delayed(6000).with_max_attempts(5)
    }

    async fn handle(&self, ctx: &JobContext, payload: Value) -> HandlerOutcome {
        let parsed: CancellationPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(format!("malformed cancellation payload: {}", e)))?;
        ctx.log(&format!(
            "confirming cancellation of {} exam(s) for tenant {}",
            parsed.external_ids.len(),
            parsed.tenant_id
        ));

        match self
            .gateway
            .confirm_cancellation(&parsed.tenant_id, &parsed.external_ids, &parsed.procedures)
            .await
        {
            Ok(response) => Ok(response),
            // A missing endpoint is a tenant configuration problem, not a
            // transient fault: report it as a result so the job is not
            // retried against an endpoint that will never exist.
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    tenant_id = %parsed.tenant_id,
                    error = %e,
                    "Webhook endpoint is not configured; not retrying"
                );
                Ok(json!({ "message": "webhook endpoint is not configured for this tenant" }))
            }
            Err(e) => Err(HandlerError::new(e.to_string())
                .with_context(json!({ "tenantId": parsed.tenant_id }))),
        }
    }
}

/// Job: deliver an appointment confirmation message.
pub struct ConfirmationMessageJob {
    gateway: Arc<dyn ConfirmationGateway>,
}

impl ConfirmationMessageJob {
    pub fn new(gateway: Arc<dyn ConfirmationGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl QueueJob for ConfirmationMessageJob {
    fn key(&self) -> &'static str {
        "SendMessageConfirm"
    }

    fn options(&self) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::exponential(5000, 60000))
    }

    async fn handle(&self, ctx: &JobContext, payload: Value) -> HandlerOutcome {
        let envelope: MessageEnvelope = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(format!("malformed message envelope: {}", e)))?;
        ctx.log(&format!(
            "sending confirmation message for tenant {} via session {}",
            envelope.tenant_id, envelope.session_id
        ));

        self.gateway
            .send_message(&envelope)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// Job: deliver a message submitted through the external API surface.
pub struct ApiMessageJob {
    gateway: Arc<dyn ConfirmationGateway>,
}

impl ApiMessageJob {
    pub fn new(gateway: Arc<dyn ConfirmationGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl QueueJob for ApiMessageJob {
    fn key(&self) -> &'static str {
        "SendMessageApi"
    }

    fn options(&self) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::fixed(10000))
    }

    async fn handle(&self, ctx: &JobContext, payload: Value) -> HandlerOutcome {
        let envelope: MessageEnvelope = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(format!("malformed message envelope: {}", e)))?;
        ctx.log(&format!(
            "sending API message {} for tenant {}",
            envelope.external_key, envelope.tenant_id
        ));

        self.gateway
            .send_message(&envelope)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// The full set of shipped job definitions, in registration order.
pub fn default_definitions(gateway: Arc<dyn ConfirmationGateway>) -> Vec<Arc<dyn QueueJob>> {
    vec![
        Arc::new(WebhookCancelJob::new(gateway.clone())),
        Arc::new(ConfirmationMessageJob::new(gateway.clone())),
        Arc::new(ApiMessageJob::new(gateway)),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobInstance;
    use crate::jobs::observer::QueueEvents;

    struct FailingGateway {
        error: fn() -> GatewayError,
    }

    #[async_trait]
    impl ConfirmationGateway for FailingGateway {
        async fn confirm_cancellation(
            &self,
            _tenant_id: &str,
            _external_ids: &[i64],
            _procedures: &[i64],
        ) -> std::result::Result<Value, GatewayError> {
            Err((self.error)())
        }

        async fn send_message(
            &self,
            _envelope: &MessageEnvelope,
        ) -> std::result::Result<Value, GatewayError> {
            Err((self.error)())
        }
    }

    fn context(queue: &str, payload: Value) -> JobContext {
        let job = JobInstance::new(queue, payload, JobOptions::default());
        JobContext::new(job, Arc::new(QueueEvents::new()))
    }

    fn cancellation_payload() -> Value {
        json!({ "idexterno": [1, 2], "procedimentos": [10], "tenantId": "7" })
    }

    #[tokio::test]
    async fn cancel_job_succeeds_against_logging_gateway() {
        let job = WebhookCancelJob::new(Arc::new(LoggingGateway));
        let payload = cancellation_payload();
        let ctx = context("WebhookCancel", payload.clone());

        let outcome = job.handle(&ctx, payload).await;
        assert_eq!(outcome.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn cancel_job_converts_missing_endpoint_into_result() {
        let job = WebhookCancelJob::new(Arc::new(FailingGateway {
            error: || GatewayError::EndpointNotFound("tenant 7".to_string()),
        }));
        let payload = cancellation_payload();
        let ctx = context("WebhookCancel", payload.clone());

        let outcome = job.handle(&ctx, payload).await.unwrap();
        assert_eq!(
            outcome["message"],
            "webhook endpoint is not configured for this tenant"
        );
    }

    #[tokio::test]
    async fn cancel_job_propagates_transient_failures() {
        let job = WebhookCancelJob::new(Arc::new(FailingGateway {
            error: || GatewayError::Unavailable("connection reset".to_string()),
        }));
        let payload = cancellation_payload();
        let ctx = context("WebhookCancel", payload.clone());

        let err = job.handle(&ctx, payload).await.unwrap_err();
        assert!(err.message.contains("connection reset"));
    }

    #[tokio::test]
    async fn cancel_job_rejects_malformed_payload() {
        let job = WebhookCancelJob::new(Arc::new(LoggingGateway));
        let payload = json!({ "tenantId": "7" });
        let ctx = context("WebhookCancel", payload.clone());

        let err = job.handle(&ctx, payload).await.unwrap_err();
        assert!(err.message.contains("malformed"));
    }

    #[tokio::test]
    async fn message_jobs_parse_wire_field_names() {
        let job = ApiMessageJob::new(Arc::new(LoggingGateway));
        let payload = json!({
            "apiId": "api-1",
            "sessionId": 4,
            "tenantId": "7",
            "externalKey": "abc123",
            "body": { "number": "5561999", "text": "exam confirmed" }
        });
        let ctx = context("SendMessageApi", payload.clone());

        assert!(job.handle(&ctx, payload).await.is_ok());
    }

    #[test]
    fn default_definitions_cover_all_shipped_queues() {
        let definitions = default_definitions(Arc::new(LoggingGateway));
        let keys: Vec<&str> = definitions.iter().map(|d| d.key()).collect();
        assert_eq!(keys, vec!["WebhookCancel", "SendMessageConfirm", "SendMessageApi"]);
        assert_eq!(definitions[0].options().delay_ms, Some(6000));
        assert_eq!(definitions[0].options().max_attempts, Some(5));
    }
}
