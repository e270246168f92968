use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use yard_core::VehicleRecord;
use yard_storage::{FetchError, HttpRequest, Transport};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("encoding notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Delivery(#[from] FetchError),
}

/// Outbound sink for new and updated records. Called once per change; callers never retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &VehicleRecord) -> Result<(), NotifyError>;
}

/// POSTs the canonical record as JSON. Any 2xx response counts as delivered.
pub struct WebhookNotifier {
    url: String,
    transport: Arc<dyn Transport>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: url.into(),
            transport,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, record: &VehicleRecord) -> Result<(), NotifyError> {
        let body = serde_json::to_value(record)?;
        self.transport
            .execute(&HttpRequest::post_json(&self.url, body))
            .await?;
        Ok(())
    }
}

/// Used when no webhook is configured and for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyNotifier;

#[async_trait]
impl Notifier for LogOnlyNotifier {
    async fn notify(&self, record: &VehicleRecord) -> Result<(), NotifyError> {
        info!(
            partition = %record.source_partition,
            stock_num = %record.stock_num,
            year = record.year,
            model = %record.model,
            interest_level = record.interest_level,
            "notification (no webhook configured)"
        );
        Ok(())
    }
}
