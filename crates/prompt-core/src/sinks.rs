//! Usage and metrics reporting collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The subscriber a request is billed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl AccountRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization: None,
        }
    }
}

/// Billing collaborator.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Report the billable size of a request; returns the billed cost.
    async fn report_usage(&self, account: &AccountRef, billed_bytes: u64) -> anyhow::Result<f64>;
}

/// Telemetry collaborator.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_metric(
        &self,
        account: &AccountRef,
        correlation_id: &str,
        name: &str,
        value: f64,
        unit: &str,
    ) -> anyhow::Result<()>;
}

/// Sink that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl UsageSink for LogSink {
    async fn report_usage(&self, account: &AccountRef, billed_bytes: u64) -> anyhow::Result<f64> {
        tracing::info!(account = %account.id, billed_bytes, "usage");
        Ok(0.0)
    }
}

#[async_trait]
impl MetricsSink for LogSink {
    async fn record_metric(
        &self,
        account: &AccountRef,
        correlation_id: &str,
        name: &str,
        value: f64,
        unit: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            account = %account.id,
            correlation_id,
            metric = name,
            value,
            unit,
            "metric"
        );
        Ok(())
    }
}

/// Metric names emitted by the engine.
pub mod metric {
    pub const RATE_LIMITED: &str = "RateLimited";
    pub const RATE_LIMITED_HARD: &str = "RateLimitedHard";
    pub const BILLING_FAILURE: &str = "BillingUsageFailure";
    pub const BILLED_BYTES: &str = "BilledBytes";
    pub const CHUNKS: &str = "Chunks";
    pub const INCOMPLETE_CHUNKS: &str = "IncompleteChunks";
    pub const INPUT_TOKENS: &str = "InputTokens";
    pub const OUTPUT_TOKENS: &str = "OutputTokens";
}
