use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;
use yard_storage::HealthFileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn token(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Per-partition run health. Starts healthy; the first failure latches it
/// unhealthy for the rest of the run.
#[derive(Debug, Default)]
pub struct HealthLatch {
    status: HealthStatus,
    reasons: Vec<String>,
}

impl HealthLatch {
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.status == HealthStatus::Healthy {
            warn!(reason = %reason, "partition health latched unhealthy");
        }
        self.status = HealthStatus::Unhealthy;
        self.reasons.push(reason);
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }
}

/// Writes the final token of each partition run for an external liveness monitor.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    files: HealthFileStore,
}

impl HealthReporter {
    pub fn new(files: HealthFileStore) -> Self {
        Self { files }
    }

    pub async fn persist(&self, partition: &str, latch: &HealthLatch) -> Result<PathBuf> {
        self.files.write(partition, latch.status().token()).await
    }

    pub async fn read(&self, partition: &str) -> Result<Option<String>> {
        self.files.read(partition).await
    }
}
