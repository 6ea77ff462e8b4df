//! Component health reporting.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
    pub metrics: HashMap<String, String>,
}

impl ComponentHealth {
    pub fn healthy(message: Option<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: String) -> Self {
        Self::with_status(HealthStatus::Degraded, Some(message))
    }

    pub fn unhealthy(message: String) -> Self {
        Self::with_status(HealthStatus::Unhealthy, Some(message))
    }

    fn with_status(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check: SystemTime::now(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metrics.insert(key.into(), value.to_string());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
