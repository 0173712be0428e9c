//! Service lifecycle: registry bookkeeping and dependency-ordered startup

pub mod injector;
pub mod registry;

pub use injector::{DependencyInjector, InitializationReport};
pub use registry::{ServiceOptions, ServiceRegistration, ServiceRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle state machine per service
///
/// `Created -> Initializing -> Ready`, with `Error` on failure and
/// `Destroyed` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Initializing,
    Ready,
    Error,
    Destroyed,
}

/// Health snapshot reported by a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub details: String,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            details: "ok".to_string(),
        }
    }

    pub fn unhealthy<S: Into<String>>(details: S) -> Self {
        Self {
            healthy: false,
            details: details.into(),
        }
    }
}

/// Contract every registrable service implements
///
/// `initialize`/`destroy` return `anyhow::Result` because services are the
/// seam where arbitrary host code plugs in; the injector converts failures
/// into structured errors.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable service name used for registration and dependency declarations
    fn name(&self) -> &str;

    /// Bring the service up; called by the injector, possibly several times
    /// under the retry policy
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Current lifecycle state as the service itself sees it
    fn state(&self) -> ServiceState;

    /// Whether the service is ready to serve
    fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Tear the service down
    async fn destroy(&self) -> anyhow::Result<()>;

    /// Health snapshot for monitoring
    fn health(&self) -> ServiceHealth {
        if self.is_ready() {
            ServiceHealth::healthy()
        } else {
            ServiceHealth::unhealthy(format!("state: {:?}", self.state()))
        }
    }
}
