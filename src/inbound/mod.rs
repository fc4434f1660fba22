//! Inbound listeners

mod relay;

pub use relay::{Relay, RelayConfig, DIRECT_DIAL_TIMEOUT, STOP_GRACE, UPSTREAM_PROBE_TIMEOUT};

use crate::Result;
use async_trait::async_trait;

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &str;

    /// Bind and begin accepting in the background
    async fn start(&self) -> Result<()>;

    /// Stop accepting and release the listener
    async fn stop(&self) -> Result<()>;

    /// Check if listener is running
    fn is_running(&self) -> bool;
}
