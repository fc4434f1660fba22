//! External engines
//!
//! - [`tunnel::TunnelEngine`]: the `warp-plus` process exposing an upstream SOCKS5 port
//! - [`virtualization::VirtualizationEngine`]: the `sing-box` TUN process
//! - [`scan`]: fallback endpoint discovery
//!
//! Both engines sit on a [`supervisor::Supervisor`] that owns at most one child.

pub mod scan;
pub mod supervisor;
pub mod tunnel;
pub mod virtualization;

pub use scan::{Endpoint, EndpointScan, WarpScanner};
pub use supervisor::EngineState;
pub use tunnel::{Mode, TunnelConfig, TunnelEngine};
pub use virtualization::{RoutingConfig, VirtualizationConfig, VirtualizationEngine};
