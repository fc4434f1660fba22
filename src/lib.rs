//! tunnelkeeper - always-on local SOCKS5 relay in front of external tunnel engines
//!
//! Client applications talk to one local SOCKS5 endpoint that is up as soon
//! as a session is requested. Behind it the daemon supervises a `warp-plus`
//! tunnel engine (and optionally a `sing-box` TUN engine), searching for a
//! configuration that works on the current network.
//!
//! # Architecture
//!
//! ```text
//!                  +----------------+
//!                  |   hub/ (API)   |
//!                  +-------+--------+
//!                          |
//!                  +-------v--------+      +-------------+
//!                  |    manager/    +------>  identity/  |
//!                  +-------+--------+      +-------------+
//!                          |
//!                  +-------v--------+      +-------------+
//!                  |   provider/    +------>   system/   |
//!                  +--+---------+---+      +-------------+
//!                     |         |
//!          +----------v--+   +--v---------+
//!          |  inbound/   |   |  search/   |
//!          |  (relay)    |   +--+---------+
//!          +------+------+      |
//!                 |          +--v---------+     +-----------+
//!          +------v------+   |  engine/   +----->  process/ |
//!          |  outbound/  |   +------------+     +-----------+
//!          | (socks5)    |
//!          +-------------+
//! ```

pub mod common;
pub mod config;
pub mod engine;
pub mod hub;
pub mod identity;
pub mod inbound;
pub mod manager;
pub mod outbound;
pub mod process;
pub mod provider;
pub mod search;
pub mod system;

pub use common::error::{Error, Result};
pub use config::Settings;
pub use manager::{ConnectRequest, Manager, Status};

use hub::AppState;
use identity::{FileIdentityStore, WarpRegistrar};
use process::ExecRunner;
use provider::ProviderDeps;
use std::net::SocketAddr;
use std::sync::Arc;
use system::SystemProxy;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daemon wiring: manager, collaborators and the control API
pub struct Daemon {
    manager: Arc<Manager>,
    system_proxy: Arc<dyn SystemProxy>,
    api_addr: SocketAddr,
}

impl Daemon {
    /// Build the daemon against real processes and the platform proxy
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let api_addr = common::net::resolve(&settings.listen)?;
        let system_proxy = system::platform_default();

        let deps = ProviderDeps {
            settings: Arc::new(settings),
            runner: Arc::new(ExecRunner::new()),
            scanner: None,
            system_proxy: system_proxy.clone(),
        };
        let identity = Arc::new(FileIdentityStore::new(Arc::new(WarpRegistrar::new()?)));
        let manager = Arc::new(Manager::new(deps, identity));

        Ok(Daemon {
            manager,
            system_proxy,
            api_addr,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Serve the control API until Ctrl-C, then tear the session down.
    ///
    /// A control API that cannot bind or stops serving ends the daemon with
    /// its error.
    pub async fn run(&self) -> Result<()> {
        let listener = hub::bind_server(self.api_addr).await?;
        let state = AppState::new(self.manager.clone(), self.system_proxy.clone());
        info!("Control API listening on {}", self.api_addr);

        let outcome = tokio::select! {
            res = hub::serve(state, listener) => match res {
                Ok(()) => Err(Error::internal("control API stopped")),
                Err(e) => Err(e),
            },
            signal = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                signal.map_err(Error::from)
            }
        };

        self.manager.disconnect().await;
        match &outcome {
            Ok(()) => info!("Daemon stopped"),
            Err(e) => warn!("Daemon stopped: {}", e),
        }
        outcome
    }
}
