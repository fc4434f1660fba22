//! How client traffic is steered into the session

use super::{ProviderDeps, VIRTUALIZATION_LOG_FILE};
use crate::engine::{VirtualizationConfig, VirtualizationEngine};
use crate::manager::IntegrationMode;
use crate::system::SystemProxy;
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Integration side effects of one session
pub struct Integration {
    pub mode: IntegrationMode,
    pub pac_enabled: bool,
    pub virtualization: Option<VirtualizationEngine>,
    /// Non-fatal problem worth showing in the status message
    pub warning: Option<String>,
    system_proxy: Arc<dyn SystemProxy>,
}

impl Integration {
    pub fn virtualization_active(&self) -> bool {
        self.virtualization
            .as_ref()
            .map_or(false, VirtualizationEngine::is_active)
    }

    /// Undo everything [`apply_integration`] did
    pub async fn teardown(&mut self) {
        if let Some(virt) = self.virtualization.take() {
            if let Err(e) = virt.stop().await {
                warn!("Failed to stop virtualization engine: {}", e);
            }
        }
        if self.pac_enabled {
            self.pac_enabled = false;
            if let Err(e) = self.system_proxy.disable_pac().await {
                warn!("Failed to disable system PAC: {}", e);
            }
        }
    }
}

/// Apply `mode` for a session whose SOCKS endpoint is `socks_addr`.
///
/// PAC failures are reported through [`Integration::warning`]; a
/// virtualization engine that does not start fails the call.
pub async fn apply_integration(
    deps: &ProviderDeps,
    mode: IntegrationMode,
    socks_addr: &str,
    state_dir: &Path,
    dns: Option<String>,
) -> Result<Integration> {
    let mut integration = Integration {
        mode,
        pac_enabled: false,
        virtualization: None,
        warning: None,
        system_proxy: deps.system_proxy.clone(),
    };

    match mode {
        IntegrationMode::Direct => {}
        IntegrationMode::Pac => {
            let url = deps.settings.pac_url();
            match deps.system_proxy.enable_pac(&url).await {
                Ok(()) => integration.pac_enabled = true,
                Err(e) => {
                    warn!("Failed to enable system PAC: {}", e);
                    integration.warning = Some(format!("pac failed: {}", e));
                }
            }
        }
        IntegrationMode::Tun => {
            let virt = VirtualizationEngine::new(
                VirtualizationConfig {
                    bin: deps.settings.sing_box_bin(None),
                    socks_addr: socks_addr.to_string(),
                    state_dir: Some(state_dir.to_path_buf()),
                    dns,
                    log_path: Some(state_dir.join(VIRTUALIZATION_LOG_FILE)),
                },
                deps.runner.clone(),
            );
            if let Err(e) = virt.start().await {
                return Err(Error::internal(format!("sing-box failed: {}", e)));
            }
            info!("Virtualization engine routing through {}", socks_addr);
            integration.virtualization = Some(virt);
        }
    }

    Ok(integration)
}
