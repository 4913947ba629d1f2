use std::sync::Arc;
use tj_api_types::ChainProfile;
use tj_provider::WalletProvider;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

/// Keeps the wallet on the network the contract is deployed to.
///
/// Switching first and adding only on "unknown chain" is deliberate: adding a
/// chain the wallet already knows fails, and switching to a chain it never saw
/// fails forever.
pub struct NetworkGuard {
    provider: Arc<dyn WalletProvider>,
}

impl NetworkGuard {
    pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
        Self { provider }
    }

    pub async fn is_active(&self, profile: &ChainProfile) -> Result<bool> {
        Ok(self.provider.chain_id().await? == profile.chain_id)
    }

    pub async fn ensure(&self, profile: &ChainProfile) -> Result<()> {
        if self.is_active(profile).await? {
            debug!("wallet already on {}", profile.chain_name);
            return Ok(());
        }

        info!("switching wallet to {} ({})", profile.chain_name, profile.chain_id);
        let err = match self.provider.switch_chain(profile.chain_id).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_unrecognized_chain() {
            warn!("chain switch failed: {}", err);
            return Err(SessionError::ChainSwitchFailed(err.reason()));
        }

        info!("wallet does not know {}, adding it", profile.chain_name);
        self.provider
            .add_chain(profile)
            .await
            .map_err(|err| SessionError::ChainAddFailed(err.reason()))?;

        self.provider
            .switch_chain(profile.chain_id)
            .await
            .map_err(|err| SessionError::ChainSwitchFailed(err.reason()))
    }
}
