use tj_api_types::ChainProfile;

use crate::error::{Result, SessionError};

/// Memo contract deployed on Görli.
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0xae2AAC1E23CD23158e402A48D0C35f1764c91831";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub profile: ChainProfile,
    pub contract_address: String,
    /// Blocks on top of the inclusion block before a write counts as confirmed.
    pub confirmations: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: ChainProfile::goerli(),
            contract_address: DEFAULT_CONTRACT_ADDRESS.to_owned(),
            confirmations: 1,
        }
    }
}

impl SessionConfig {
    pub fn new(profile: ChainProfile, contract_address: impl Into<String>) -> Self {
        Self {
            profile,
            contract_address: contract_address.into(),
            confirmations: 1,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let digits = self
            .contract_address
            .strip_prefix("0x")
            .ok_or_else(|| SessionError::MalformedInput("contract address must start with 0x".to_owned()))?;
        if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SessionError::MalformedInput(format!(
                "contract address {} is not 20 bytes of hex",
                self.contract_address
            )));
        }
        if self.confirmations == 0 {
            return Err(SessionError::MalformedInput(
                "confirmations must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
