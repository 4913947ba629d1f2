use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tj_api_types::{Account, ChainId, ChainProfile, TxHash};
use tokio::sync::broadcast;

mod memory;

pub use memory::InMemoryProvider;

/// EIP-1193: the user rejected the request.
pub const USER_REJECTED: i64 = 4001;
/// EIP-3326: the wallet does not know the requested chain.
pub const UNRECOGNIZED_CHAIN: i64 = 4902;
/// JSON-RPC: method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC: execution reverted / invalid params.
pub const EXECUTION_ERROR: i64 = -32000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no wallet provider is available")]
    Missing,
    #[error("provider error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("provider transport failure: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            Self::Missing | Self::Transport(_) => None,
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code() == Some(USER_REJECTED)
    }

    pub fn is_unrecognized_chain(&self) -> bool {
        self.code() == Some(UNRECOGNIZED_CHAIN)
    }

    /// Message as reported by the provider, without our own prefix.
    pub fn reason(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Changes the wallet pushes without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(ChainId),
    Disconnected,
}

/// A contract method invocation at the ABI level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractCall {
    pub address: String,
    pub method: String,
    pub args: Vec<serde_json::Value>,
    /// Value attached to the call, in base units.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_u128_string")]
    pub value: Option<u128>,
}

impl ContractCall {
    pub fn new(address: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            method: method.into(),
            args: Vec::new(),
            value: None,
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_value(mut self, value: Option<u128>) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub confirmations: u64,
    pub revert_reason: Option<String>,
}

/// The injected wallet: account authority, chain selection and call signing.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Accounts already authorized for this origin. Never prompts.
    async fn accounts(&self) -> Result<Vec<String>, ProviderError>;
    /// Prompts the user to authorize an account.
    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError>;
    async fn chain_id(&self) -> Result<ChainId, ProviderError>;
    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError>;
    async fn add_chain(&self, profile: &ChainProfile) -> Result<(), ProviderError>;
    async fn call(&self, call: &ContractCall) -> Result<serde_json::Value, ProviderError>;
    /// Signs and broadcasts; returns once the node accepted the transaction.
    async fn send_transaction(&self, from: &Account, call: &ContractCall) -> Result<TxHash, ProviderError>;
    /// Resolves once the transaction is included with `confirmations` blocks on top.
    async fn wait_for_receipt(&self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError>;
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

mod opt_u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|text| text.parse::<u128>().map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
