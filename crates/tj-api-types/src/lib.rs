use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GOERLI_CHAIN_ID: u64 = 5;

/// Wallet address, lowercased so that provider-reported variants compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub struct Account(String);

impl Account {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Account {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Account> for String {
    fn from(value: Account) -> Self {
        value.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// EIP-155 chain id. Serialized as the `0x`-prefixed hex form wallets exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(pub u64);

impl ChainId {
    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0)
    }

    pub fn parse_hex(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| format!("chain id must be 0x-prefixed hex: {trimmed}"))?;
        if digits.is_empty() {
            return Err("chain id has no digits".to_owned());
        }
        u64::from_str_radix(digits, 16)
            .map(ChainId)
            .map_err(|err| format!("invalid chain id {trimmed}: {err}"))
    }
}

impl TryFrom<String> for ChainId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_hex(&value)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Parameters identifying the network the contract is deployed on.
///
/// Field names match the `wallet_addEthereumChain` parameter object so a profile
/// can be handed to a provider as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainProfile {
    pub chain_id: ChainId,
    pub chain_name: String,
    pub native_currency: NativeCurrency,
    pub rpc_urls: Vec<String>,
}

impl ChainProfile {
    pub fn goerli() -> Self {
        Self {
            chain_id: ChainId(GOERLI_CHAIN_ID),
            chain_name: "Ethereum Testnet Görli".to_owned(),
            native_currency: NativeCurrency {
                name: "Görli Ether".to_owned(),
                symbol: "ETH".to_owned(),
                decimals: 18,
            },
            rpc_urls: vec!["https://rpc.goerli.mudit.blog/".to_owned()],
        }
    }
}

/// Every network this client can run against. Only one is deployed today.
pub fn supported_profiles() -> Vec<ChainProfile> {
    vec![ChainProfile::goerli()]
}

pub fn profile_for(chain_id: ChainId) -> Option<ChainProfile> {
    supported_profiles()
        .into_iter()
        .find(|profile| profile.chain_id == chain_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransactionState {
    NotStarted,
    Submitted { hash: TxHash },
    Confirmed { hash: TxHash },
    Failed { reason: String },
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Failed { .. })
    }

    pub fn hash(&self) -> Option<&TxHash> {
        match self {
            Self::Submitted { hash } | Self::Confirmed { hash } => Some(hash),
            Self::NotStarted | Self::Failed { .. } => None,
        }
    }
}

/// A memo from the contract log, normalized for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub author: Account,
    pub display_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Attached tip in base units.
    pub value: Option<u128>,
}

/// Everything the rendering layer is allowed to see.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub account: Option<Account>,
    pub chain_ok: bool,
    pub pending_tx: Option<TransactionState>,
    pub records: Vec<Record>,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.account.is_some()
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending_tx
            .as_ref()
            .is_some_and(|state| !state.is_terminal())
    }
}

/// Integer field as it may arrive from a bridge: JSON number or decimal string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum NumberLike {
    Int(u64),
    Text(String),
}

impl NumberLike {
    pub fn to_u128(&self) -> Option<u128> {
        match self {
            Self::Int(value) => Some(u128::from(*value)),
            Self::Text(text) => text.trim().parse::<u128>().ok(),
        }
    }
}

/// One entry of the contract's `getMemos` result, before validation.
///
/// Every field is optional on the wire; the synchronizer decides which ones are
/// required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawMemo {
    #[serde(default, alias = "author", alias = "address")]
    pub from: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<NumberLike>,
    #[serde(default, alias = "amount", skip_serializing_if = "Option::is_none")]
    pub value: Option<NumberLike>,
}
