use thiserror::Error;
use tj_provider::ProviderError;

use crate::amount::AmountError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a wallet provider is required; install one and reload")]
    ProviderMissing,
    #[error("request rejected in wallet: {0}")]
    UserRejected(String),
    #[error("wallet refused to switch network: {0}")]
    ChainSwitchFailed(String),
    #[error("wallet refused to add network: {0}")]
    ChainAddFailed(String),
    #[error("transaction was not submitted: {0}")]
    SubmissionRejected(String),
    #[error("transaction reverted: {0}")]
    TransactionReverted(String),
    #[error("invalid input: {0}")]
    MalformedInput(String),
    #[error("no account connected")]
    NotConnected,
    #[error("a previous transaction has not finished yet")]
    TransactionPending,
    #[error("unexpected contract response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for SessionError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Missing => Self::ProviderMissing,
            err if err.is_user_rejection() => Self::UserRejected(err.reason()),
            err => Self::Provider(err),
        }
    }
}

impl From<AmountError> for SessionError {
    fn from(err: AmountError) -> Self {
        Self::MalformedInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
