use std::sync::{Arc, PoisonError, RwLock};
use tj_api_types::Account;
use tj_provider::{ProviderEvent, WalletProvider};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Result, SessionError};

/// Owns the connected account and the link to the injected provider.
///
/// `None` for the provider means no wallet is installed. That state is
/// recoverable: the user can install one and mount a new session.
pub struct WalletSession {
    provider: Option<Arc<dyn WalletProvider>>,
    account: RwLock<Option<Account>>,
}

impl WalletSession {
    pub fn new(provider: Option<Arc<dyn WalletProvider>>) -> Self {
        Self {
            provider,
            account: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> Result<&Arc<dyn WalletProvider>> {
        self.provider.as_ref().ok_or(SessionError::ProviderMissing)
    }

    pub fn account(&self) -> Option<Account> {
        self.account
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_account(&self, account: Option<Account>) {
        *self.account.write().unwrap_or_else(PoisonError::into_inner) = account;
    }

    /// Looks for an already-authorized account without prompting the user.
    ///
    /// The stored account only changes when the wallet answered; a failed
    /// lookup leaves the current account in place.
    pub async fn discover(&self) -> Result<Option<Account>> {
        let Some(provider) = &self.provider else {
            warn!("no wallet provider found; a provider is required to connect");
            return Err(SessionError::ProviderMissing);
        };

        let accounts = provider.accounts().await.inspect_err(|err| {
            warn!("account discovery failed: {}", err);
        })?;
        let account = accounts.first().map(Account::new);

        match &account {
            Some(account) => info!("found an authorized account: {}", account),
            None => info!("no authorized account found"),
        }
        self.set_account(account.clone());
        Ok(account)
    }

    /// Prompts the user to authorize an account. Only call from a user action.
    pub async fn request_connection(&self) -> Result<Account> {
        let provider = self.provider()?;
        let accounts = provider.request_accounts().await?;
        let account = accounts
            .first()
            .map(Account::new)
            .ok_or_else(|| SessionError::UserRejected("wallet returned no accounts".to_owned()))?;

        info!("connected {}", account);
        self.set_account(Some(account.clone()));
        Ok(account)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.provider.as_ref().map(|provider| provider.subscribe())
    }

    /// Applies an `accountsChanged` notification. An empty list means the
    /// wallet was locked or access was revoked.
    pub fn apply_accounts(&self, accounts: &[String]) -> Option<Account> {
        let account = accounts.first().map(Account::new);
        match &account {
            Some(account) => info!("wallet switched to {}", account),
            None => info!("wallet access revoked"),
        }
        self.set_account(account.clone());
        account
    }

    pub fn disconnect(&self) {
        self.set_account(None);
    }
}
