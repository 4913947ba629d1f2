use std::sync::{Arc, Mutex, PoisonError};
use tj_api_types::{Account, Record, SessionState, TransactionState};
use tj_provider::{ProviderEvent, WalletProvider};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::amount::parse_base_units;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::gateway::ContractGateway;
use crate::guard::NetworkGuard;
use crate::sync::RecordSynchronizer;
use crate::wallet::WalletSession;

/// The session as seen by the rendering layer.
///
/// `mount` wires the provider subscription and restores an existing
/// authorization; `unmount` (or drop) stops listening. All state changes are
/// published through [`SessionController::subscribe`].
pub struct SessionController {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: SessionConfig,
    wallet: WalletSession,
    chain: Option<ChainServices>,
    state: watch::Sender<SessionState>,
}

struct ChainServices {
    guard: NetworkGuard,
    gateway: Arc<ContractGateway>,
    sync: RecordSynchronizer,
}

impl SessionController {
    pub async fn mount(provider: Option<Arc<dyn WalletProvider>>, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let chain = provider.as_ref().map(|provider| {
            let gateway = Arc::new(ContractGateway::new(
                provider.clone(),
                config.contract_address.clone(),
                config.confirmations,
            ));
            ChainServices {
                guard: NetworkGuard::new(provider.clone()),
                sync: RecordSynchronizer::new(gateway.clone()),
                gateway,
            }
        });
        let (state, _) = watch::channel(SessionState::default());
        let shared = Arc::new(Shared {
            config,
            wallet: WalletSession::new(provider),
            chain,
            state,
        });

        let listener = shared
            .wallet
            .subscribe()
            .map(|events| tokio::spawn(listen(shared.clone(), events)));
        let controller = Self {
            shared,
            listener: Mutex::new(listener),
        };
        controller.restore().await;
        Ok(controller)
    }

    async fn restore(&self) {
        let shared = &self.shared;
        let Some(chain) = &shared.chain else {
            shared.report(&SessionError::ProviderMissing);
            return;
        };

        match chain.guard.is_active(&shared.config.profile).await {
            Ok(chain_ok) => shared.state.send_modify(|s| s.chain_ok = chain_ok),
            Err(err) => warn!("could not read active chain: {}", err),
        }

        let account = match shared.wallet.discover().await {
            Ok(Some(account)) => account,
            Ok(None) => return,
            Err(err) => {
                warn!("could not look up authorized accounts: {}", err);
                return;
            }
        };
        shared.state.send_modify(|s| s.account = Some(account));
        if let Err(err) = self.refresh().await {
            warn!("initial refresh failed: {}", err);
        }
    }

    /// Stops listening to provider events. The snapshot stays readable.
    pub fn unmount(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("session unmounted");
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// User-initiated connection: authorize, move to the required chain, load memos.
    pub async fn connect(&self) -> Result<Account> {
        let account = match self.shared.wallet.request_connection().await {
            Ok(account) => account,
            Err(err) => return Err(self.shared.report(&err)),
        };
        self.shared.state.send_modify(|s| {
            s.account = Some(account.clone());
            s.last_error = None;
        });
        self.refresh().await?;
        Ok(account)
    }

    /// Re-reads the whole memo log and replaces the displayed list.
    pub async fn refresh(&self) -> Result<Vec<Record>> {
        let chain = self.shared.services()?;
        self.shared.ensure_chain(chain).await?;

        let records = match chain.sync.refresh().await {
            Ok(records) => records,
            Err(err) => return Err(self.shared.report(&err)),
        };
        self.shared.state.send_modify(|s| {
            s.records = records.clone();
            s.last_error = None;
        });
        Ok(records)
    }

    /// Sends a memo with an optional tip, then reloads the list once confirmed.
    ///
    /// Input is validated before anything reaches the wallet. A `Failed`
    /// outcome is returned as `Ok`; the session stays usable.
    pub async fn submit_record(
        &self,
        name: Option<&str>,
        message: &str,
        tip: Option<&str>,
    ) -> Result<TransactionState> {
        let shared = &self.shared;
        let message = message.trim();
        if message.is_empty() {
            return Err(shared.report(&SessionError::MalformedInput(
                "message is required".to_owned(),
            )));
        }
        let name = name.map(str::trim).filter(|name| !name.is_empty());
        let decimals = shared.config.profile.native_currency.decimals;
        let tip = match tip.map(str::trim).filter(|tip| !tip.is_empty()) {
            Some(tip) => match parse_base_units(tip, decimals) {
                Ok(units) => Some(units),
                Err(err) => return Err(shared.report(&SessionError::from(err))),
            },
            None => None,
        };

        let chain = shared.services()?;
        let account = shared.wallet.account().ok_or(SessionError::NotConnected)?;
        if chain.gateway.is_busy() {
            return Err(SessionError::TransactionPending);
        }
        shared.ensure_chain(chain).await?;

        let state = &shared.state;
        let terminal = chain
            .gateway
            .buy_coffee(&account, name, message, tip, |tx| {
                state.send_modify(|s| s.pending_tx = Some(tx.clone()));
            })
            .await?;

        match &terminal {
            TransactionState::Confirmed { .. } => {
                if let Err(err) = self.refresh().await {
                    warn!("refresh after confirmed write failed: {}", err);
                }
            }
            TransactionState::Failed { reason } => {
                let reason = reason.clone();
                state.send_modify(|s| s.last_error = Some(reason));
            }
            TransactionState::NotStarted | TransactionState::Submitted { .. } => {}
        }
        Ok(terminal)
    }

    /// Drops a finished transaction from the snapshot once it has been shown.
    /// Returns false if there is nothing to clear or the write is still running.
    pub fn acknowledge_transaction(&self) -> bool {
        let mut cleared = false;
        self.shared.state.send_if_modified(|s| {
            if s.pending_tx.as_ref().is_some_and(TransactionState::is_terminal) {
                s.pending_tx = None;
                cleared = true;
            }
            cleared
        });
        cleared
    }

    /// Number of memos on chain. Informational.
    pub async fn memo_count(&self) -> Result<u64> {
        let chain = self.shared.services()?;
        self.shared.ensure_chain(chain).await?;
        chain.gateway.memo_count().await
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl Shared {
    fn services(&self) -> Result<&ChainServices> {
        self.chain
            .as_ref()
            .ok_or_else(|| self.report(&SessionError::ProviderMissing))
    }

    async fn ensure_chain(&self, chain: &ChainServices) -> Result<()> {
        match chain.guard.ensure(&self.config.profile).await {
            Ok(()) => {
                self.state.send_modify(|s| s.chain_ok = true);
                Ok(())
            }
            Err(err) => {
                self.state.send_modify(|s| s.chain_ok = false);
                Err(self.report(&err))
            }
        }
    }

    /// Publishes a user-visible failure and hands it back for `Err(...)`.
    fn report(&self, err: &SessionError) -> SessionError {
        warn!("{}", err);
        let message = err.to_string();
        self.state.send_modify(|s| s.last_error = Some(message));
        err.clone()
    }

    fn apply_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::AccountsChanged(accounts) => {
                let account = self.wallet.apply_accounts(&accounts);
                self.state.send_modify(|s| s.account = account);
            }
            ProviderEvent::ChainChanged(chain_id) => {
                let chain_ok = chain_id == self.config.profile.chain_id;
                if !chain_ok {
                    warn!("wallet moved to {}, expected {}", chain_id, self.config.profile.chain_id);
                }
                self.state.send_modify(|s| s.chain_ok = chain_ok);
            }
            ProviderEvent::Disconnected => {
                info!("wallet disconnected");
                self.wallet.disconnect();
                self.state.send_modify(|s| {
                    s.account = None;
                    s.chain_ok = false;
                });
            }
        }
    }

    /// Catches up after missed events by asking the wallet directly.
    async fn resync(&self) {
        match self.wallet.discover().await {
            Ok(account) => self.state.send_modify(|s| s.account = account),
            Err(err) => warn!("resync kept the current account: {}", err),
        }
        if let Some(chain) = &self.chain {
            if let Ok(chain_ok) = chain.guard.is_active(&self.config.profile).await {
                self.state.send_modify(|s| s.chain_ok = chain_ok);
            }
        }
    }
}

async fn listen(shared: Arc<Shared>, mut events: broadcast::Receiver<ProviderEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => shared.apply_event(event),
            Err(RecvError::Lagged(missed)) => {
                warn!("missed {} wallet events, resyncing", missed);
                shared.resync().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}
