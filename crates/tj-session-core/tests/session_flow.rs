use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tj_api_types::{
    Account, ChainId, ChainProfile, NumberLike, RawMemo, SessionState, TransactionState, TxHash,
};
use tj_provider::{ContractCall, InMemoryProvider, ProviderError, ProviderEvent, TxReceipt, WalletProvider};
use tj_session_core::{DEFAULT_CONTRACT_ADDRESS, SessionConfig, SessionController, SessionError};
use tokio::sync::{broadcast, watch};

const GOERLI: ChainId = ChainId(5);
const MAINNET: ChainId = ChainId(1);
const ALICE: &str = "0xABC0000000000000000000000000000000000001";
const BOB: &str = "0xb0b0000000000000000000000000000000000002";

fn memo(from: &str, name: &str, message: &str, timestamp: u64) -> RawMemo {
    RawMemo {
        from: Some(from.to_owned()),
        name: Some(name.to_owned()),
        message: Some(message.to_owned()),
        timestamp: Some(NumberLike::Int(timestamp)),
        value: None,
    }
}

fn seeded(provider: InMemoryProvider) -> InMemoryProvider {
    provider
        .with_memo(GOERLI, DEFAULT_CONTRACT_ADDRESS, memo(BOB, "bob", "first!", 1_600_000_000))
        .with_memo(GOERLI, DEFAULT_CONTRACT_ADDRESS, memo(BOB, "", "anon", 1_650_000_000))
}

fn messages(state: &SessionState) -> Vec<&str> {
    state.records.iter().map(|r| r.message.as_str()).collect()
}

async fn wait_until(
    rx: &mut watch::Receiver<SessionState>,
    check: impl FnMut(&SessionState) -> bool,
) -> anyhow::Result<SessionState> {
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(check)).await??;
    Ok(state.clone())
}

#[tokio::test]
async fn connect_from_scratch_then_load_records() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(GOERLI).with_wallet_account(ALICE)));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;

    let state = controller.snapshot();
    assert_eq!(state.account, None);
    assert!(state.chain_ok);
    assert!(state.records.is_empty());
    assert!(!provider.journal().await.iter().any(|m| m == "eth_requestAccounts"));

    let account = controller.connect().await?;
    assert_eq!(account.as_str(), "0xabc0000000000000000000000000000000000001");

    let state = controller.snapshot();
    assert_eq!(state.account, Some(account));
    assert_eq!(messages(&state), vec!["anon", "first!"]);
    assert_eq!(state.records[0].display_name, None);
    assert_eq!(state.records[1].timestamp.timestamp(), 1_600_000_000);
    assert_eq!(state.last_error, None);
    Ok(())
}

#[tokio::test]
async fn existing_authorization_is_restored_on_mount() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE)));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;

    let state = controller.snapshot();
    assert_eq!(state.account, Some(Account::new(ALICE)));
    assert_eq!(state.records.len(), 2);
    assert!(!provider.journal().await.iter().any(|m| m == "eth_requestAccounts"));
    Ok(())
}

#[tokio::test]
async fn mount_on_an_unknown_chain_adds_it_before_reading() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(MAINNET).with_authorized_account(ALICE)));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;

    assert_eq!(provider.active_chain().await, GOERLI);
    let state = controller.snapshot();
    assert!(state.chain_ok);
    assert_eq!(state.records.len(), 2);

    let journal = provider.journal().await;
    let add = journal.iter().position(|m| m == "wallet_addEthereumChain");
    let read = journal.iter().position(|m| m == "eth_call");
    assert!(add.is_some() && read.is_some() && add < read);
    Ok(())
}

#[tokio::test]
async fn confirmed_write_refreshes_the_list() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE)));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    provider.clear_journal().await;

    let terminal = controller
        .submit_record(Some(" alice "), "thanks for the coffee", Some("0.001"))
        .await?;
    let TransactionState::Confirmed { hash } = &terminal else {
        panic!("expected confirmation, got {terminal:?}");
    };

    let journal = provider.journal().await;
    let receipt = journal.iter().position(|m| m == "eth_getTransactionReceipt");
    let reread = journal.iter().rposition(|m| m == "eth_call");
    assert!(receipt.is_some() && reread > receipt);

    let state = controller.snapshot();
    assert_eq!(state.pending_tx, Some(TransactionState::Confirmed { hash: hash.clone() }));
    assert_eq!(messages(&state)[0], "thanks for the coffee");
    assert_eq!(state.records[0].display_name.as_deref(), Some("alice"));
    assert_eq!(state.records[0].value, Some(1_000_000_000_000_000));
    assert_eq!(state.records[0].author, Account::new(ALICE));

    assert!(controller.acknowledge_transaction());
    assert_eq!(controller.snapshot().pending_tx, None);
    assert!(!controller.acknowledge_transaction());
    Ok(())
}

#[tokio::test]
async fn bad_input_never_reaches_the_wallet() -> anyhow::Result<()> {
    let provider = Arc::new(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    provider.clear_journal().await;

    let negative = controller.submit_record(None, "hi", Some("-1")).await;
    assert!(matches!(negative, Err(SessionError::MalformedInput(_))));

    let garbage = controller.submit_record(None, "hi", Some("one")).await;
    assert!(matches!(garbage, Err(SessionError::MalformedInput(_))));

    let empty = controller.submit_record(Some("x"), "   ", None).await;
    assert!(matches!(empty, Err(SessionError::MalformedInput(_))));

    assert!(provider.journal().await.is_empty());
    assert!(controller.snapshot().last_error.is_some());
    assert_eq!(controller.snapshot().pending_tx, None);
    Ok(())
}

#[tokio::test]
async fn writing_requires_a_connected_account() -> anyhow::Result<()> {
    let provider = Arc::new(InMemoryProvider::new(GOERLI).with_wallet_account(ALICE));
    let controller = SessionController::mount(Some(provider), SessionConfig::default()).await?;

    let result = controller.submit_record(None, "hello", None).await;
    assert_eq!(result, Err(SessionError::NotConnected));
    Ok(())
}

#[tokio::test]
async fn missing_provider_is_recoverable() -> anyhow::Result<()> {
    let controller = SessionController::mount(None, SessionConfig::default()).await?;

    let state = controller.snapshot();
    assert_eq!(state.account, None);
    assert!(!state.chain_ok);
    assert!(state.last_error.is_some_and(|e| e.contains("provider")));

    assert_eq!(controller.connect().await, Err(SessionError::ProviderMissing));
    assert_eq!(controller.refresh().await, Err(SessionError::ProviderMissing));
    Ok(())
}

#[tokio::test]
async fn rejected_connection_leaves_session_disconnected() -> anyhow::Result<()> {
    let provider = Arc::new(
        InMemoryProvider::new(GOERLI)
            .with_wallet_account(ALICE)
            .rejecting_connection(),
    );
    let controller = SessionController::mount(Some(provider), SessionConfig::default()).await?;

    assert!(matches!(controller.connect().await, Err(SessionError::UserRejected(_))));
    let state = controller.snapshot();
    assert_eq!(state.account, None);
    assert!(state.last_error.is_some());

    // A second click goes through.
    assert!(controller.connect().await.is_ok());
    Ok(())
}

#[tokio::test]
async fn reverted_write_is_reported_and_list_untouched() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE)));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    provider.revert_next("can't buy coffee for free!").await;

    let terminal = controller.submit_record(None, "free coffee?", None).await?;
    assert!(matches!(terminal, TransactionState::Failed { .. }));

    let state = controller.snapshot();
    assert_eq!(state.pending_tx, Some(terminal));
    assert!(state.last_error.is_some_and(|e| e.contains("can't buy coffee for free!")));
    assert_eq!(state.records.len(), 2);

    // The session is still usable.
    let retry = controller.submit_record(None, "paid coffee", Some("0.01")).await?;
    assert!(matches!(retry, TransactionState::Confirmed { .. }));
    assert_eq!(controller.snapshot().records.len(), 3);
    Ok(())
}

#[tokio::test]
async fn second_write_is_refused_while_first_is_pending() -> anyhow::Result<()> {
    let provider = Arc::new(
        InMemoryProvider::new(GOERLI)
            .with_authorized_account(ALICE)
            .holding_receipts(),
    );
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let mut rx = controller.subscribe();

    let first = controller.submit_record(None, "first", None);
    let second = async {
        let state = wait_until(&mut rx, |s| s.has_pending_write()).await?;
        let refused = controller.submit_record(None, "second", None).await;
        let still_pending = controller.snapshot().pending_tx;
        provider.release_receipts().await;
        anyhow::Ok((state, refused, still_pending))
    };

    let (first, second) = tokio::join!(first, second);
    let (during, refused, still_pending) = second?;
    assert!(matches!(during.pending_tx, Some(TransactionState::Submitted { .. })));
    assert_eq!(refused, Err(SessionError::TransactionPending));
    assert_eq!(still_pending, during.pending_tx);
    assert!(matches!(first?, TransactionState::Confirmed { .. }));
    assert_eq!(controller.snapshot().records.len(), 1);
    Ok(())
}

#[tokio::test]
async fn wallet_events_update_the_session() -> anyhow::Result<()> {
    let provider = Arc::new(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let mut rx = controller.subscribe();

    provider.switch_account(BOB).await;
    let state = wait_until(&mut rx, |s| s.account == Some(Account::new(BOB))).await?;
    assert!(state.chain_ok);

    provider.change_chain_externally(MAINNET).await;
    wait_until(&mut rx, |s| !s.chain_ok).await?;

    // The next action puts the wallet back on the required chain.
    controller.refresh().await?;
    assert!(controller.snapshot().chain_ok);
    assert_eq!(provider.active_chain().await, GOERLI);

    provider.revoke_accounts().await;
    wait_until(&mut rx, |s| s.account.is_none()).await?;
    Ok(())
}

#[tokio::test]
async fn unmount_stops_listening() -> anyhow::Result<()> {
    let provider = Arc::new(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    controller.unmount();

    provider.switch_account(BOB).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.snapshot().account, Some(Account::new(ALICE)));
    Ok(())
}

#[tokio::test]
async fn refresh_is_idempotent() -> anyhow::Result<()> {
    let provider = Arc::new(seeded(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE)));
    let controller = SessionController::mount(Some(provider), SessionConfig::default()).await?;

    let first = controller.refresh().await?;
    let second = controller.refresh().await?;
    assert_eq!(first, second);
    assert_eq!(controller.memo_count().await?, 2);
    Ok(())
}

/// Wallet with a fixed transaction hash, recording what the session published
/// while the receipt was outstanding.
struct ScriptedProvider {
    memos: Mutex<Vec<Value>>,
    journal: Mutex<Vec<&'static str>>,
    session: OnceLock<watch::Receiver<SessionState>>,
    seen_while_signing: Mutex<Vec<(bool, Option<TransactionState>)>>,
    seen_while_waiting: Mutex<Option<TransactionState>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl ScriptedProvider {
    fn new() -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            memos: Mutex::new(vec![json!({
                "from": BOB, "name": "bob", "message": "earlier", "timestamp": 1_700_000_000_u64
            })]),
            journal: Mutex::new(Vec::new()),
            session: OnceLock::new(),
            seen_while_signing: Mutex::new(Vec::new()),
            seen_while_waiting: Mutex::new(None),
            events,
        }
    }

    fn log(&self, entry: &'static str) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl WalletProvider for ScriptedProvider {
    async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![ALICE.to_owned()])
    }

    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![ALICE.to_owned()])
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        Ok(GOERLI)
    }

    async fn switch_chain(&self, _chain_id: ChainId) -> Result<(), ProviderError> {
        self.log("switch");
        Ok(())
    }

    async fn add_chain(&self, _profile: &ChainProfile) -> Result<(), ProviderError> {
        self.log("add");
        Ok(())
    }

    async fn call(&self, _call: &ContractCall) -> Result<Value, ProviderError> {
        self.log("call");
        Ok(Value::Array(self.memos.lock().unwrap().clone()))
    }

    async fn send_transaction(&self, _from: &Account, call: &ContractCall) -> Result<TxHash, ProviderError> {
        self.log("send");
        assert_eq!(call.value, Some(1_000_000_000_000_000));
        if let Some(session) = self.session.get() {
            let state = session.borrow().clone();
            self.seen_while_signing
                .lock()
                .unwrap()
                .push((state.has_pending_write(), state.pending_tx));
        }
        Ok(TxHash("0xdeadbeef".to_owned()))
    }

    async fn wait_for_receipt(&self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError> {
        self.log("receipt");
        if let Some(session) = self.session.get() {
            *self.seen_while_waiting.lock().unwrap() = session.borrow().pending_tx.clone();
        }
        self.memos.lock().unwrap().push(json!({
            "from": ALICE, "name": "alice", "message": "latest", "timestamp": 1_700_000_060_u64,
            "value": "1000000000000000"
        }));
        Ok(TxReceipt {
            hash: hash.clone(),
            block_number: 42,
            success: true,
            confirmations,
            revert_reason: None,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

#[tokio::test]
async fn submitted_then_confirmed_then_refreshed() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let _ = provider.session.set(controller.subscribe());
    provider.journal.lock().unwrap().clear();

    let terminal = controller.submit_record(Some("alice"), "latest", Some("0.001")).await?;

    let hash = TxHash("0xdeadbeef".to_owned());
    assert_eq!(terminal, TransactionState::Confirmed { hash: hash.clone() });
    assert_eq!(
        *provider.seen_while_waiting.lock().unwrap(),
        Some(TransactionState::Submitted { hash: hash.clone() })
    );
    assert_eq!(*provider.journal.lock().unwrap(), vec!["send", "receipt", "call"]);

    let state = controller.snapshot();
    assert_eq!(state.pending_tx, Some(TransactionState::Confirmed { hash }));
    assert_eq!(messages(&state), vec!["latest", "earlier"]);
    Ok(())
}

#[tokio::test]
async fn write_is_visible_while_waiting_for_signature() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let _ = provider.session.set(controller.subscribe());

    controller.submit_record(None, "one", Some("0.001")).await?;
    controller.submit_record(None, "two", Some("0.001")).await?;

    let seen = provider.seen_while_signing.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (true, Some(TransactionState::NotStarted)),
            (true, Some(TransactionState::NotStarted)),
        ]
    );
    Ok(())
}

/// Forwards to an [`InMemoryProvider`] but delivers events through a channel
/// the test fills directly, so the listener can be made to fall behind.
struct LossyEvents {
    inner: Arc<InMemoryProvider>,
    events: broadcast::Sender<ProviderEvent>,
}

impl LossyEvents {
    fn new(inner: Arc<InMemoryProvider>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self { inner, events }
    }
}

#[async_trait]
impl WalletProvider for LossyEvents {
    async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.accounts().await
    }

    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.request_accounts().await
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        self.inner.chain_id().await
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError> {
        self.inner.switch_chain(chain_id).await
    }

    async fn add_chain(&self, profile: &ChainProfile) -> Result<(), ProviderError> {
        self.inner.add_chain(profile).await
    }

    async fn call(&self, call: &ContractCall) -> Result<Value, ProviderError> {
        self.inner.call(call).await
    }

    async fn send_transaction(&self, from: &Account, call: &ContractCall) -> Result<TxHash, ProviderError> {
        self.inner.send_transaction(from, call).await
    }

    async fn wait_for_receipt(&self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError> {
        self.inner.wait_for_receipt(hash, confirmations).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

#[tokio::test]
async fn missed_events_are_recovered_by_asking_the_wallet() -> anyhow::Result<()> {
    let inner = Arc::new(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE));
    let provider = Arc::new(LossyEvents::new(inner.clone()));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let mut rx = controller.subscribe();
    assert_eq!(controller.snapshot().account, Some(Account::new(ALICE)));

    // The wallet moved to Bob; the listener only gets the tail of the stream.
    inner.switch_account(BOB).await;
    inner.clear_journal().await;
    provider.events.send(ProviderEvent::AccountsChanged(Vec::new()))?;
    provider.events.send(ProviderEvent::AccountsChanged(Vec::new()))?;
    provider.events.send(ProviderEvent::ChainChanged(GOERLI))?;

    let state = wait_until(&mut rx, |s| s.account == Some(Account::new(BOB))).await?;
    assert!(state.chain_ok);
    assert!(inner.journal().await.iter().any(|m| m == "eth_accounts"));
    Ok(())
}

#[tokio::test]
async fn resync_failure_keeps_the_session() -> anyhow::Result<()> {
    let inner = Arc::new(InMemoryProvider::new(GOERLI).with_authorized_account(ALICE));
    let provider = Arc::new(LossyEvents::new(inner.clone()));
    let controller = SessionController::mount(Some(provider.clone()), SessionConfig::default()).await?;
    let mut rx = controller.subscribe();

    inner
        .fail_next_accounts(ProviderError::Transport("connection reset".to_owned()))
        .await;
    provider.events.send(ProviderEvent::AccountsChanged(Vec::new()))?;
    provider.events.send(ProviderEvent::AccountsChanged(Vec::new()))?;
    provider.events.send(ProviderEvent::ChainChanged(MAINNET))?;

    // The chain event is applied after the resync finished.
    let state = wait_until(&mut rx, |s| !s.chain_ok).await?;
    assert_eq!(state.account, Some(Account::new(ALICE)));
    Ok(())
}
