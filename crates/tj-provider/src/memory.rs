use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tj_api_types::{Account, ChainId, ChainProfile, NumberLike, RawMemo, TxHash};
use tokio::sync::{Notify, RwLock, broadcast};
use tracing::debug;

use crate::{
    ContractCall, EXECUTION_ERROR, METHOD_NOT_FOUND, ProviderError, ProviderEvent, TxReceipt,
    USER_REJECTED, WalletProvider, UNRECOGNIZED_CHAIN, hex_lower,
};

/// EIP-1193: the requested account has not been authorized.
const UNAUTHORIZED: i64 = 4100;
const BLOCK_TIME_SECS: u64 = 12;

/// In-process wallet plus memo contract.
///
/// Each chain has its own contract log, so a call issued on the wrong chain reads
/// a different (usually empty) log, exactly like a real deployment. Every
/// provider method appends its JSON-RPC name to a journal that tests inspect.
pub struct InMemoryProvider {
    inner: RwLock<Inner>,
    events: broadcast::Sender<ProviderEvent>,
    receipts_released: Notify,
}

struct Inner {
    wallet_accounts: Vec<String>,
    authorized: Vec<String>,
    reject_connection: bool,
    active_chain: ChainId,
    known_chains: BTreeSet<ChainId>,
    reject_switch: Option<ProviderError>,
    reject_switch_after_add: Option<ProviderError>,
    reject_add: bool,
    fail_accounts: Option<ProviderError>,
    reject_signature: bool,
    revert_next: Option<String>,
    hold_receipts: bool,
    logs: HashMap<(ChainId, String), Vec<RawMemo>>,
    pending: HashMap<TxHash, PendingTx>,
    nonce: u64,
    block_number: u64,
    clock_secs: u64,
    journal: Vec<String>,
}

struct PendingTx {
    chain: ChainId,
    from: String,
    call: ContractCall,
    receipt: Option<TxReceipt>,
}

impl InMemoryProvider {
    pub fn new(active_chain: ChainId) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner {
                wallet_accounts: Vec::new(),
                authorized: Vec::new(),
                reject_connection: false,
                active_chain,
                known_chains: BTreeSet::from([active_chain]),
                reject_switch: None,
                reject_switch_after_add: None,
                reject_add: false,
                fail_accounts: None,
                reject_signature: false,
                revert_next: None,
                hold_receipts: false,
                logs: HashMap::new(),
                pending: HashMap::new(),
                nonce: 0,
                block_number: 1,
                clock_secs: 1_700_000_000,
                journal: Vec::new(),
            }),
            events,
            receipts_released: Notify::new(),
        }
    }

    /// An account the wallet holds but has not yet authorized.
    pub fn with_wallet_account(mut self, address: &str) -> Self {
        self.inner.get_mut().wallet_accounts.push(address.to_owned());
        self
    }

    /// An account that is already authorized for this origin.
    pub fn with_authorized_account(mut self, address: &str) -> Self {
        let inner = self.inner.get_mut();
        inner.wallet_accounts.push(address.to_owned());
        inner.authorized.push(address.to_owned());
        self
    }

    pub fn with_known_chain(mut self, chain_id: ChainId) -> Self {
        self.inner.get_mut().known_chains.insert(chain_id);
        self
    }

    pub fn with_memo(mut self, chain_id: ChainId, contract: &str, memo: RawMemo) -> Self {
        self.inner
            .get_mut()
            .logs
            .entry((chain_id, contract.to_ascii_lowercase()))
            .or_default()
            .push(memo);
        self
    }

    /// Receipts stay pending until [`InMemoryProvider::release_receipts`] is called.
    pub fn holding_receipts(mut self) -> Self {
        self.inner.get_mut().hold_receipts = true;
        self
    }

    pub fn rejecting_connection(mut self) -> Self {
        self.inner.get_mut().reject_connection = true;
        self
    }

    pub async fn reject_next_switch(&self, error: ProviderError) {
        self.inner.write().await.reject_switch = Some(error);
    }

    /// Arms a switch rejection that fires on the first switch after a
    /// successful `wallet_addEthereumChain`.
    pub async fn reject_switch_after_add(&self, error: ProviderError) {
        self.inner.write().await.reject_switch_after_add = Some(error);
    }

    /// The next `eth_accounts` fails with `error`, as with a dropped connection.
    pub async fn fail_next_accounts(&self, error: ProviderError) {
        self.inner.write().await.fail_accounts = Some(error);
    }

    pub async fn reject_add_chain(&self) {
        self.inner.write().await.reject_add = true;
    }

    pub async fn reject_next_signature(&self) {
        self.inner.write().await.reject_signature = true;
    }

    pub async fn revert_next(&self, reason: &str) {
        self.inner.write().await.revert_next = Some(reason.to_owned());
    }

    pub async fn release_receipts(&self) {
        self.inner.write().await.hold_receipts = false;
        self.receipts_released.notify_waiters();
    }

    /// Simulates the user picking another account inside the wallet.
    pub async fn switch_account(&self, address: &str) {
        {
            let mut inner = self.inner.write().await;
            if !inner.wallet_accounts.iter().any(|a| a == address) {
                inner.wallet_accounts.push(address.to_owned());
            }
            inner.authorized = vec![address.to_owned()];
        }
        let _ = self
            .events
            .send(ProviderEvent::AccountsChanged(vec![address.to_owned()]));
    }

    /// Simulates the user revoking access, or locking the wallet.
    pub async fn revoke_accounts(&self) {
        self.inner.write().await.authorized.clear();
        let _ = self.events.send(ProviderEvent::AccountsChanged(Vec::new()));
    }

    /// Simulates the user changing network from the wallet UI.
    pub async fn change_chain_externally(&self, chain_id: ChainId) {
        {
            let mut inner = self.inner.write().await;
            inner.known_chains.insert(chain_id);
            inner.active_chain = chain_id;
        }
        let _ = self.events.send(ProviderEvent::ChainChanged(chain_id));
    }

    pub async fn disconnect(&self) {
        self.inner.write().await.authorized.clear();
        let _ = self.events.send(ProviderEvent::Disconnected);
    }

    pub async fn active_chain(&self) -> ChainId {
        self.inner.read().await.active_chain
    }

    pub async fn memos(&self, chain_id: ChainId, contract: &str) -> Vec<RawMemo> {
        self.inner
            .read()
            .await
            .logs
            .get(&(chain_id, contract.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn journal(&self) -> Vec<String> {
        self.inner.read().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.inner.write().await.journal.clear();
    }
}

impl Inner {
    fn record(&mut self, method: &str) {
        self.journal.push(method.to_owned());
    }

    fn log(&self, chain_id: ChainId, contract: &str) -> &[RawMemo] {
        self.logs
            .get(&(chain_id, contract.to_ascii_lowercase()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn transaction_hash(&self, chain_id: ChainId, from: &str, call: &ContractCall) -> TxHash {
        let args = serde_json::to_string(&call.args).unwrap_or_default();
        let payload = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            chain_id,
            from,
            self.nonce,
            call.address.to_ascii_lowercase(),
            call.method,
            args,
            call.value.unwrap_or_default()
        );
        let digest = Sha256::digest(payload.as_bytes());
        TxHash(format!("0x{}", hex_lower(&digest)))
    }

    fn mine(&mut self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError> {
        let revert = self.revert_next.take();
        self.block_number += 1;
        self.clock_secs += BLOCK_TIME_SECS;
        let block_number = self.block_number;
        let timestamp = self.clock_secs;

        let pending = self
            .pending
            .get(hash)
            .ok_or_else(|| ProviderError::rpc(EXECUTION_ERROR, format!("unknown transaction {hash}")))?;
        let chain = pending.chain;
        let from = pending.from.clone();
        let call = pending.call.clone();

        let revert_reason = match revert {
            Some(reason) => Some(reason),
            None => apply_write(self, chain, &from, &call, timestamp).err(),
        };

        let receipt = TxReceipt {
            hash: hash.clone(),
            block_number,
            success: revert_reason.is_none(),
            confirmations: confirmations.max(1),
            revert_reason,
        };
        if let Some(pending) = self.pending.get_mut(hash) {
            pending.receipt = Some(receipt.clone());
        }
        debug!(
            "mined {} in block {} (success: {})",
            hash, block_number, receipt.success
        );
        Ok(receipt)
    }
}

fn apply_write(
    inner: &mut Inner,
    chain: ChainId,
    from: &str,
    call: &ContractCall,
    timestamp: u64,
) -> Result<(), String> {
    match call.method.as_str() {
        "buyCoffee" => {
            let name = call.args.first().and_then(|v| v.as_str()).unwrap_or_default();
            let message = call
                .args
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| "execution reverted: message argument missing".to_owned())?;
            inner
                .logs
                .entry((chain, call.address.to_ascii_lowercase()))
                .or_default()
                .push(RawMemo {
                    from: Some(from.to_owned()),
                    name: Some(name.to_owned()),
                    message: Some(message.to_owned()),
                    timestamp: Some(NumberLike::Int(timestamp)),
                    value: call.value.map(|v| NumberLike::Text(v.to_string())),
                });
            Ok(())
        }
        other => Err(format!("execution reverted: no method {other}")),
    }
}

#[async_trait]
impl WalletProvider for InMemoryProvider {
    async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
        let mut inner = self.inner.write().await;
        inner.record("eth_accounts");
        if let Some(err) = inner.fail_accounts.take() {
            return Err(err);
        }
        Ok(inner.authorized.clone())
    }

    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError> {
        let accounts = {
            let mut inner = self.inner.write().await;
            inner.record("eth_requestAccounts");
            if inner.reject_connection {
                inner.reject_connection = false;
                return Err(ProviderError::rpc(USER_REJECTED, "User rejected the request."));
            }
            if inner.wallet_accounts.is_empty() {
                return Err(ProviderError::rpc(USER_REJECTED, "wallet holds no accounts"));
            }
            if inner.authorized == inner.wallet_accounts {
                return Ok(inner.authorized.clone());
            }
            inner.authorized = inner.wallet_accounts.clone();
            inner.authorized.clone()
        };
        let _ = self.events.send(ProviderEvent::AccountsChanged(accounts.clone()));
        Ok(accounts)
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        let mut inner = self.inner.write().await;
        inner.record("eth_chainId");
        Ok(inner.active_chain)
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError> {
        {
            let mut inner = self.inner.write().await;
            inner.record("wallet_switchEthereumChain");
            if let Some(err) = inner.reject_switch.take() {
                return Err(err);
            }
            if !inner.known_chains.contains(&chain_id) {
                return Err(ProviderError::rpc(
                    UNRECOGNIZED_CHAIN,
                    format!("Unrecognized chain ID \"{chain_id}\"."),
                ));
            }
            if inner.active_chain == chain_id {
                return Ok(());
            }
            inner.active_chain = chain_id;
        }
        let _ = self.events.send(ProviderEvent::ChainChanged(chain_id));
        Ok(())
    }

    async fn add_chain(&self, profile: &ChainProfile) -> Result<(), ProviderError> {
        let mut inner = self.inner.write().await;
        inner.record("wallet_addEthereumChain");
        if inner.reject_add {
            return Err(ProviderError::rpc(USER_REJECTED, "User rejected adding the network."));
        }
        inner.known_chains.insert(profile.chain_id);
        if let Some(err) = inner.reject_switch_after_add.take() {
            inner.reject_switch = Some(err);
        }
        Ok(())
    }

    async fn call(&self, call: &ContractCall) -> Result<serde_json::Value, ProviderError> {
        let mut inner = self.inner.write().await;
        inner.record("eth_call");
        let log = inner.log(inner.active_chain, &call.address);
        match call.method.as_str() {
            "getMemos" => serde_json::to_value(log)
                .map_err(|err| ProviderError::Transport(err.to_string())),
            "getMemoCount" => Ok(serde_json::Value::from(log.len() as u64)),
            other => Err(ProviderError::rpc(
                METHOD_NOT_FOUND,
                format!("contract has no method {other}"),
            )),
        }
    }

    async fn send_transaction(&self, from: &Account, call: &ContractCall) -> Result<TxHash, ProviderError> {
        let mut inner = self.inner.write().await;
        inner.record("eth_sendTransaction");
        if inner.reject_signature {
            inner.reject_signature = false;
            return Err(ProviderError::rpc(
                USER_REJECTED,
                "MetaMask Tx Signature: User denied transaction signature.",
            ));
        }
        let signer = inner
            .authorized
            .iter()
            .find(|a| Account::new(a.as_str()) == *from)
            .cloned()
            .ok_or_else(|| {
                ProviderError::rpc(UNAUTHORIZED, format!("account {from} is not authorized"))
            })?;

        inner.nonce += 1;
        let chain = inner.active_chain;
        let hash = inner.transaction_hash(chain, &signer, call);
        inner.pending.insert(
            hash.clone(),
            PendingTx {
                chain,
                from: signer,
                call: call.clone(),
                receipt: None,
            },
        );
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError> {
        self.inner.write().await.record("eth_getTransactionReceipt");
        loop {
            let released = self.receipts_released.notified();
            if !self.inner.read().await.hold_receipts {
                break;
            }
            released.await;
        }

        let mut inner = self.inner.write().await;
        if let Some(receipt) = inner.pending.get(hash).and_then(|p| p.receipt.clone()) {
            return Ok(receipt);
        }
        inner.mine(hash, confirmations)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
