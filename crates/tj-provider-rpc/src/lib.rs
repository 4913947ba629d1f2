use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tj_api_types::{Account, ChainId, ChainProfile, TxHash};
use tj_provider::{ContractCall, ProviderError, ProviderEvent, TxReceipt, WalletProvider};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_BRIDGE_URL: &str = "http://localhost:8545";

/// JSON-RPC client for a local signer bridge.
///
/// Wallet methods use the EIP-1193 names. Contract calls go through the bridge's
/// ABI-aware `tipjar_call` / `tipjar_send` methods, which take a [`ContractCall`]
/// object and do the encoding on the bridge side.
///
/// Reads `TIPJAR_BRIDGE_URL` from environment at construction time
/// (default: `http://localhost:8545`).
///
/// The bridge has no push channel. `ChainChanged` and `AccountsChanged` are
/// emitted only when a response differs from the last one seen, so a change made
/// in the wallet surfaces on the next request. Consumers that may sit idle run
/// [`RpcBridgeProvider::watch_wallet`] to keep asking.
pub struct RpcBridgeProvider {
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    events: broadcast::Sender<ProviderEvent>,
    observed: Mutex<Observed>,
    pub receipt_poll_interval: Duration,
    pub receipt_poll_attempts: u32,
}

#[derive(Default)]
struct Observed {
    chain: Option<ChainId>,
    accounts: Option<Vec<String>>,
}

impl Default for RpcBridgeProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RpcBridgeProvider {
    pub fn new(endpoint: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("TIPJAR_BRIDGE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_string());
        let (events, _) = broadcast::channel(64);
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            events,
            observed: Mutex::new(Observed::default()),
            receipt_poll_interval: Duration::from_secs(2),
            receipt_poll_attempts: 150,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(format!("{method}: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(format!("{method}: reading body: {err}")))?;
        if !status.is_success() && text.is_empty() {
            return Err(ProviderError::Transport(format!("{method}: HTTP {status}")));
        }

        decode_response(method, &text)
    }

    fn observe_chain(&self, chain: ChainId) {
        let changed = match self.observed.lock() {
            Ok(mut observed) => {
                let changed = observed.chain.is_some_and(|previous| previous != chain);
                observed.chain = Some(chain);
                changed
            }
            Err(_) => false,
        };
        if changed {
            debug!("bridge reports chain change to {}", chain);
            let _ = self.events.send(ProviderEvent::ChainChanged(chain));
        }
    }

    fn observe_accounts(&self, accounts: &[String]) {
        let changed = match self.observed.lock() {
            Ok(mut observed) => {
                let changed = observed
                    .accounts
                    .as_ref()
                    .is_some_and(|previous| previous.as_slice() != accounts);
                observed.accounts = Some(accounts.to_vec());
                changed
            }
            Err(_) => false,
        };
        if changed {
            debug!("bridge reports account change");
            let _ = self
                .events
                .send(ProviderEvent::AccountsChanged(accounts.to_vec()));
        }
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }

    /// Polls accounts and chain id every `every` so wallet-side changes reach
    /// subscribers without a request of their own. Stops once the provider is
    /// dropped.
    pub fn watch_wallet(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let provider = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                if let Err(err) = provider.accounts().await {
                    debug!("wallet poll: {}", err);
                }
                if let Err(err) = provider.chain_id().await {
                    debug!("wallet poll: {}", err);
                }
            }
        })
    }

    /// One receipt lookup. `None` while the transaction is unmined or still
    /// short of `wanted` confirmations.
    async fn poll_receipt(&self, hash: &TxHash, wanted: u64) -> Result<Option<TxReceipt>, ProviderError> {
        let value = self
            .request("eth_getTransactionReceipt", json!([hash.0]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let current = self.block_number().await?;
        let receipt = parse_receipt(&value, current)?;
        Ok((!receipt.success || receipt.confirmations >= wanted).then_some(receipt))
    }
}

// ── JSON-RPC wire types ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptObject {
    transaction_hash: String,
    block_number: String,
    status: String,
    #[serde(default)]
    revert_reason: Option<String>,
}

fn decode_response(method: &str, text: &str) -> Result<Value, ProviderError> {
    let response: RpcResponse = serde_json::from_str(text)
        .map_err(|err| ProviderError::Transport(format!("{method}: malformed response: {err}")))?;

    if let Some(error) = response.error {
        // Nodes put the revert string in `data` when they have one.
        let message = match error.data.as_ref().and_then(Value::as_str) {
            Some(detail) if !detail.is_empty() => format!("{}: {}", error.message, detail),
            _ => error.message,
        };
        return Err(ProviderError::rpc(error.code, message));
    }

    Ok(response.result.unwrap_or(Value::Null))
}

fn parse_quantity(value: &Value) -> Result<u64, ProviderError> {
    let text = value
        .as_str()
        .ok_or_else(|| ProviderError::Transport(format!("expected hex quantity, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|err| ProviderError::Transport(format!("bad hex quantity {text}: {err}")))
}

fn parse_accounts(value: Value) -> Result<Vec<String>, ProviderError> {
    serde_json::from_value(value)
        .map_err(|err| ProviderError::Transport(format!("bad account list: {err}")))
}

fn parse_receipt(value: &Value, current_block: u64) -> Result<TxReceipt, ProviderError> {
    let receipt: ReceiptObject = serde_json::from_value(value.clone())
        .map_err(|err| ProviderError::Transport(format!("bad receipt: {err}")))?;
    let block_number = parse_quantity(&Value::String(receipt.block_number))?;
    let success = parse_quantity(&Value::String(receipt.status))? == 1;
    Ok(TxReceipt {
        hash: TxHash(receipt.transaction_hash),
        block_number,
        success,
        confirmations: current_block.saturating_sub(block_number) + 1,
        revert_reason: if success { None } else { receipt.revert_reason },
    })
}

#[async_trait]
impl WalletProvider for RpcBridgeProvider {
    async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
        let accounts = parse_accounts(self.request("eth_accounts", json!([])).await?)?;
        self.observe_accounts(&accounts);
        Ok(accounts)
    }

    async fn request_accounts(&self) -> Result<Vec<String>, ProviderError> {
        let accounts = parse_accounts(self.request("eth_requestAccounts", json!([])).await?)?;
        self.observe_accounts(&accounts);
        Ok(accounts)
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        let value = self.request("eth_chainId", json!([])).await?;
        let chain = value
            .as_str()
            .ok_or_else(|| ProviderError::Transport(format!("bad chain id {value}")))
            .and_then(|text| ChainId::parse_hex(text).map_err(ProviderError::Transport))?;
        self.observe_chain(chain);
        Ok(chain)
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError> {
        self.request(
            "wallet_switchEthereumChain",
            json!([{ "chainId": chain_id.to_hex() }]),
        )
        .await?;
        self.observe_chain(chain_id);
        Ok(())
    }

    async fn add_chain(&self, profile: &ChainProfile) -> Result<(), ProviderError> {
        let params = serde_json::to_value(profile)
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        self.request("wallet_addEthereumChain", json!([params])).await?;
        Ok(())
    }

    async fn call(&self, call: &ContractCall) -> Result<Value, ProviderError> {
        let params = serde_json::to_value(call)
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        self.request("tipjar_call", json!([params])).await
    }

    async fn send_transaction(&self, from: &Account, call: &ContractCall) -> Result<TxHash, ProviderError> {
        let mut params = serde_json::to_value(call)
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        params["from"] = Value::String(from.to_string());
        let value = self.request("tipjar_send", json!([params])).await?;
        value
            .as_str()
            .map(|hash| TxHash(hash.to_owned()))
            .ok_or_else(|| ProviderError::Transport(format!("bad transaction hash {value}")))
    }

    async fn wait_for_receipt(&self, hash: &TxHash, confirmations: u64) -> Result<TxReceipt, ProviderError> {
        let wanted = confirmations.max(1);
        for attempt in 0..self.receipt_poll_attempts {
            match self.poll_receipt(hash, wanted).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                // The transaction may still land; only the attempt is lost.
                Err(ProviderError::Transport(reason)) => {
                    warn!("receipt poll {} for {} failed: {}", attempt + 1, hash, reason);
                }
                Err(err) => return Err(err),
            }
            if attempt > 0 && attempt % 30 == 0 {
                warn!("still waiting for receipt of {} after {} polls", hash, attempt);
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
        Err(ProviderError::Transport(format!(
            "no receipt for {hash} after {} polls",
            self.receipt_poll_attempts
        )))
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
