use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tj_api_types::{Account, TransactionState};
use tj_provider::{ContractCall, WalletProvider};
use tracing::{info, warn};

use crate::error::{Result, SessionError};

pub const GET_MEMOS: &str = "getMemos";
pub const GET_MEMO_COUNT: &str = "getMemoCount";
pub const BUY_COFFEE: &str = "buyCoffee";

/// Read and write access to the deployed memo contract.
///
/// Callers must run the network guard first; on another chain the same address
/// is a different contract, or nothing at all.
pub struct ContractGateway {
    provider: Arc<dyn WalletProvider>,
    address: String,
    confirmations: u64,
    in_flight: AtomicBool,
}

/// Held for the lifetime of one write; released on drop, including when the
/// caller drops the future before submission.
struct WriteSlot<'a>(&'a AtomicBool);

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ContractGateway {
    pub fn new(provider: Arc<dyn WalletProvider>, address: impl Into<String>, confirmations: u64) -> Self {
        Self {
            provider,
            address: address.into(),
            confirmations,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// True while a write has been accepted but has not reached a terminal state.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<WriteSlot<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| WriteSlot(&self.in_flight))
            .map_err(|_| SessionError::TransactionPending)
    }

    /// Read-only call. Safe to retry.
    pub async fn query(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let call = ContractCall::new(self.address.clone(), method).with_args(args);
        Ok(self.provider.call(&call).await?)
    }

    /// Submits a state-changing call and follows it to a terminal state.
    ///
    /// `observe` sees `NotStarted` as soon as the write slot is taken, `Submitted`
    /// once the node accepted the transaction, then `Confirmed` or `Failed`; a
    /// rejected submission goes straight from `NotStarted` to `Failed`.
    /// Only `Confirmed` means the contract state changed.
    ///
    /// Delivery is not exactly-once. Resubmitting after a `Failed` caused by a
    /// lost receipt can record the same memo twice on chain.
    ///
    /// Returns `Err` only when the call was refused before reaching the wallet.
    pub async fn invoke<F>(
        &self,
        from: &Account,
        method: &str,
        args: Vec<Value>,
        value: Option<u128>,
        mut observe: F,
    ) -> Result<TransactionState>
    where
        F: FnMut(&TransactionState) + Send,
    {
        let _slot = self.claim()?;
        observe(&TransactionState::NotStarted);
        let call = ContractCall::new(self.address.clone(), method)
            .with_args(args)
            .with_value(value);

        let hash = match self.provider.send_transaction(from, &call).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!("{} submission failed: {}", method, err);
                let failed = TransactionState::Failed {
                    reason: SessionError::SubmissionRejected(err.reason()).to_string(),
                };
                observe(&failed);
                return Ok(failed);
            }
        };

        info!("{} submitted as {}, waiting for confirmation", method, hash);
        observe(&TransactionState::Submitted { hash: hash.clone() });

        let terminal = match self.provider.wait_for_receipt(&hash, self.confirmations).await {
            Ok(receipt) if receipt.success => {
                info!("{} confirmed in block {}", hash, receipt.block_number);
                TransactionState::Confirmed { hash }
            }
            Ok(receipt) => {
                let reason = receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_owned());
                warn!("{} reverted: {}", hash, reason);
                TransactionState::Failed {
                    reason: SessionError::TransactionReverted(reason).to_string(),
                }
            }
            Err(err) => {
                warn!("lost track of {}: {}", hash, err);
                TransactionState::Failed { reason: err.reason() }
            }
        };
        observe(&terminal);
        Ok(terminal)
    }

    /// Every memo ever written, in contract log order.
    pub async fn fetch_memos(&self) -> Result<Vec<Value>> {
        match self.query(GET_MEMOS, Vec::new()).await? {
            Value::Array(entries) => Ok(entries),
            Value::Null => Ok(Vec::new()),
            other => Err(SessionError::MalformedResponse(format!(
                "{GET_MEMOS} returned {other}"
            ))),
        }
    }

    pub async fn memo_count(&self) -> Result<u64> {
        let value = self.query(GET_MEMO_COUNT, Vec::new()).await?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
            .ok_or_else(|| SessionError::MalformedResponse(format!("{GET_MEMO_COUNT} returned {value}")))
    }

    pub async fn buy_coffee<F>(
        &self,
        from: &Account,
        name: Option<&str>,
        message: &str,
        tip: Option<u128>,
        observe: F,
    ) -> Result<TransactionState>
    where
        F: FnMut(&TransactionState) + Send,
    {
        let args = vec![json!(name.unwrap_or_default()), json!(message)];
        self.invoke(from, BUY_COFFEE, args, tip, observe).await
    }
}
