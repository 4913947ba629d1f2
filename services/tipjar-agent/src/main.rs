use std::sync::Arc;
use std::time::Duration;
use tj_api_types::{Record, SessionState, TransactionState};
use tj_provider::WalletProvider;
use tj_provider_rpc::RpcBridgeProvider;
use tj_session_core::{SessionConfig, SessionController, format_base_units};
use tokio::sync::watch;
use tracing::{info, warn};

const WALLET_POLL_INTERVAL: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SessionConfig::default();
    let bridge = Arc::new(RpcBridgeProvider::new(None));
    let poller = bridge.watch_wallet(WALLET_POLL_INTERVAL);
    let provider: Arc<dyn WalletProvider> = bridge;
    info!(
        "tipjar-agent starting for {} on {}",
        config.contract_address, config.profile.chain_name
    );

    let controller = SessionController::mount(Some(provider), config).await?;
    let decimals = controller.config().profile.native_currency.decimals;
    let symbol = controller.config().profile.native_currency.symbol.clone();

    if controller.snapshot().account.is_none() {
        if let Err(err) = controller.connect().await {
            warn!("wallet connection failed: {}", err);
        }
    }
    for record in &controller.snapshot().records {
        info!("{}", describe(record, decimals, &symbol));
    }

    let mut updates = controller.subscribe();
    let mut last = controller.snapshot();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = current_state(&mut updates);
                log_changes(&last, &current, decimals, &symbol);
                last = current;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    poller.abort();
    controller.unmount();
    Ok(())
}

fn current_state(updates: &mut watch::Receiver<SessionState>) -> SessionState {
    updates.borrow_and_update().clone()
}

fn log_changes(before: &SessionState, after: &SessionState, decimals: u8, symbol: &str) {
    if before.account != after.account {
        match &after.account {
            Some(account) => info!("account: {}", account),
            None => info!("account disconnected"),
        }
    }
    if before.chain_ok != after.chain_ok {
        if after.chain_ok {
            info!("wallet is on the required network");
        } else {
            warn!("wallet is on the wrong network");
        }
    }
    if before.pending_tx != after.pending_tx {
        match &after.pending_tx {
            Some(TransactionState::Submitted { hash }) => info!("transaction {} submitted", hash),
            Some(TransactionState::Confirmed { hash }) => info!("transaction {} confirmed", hash),
            Some(TransactionState::Failed { reason }) => warn!("transaction failed: {}", reason),
            Some(TransactionState::NotStarted) | None => {}
        }
    }
    if before.records != after.records {
        let known = before.records.len();
        info!("{} memos ({} new)", after.records.len(), after.records.len().saturating_sub(known));
        for record in after.records.iter().filter(|r| !before.records.contains(r)) {
            info!("{}", describe(record, decimals, symbol));
        }
    }
    if before.last_error != after.last_error {
        if let Some(error) = &after.last_error {
            warn!("{}", error);
        }
    }
}

fn describe(record: &Record, decimals: u8, symbol: &str) -> String {
    let name = record.display_name.as_deref().unwrap_or("anonymous");
    let tip = record
        .value
        .map(|value| format!(" [{} {}]", format_base_units(value, decimals), symbol))
        .unwrap_or_default();
    format!(
        "{} {} ({}): {}{}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        name,
        record.author,
        record.message,
        tip
    )
}
