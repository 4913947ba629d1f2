//! Wallet session, chain guard, contract gateway and memo synchronization for
//! the tip jar client.
//!
//! [`SessionController`] is the only type a renderer needs: it exposes
//! `connect`, `submit_record` and `refresh`, and publishes every change of the
//! [`tj_api_types::SessionState`] it owns.

pub mod amount;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod sync;
pub mod wallet;

pub use amount::{AmountError, format_base_units, parse_base_units};
pub use config::{DEFAULT_CONTRACT_ADDRESS, SessionConfig};
pub use controller::SessionController;
pub use error::{Result, SessionError};
pub use gateway::ContractGateway;
pub use guard::NetworkGuard;
pub use sync::{Normalized, RecordSynchronizer, SkippedRecord, normalize};
pub use wallet::WalletSession;
