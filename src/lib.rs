//! hourbridge - Community-currency ledger engine
//!
//! Turns currency, account and payment business operations into signed
//! transactions on an external asset/offer/path-payment ledger network,
//! and keeps the bridge offers enabling cross-currency exchange funded by
//! reacting to streamed trade events.

// Public modules
pub mod account;
pub mod core;
pub mod currency;
pub mod events;
pub mod gateway;
pub mod keys;
pub mod ledger;
pub mod tx;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use crate::core::{Error, ErrorKind, Result};
pub use crate::keys::{KeyPair, PublicKey};
pub use crate::ledger::{Ledger, LedgerOptions};
