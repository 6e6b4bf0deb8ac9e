//! Interface to the external ledger network.
//!
//! The engine consumes the network through the [`Gateway`] trait so the
//! orchestration logic stays independent of the transport. [`HttpGateway`]
//! is the production implementation against the network's public REST API.

pub mod client;
pub mod model;

pub use client::{GatewayOptions, HttpGateway};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rust_decimal::Decimal;

use crate::core::{Asset, Rate, Result};
use crate::keys::PublicKey;
use crate::tx::Transaction;

/// One asset balance held by an account.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRecord {
    pub asset: Asset,
    pub balance: Decimal,
    /// Trustline limit; the network reports a maximum value instead of
    /// "unlimited".
    pub limit: Decimal,
}

/// Snapshot of an account's on-ledger state.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub id: PublicKey,
    pub sequence: i64,
    pub balances: Vec<BalanceRecord>,
}

impl AccountRecord {
    pub fn balance(&self, asset: &Asset) -> Option<&BalanceRecord> {
        self.balances.iter().find(|b| &b.asset == asset)
    }
}

/// Result of a successful transaction submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub hash: String,
}

/// A standing sell offer on the order book.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferRecord {
    pub id: i64,
    pub seller: PublicKey,
    pub selling: Asset,
    pub buying: Asset,
    pub amount: Decimal,
    pub price: Rate,
}

/// A payment or path-payment operation as recorded by the network.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub from: PublicKey,
    pub to: PublicKey,
    pub asset: Asset,
    pub amount: Decimal,
    pub transaction_hash: String,
    /// Present on path payments only.
    pub source_asset: Option<Asset>,
    pub source_amount: Option<Decimal>,
}

/// A trade between two offers, as delivered by the trade stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub paging_token: String,
    /// Identifier of the operation that caused the trade.
    pub operation_id: String,
    /// `None` when the asset is the network's native token.
    pub base_asset: Option<Asset>,
    pub counter_asset: Option<Asset>,
    pub base_amount: Decimal,
    pub counter_amount: Decimal,
    pub base_is_seller: bool,
    pub closed_at: DateTime<Utc>,
}

/// One result of a strict-receive path search.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRecord {
    pub source_amount: Decimal,
    pub destination_amount: Decimal,
    pub path: Vec<Asset>,
}

/// Network operations the engine depends on.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Load the current state of an account.
    async fn load_account(&self, id: &PublicKey) -> Result<AccountRecord>;

    /// Submit a signed transaction, returning its hash or a structured
    /// submission error.
    async fn submit(&self, tx: &Transaction) -> Result<SubmitReceipt>;

    /// Offers placed by a seller, optionally filtered by traded pair.
    async fn offers(
        &self,
        seller: &PublicKey,
        selling: Option<&Asset>,
        buying: Option<&Asset>,
    ) -> Result<Vec<OfferRecord>>;

    /// Paths delivering at least `dest_amount` of `dest`, starting from
    /// `source`.
    async fn strict_receive_paths(
        &self,
        source: &Asset,
        dest: &Asset,
        dest_amount: Decimal,
    ) -> Result<Vec<PathRecord>>;

    /// Full payment history of an account.
    async fn payments(&self, account: &PublicKey) -> Result<Vec<PaymentRecord>>;

    /// Payment operations of one transaction. Fails not-found for an
    /// unknown hash.
    async fn transaction_payments(&self, hash: &str) -> Result<Vec<PaymentRecord>>;

    /// Payment view of a single operation.
    async fn operation_payment(&self, id: &str) -> Result<PaymentRecord>;

    /// Accounts holding a trustline to the given asset.
    async fn accounts_for_asset(&self, asset: &Asset, limit: u32) -> Result<Vec<AccountRecord>>;

    /// Stream of trades involving the given account, starting after the
    /// cursor position.
    fn trades(&self, account: &PublicKey, cursor: &str) -> BoxStream<'static, Result<TradeRecord>>;
}
