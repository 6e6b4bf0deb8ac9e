//! Currency configuration and persistable identity data
//!
//! Currencies always use a fixed precision of 7 decimal places.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Rate, Result};
use crate::keys::{KeyPair, PublicKey};

/// Immutable per-currency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// The 4 character currency code, `[A-Z0-9]{4}`.
    pub code: String,

    /// Value of the currency in HOURs: a rate of 1/10 means 1 HOUR buys 10
    /// units of the local currency.
    pub rate: Rate,

    /// Starting local-currency credit for the external trader account.
    ///
    /// This bounds how much local currency can be created by incoming
    /// external payments before any outgoing payment has happened.
    #[serde(default)]
    pub external_trader_initial_credit: Decimal,

    /// Maximum local-currency balance for the external trader account.
    /// The difference to the initial credit bounds outgoing external
    /// payments. `None` leaves outgoing payments unbounded.
    #[serde(default)]
    pub external_trader_maximum_balance: Option<Decimal>,
}

impl CurrencyConfig {
    pub fn new(code: impl Into<String>, rate: Rate) -> Result<Self> {
        let config = Self {
            code: code.into(),
            rate,
            external_trader_initial_credit: Decimal::ZERO,
            external_trader_maximum_balance: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let code_ok = self.code.len() == 4
            && self
                .code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !code_ok {
            return Err(Error::Validation(format!(
                "invalid currency code {:?}",
                self.code
            )));
        }
        if self.rate.n == 0 || self.rate.d == 0 {
            return Err(Error::Validation(format!("invalid rate {}", self.rate)));
        }
        Ok(())
    }
}

/// The five signing identities a currency needs. Returned once at creation
/// for the caller to persist; the engine never stores them.
#[derive(Debug, Clone)]
pub struct CurrencyKeys {
    /// Mints the local asset.
    pub issuer: KeyPair,
    /// Funds credit extended to member accounts.
    pub credit: KeyPair,
    /// Co-signer for member accounts.
    pub admin: KeyPair,
    /// Mints this currency's bridge ("HOUR") asset.
    pub external_issuer: KeyPair,
    /// Holds the offers and trustlines for cross-currency exchange.
    pub external_trader: KeyPair,
}

impl CurrencyKeys {
    pub fn random() -> Self {
        Self {
            issuer: KeyPair::random(),
            credit: KeyPair::random(),
            admin: KeyPair::random(),
            external_issuer: KeyPair::random(),
            external_trader: KeyPair::random(),
        }
    }

    /// The public, persistable counterpart of these keys.
    pub fn data(&self) -> CurrencyData {
        CurrencyData {
            issuer: self.issuer.public_key(),
            credit: self.credit.public_key(),
            admin: self.admin.public_key(),
            external_issuer: self.external_issuer.public_key(),
            external_trader: self.external_trader.public_key(),
            disabled_accounts_pool: None,
        }
    }
}

/// Public account identities of a currency, persisted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyData {
    pub issuer: PublicKey,
    pub credit: PublicKey,
    pub admin: PublicKey,
    pub external_issuer: PublicKey,
    pub external_trader: PublicKey,
    /// Shared settlement account holding the balances of disabled members.
    #[serde(default)]
    pub disabled_accounts_pool: Option<PublicKey>,
}

/// Mutable currency state, persisted by the caller across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyState {
    /// Last processed position in the external trades stream. Resuming from
    /// an older cursor re-delivers trades, which handlers tolerate.
    pub external_trades_stream_cursor: String,
}

impl Default for CurrencyState {
    fn default() -> Self {
        Self {
            external_trades_stream_cursor: "0".to_string(),
        }
    }
}
