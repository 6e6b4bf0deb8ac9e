//! Core types - value objects shared across the engine

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::keys::PublicKey;

/// Asset code of every currency's bridge asset.
pub const HOUR_CODE: &str = "HOUR";

/// An asset on the ledger: an alphanumeric code qualified by its issuer.
/// Two assets are equal iff both code and issuer match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub code: String,
    pub issuer: PublicKey,
}

impl Asset {
    pub fn new(code: impl Into<String>, issuer: PublicKey) -> Self {
        Self {
            code: code.into(),
            issuer,
        }
    }

    /// A bridge ("HOUR") asset issued by the given external issuer.
    pub fn hour(issuer: PublicKey) -> Self {
        Self::new(HOUR_CODE, issuer)
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.code, self.issuer)
    }
}

/// Exchange rate as an exact integer fraction, reduced at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub n: u32,
    pub d: u32,
}

impl Rate {
    pub const UNIT: Rate = Rate { n: 1, d: 1 };

    pub fn new(n: u32, d: u32) -> Result<Self> {
        if n == 0 || d == 0 {
            return Err(Error::Validation(format!("invalid rate {n}/{d}")));
        }
        let divisor = gcd(n, d);
        Ok(Self {
            n: n / divisor,
            d: d / divisor,
        })
    }

    pub fn inverse(self) -> Rate {
        Rate {
            n: self.d,
            d: self.n,
        }
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.n, self.d)
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Limit value the network reports for a trustline created without an
/// explicit limit.
pub fn max_trustline_limit() -> Decimal {
    Decimal::from_i128_with_scale(i64::MAX as i128, 7)
}

/// Round to 7 decimal places towards positive infinity, keeping scale 7.
pub fn round_up_7(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(7, RoundingStrategy::AwayFromZero);
    rounded.rescale(7);
    rounded
}

/// Round to 7 decimal places towards zero, keeping scale 7.
pub fn round_down_7(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(7, RoundingStrategy::ToZero);
    rounded.rescale(7);
    rounded
}

/// A completed local-asset payment, reconstructed from ledger data.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub payer: PublicKey,
    pub payee: PublicKey,
    pub amount: Decimal,
    pub asset: Asset,
    /// Hash of the ledger transaction that settled the payment.
    pub hash: String,
}

/// A completed cross-currency payment: the payee side plus the source
/// asset/amount spent by the payer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalTransfer {
    pub transfer: Transfer,
    pub source_asset: Asset,
    pub source_amount: Decimal,
}

/// A transfer looked up by transaction hash.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerTransfer {
    Local(Transfer),
    External(ExternalTransfer),
}

/// A viable conversion path between two assets, produced by path finding and
/// consumed immediately by a cross-currency payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuote {
    pub source_amount: Decimal,
    pub source_asset: Asset,
    pub dest_amount: Decimal,
    pub dest_asset: Asset,
    /// Intermediate assets, in conversion order.
    pub path: Vec<Asset>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_asset_equality_is_exact() {
        let a = KeyPair::random().public_key();
        let b = KeyPair::random().public_key();
        assert_eq!(Asset::new("HOUR", a.clone()), Asset::hour(a.clone()));
        assert_ne!(Asset::hour(a.clone()), Asset::hour(b));
        assert_ne!(Asset::new("WORK", a.clone()), Asset::new("HOUR", a));
    }

    #[test]
    fn test_rate_reduces() {
        let rate = Rate::new(10, 100).unwrap();
        assert_eq!(rate, Rate { n: 1, d: 10 });
        assert_eq!(rate.inverse(), Rate { n: 10, d: 1 });
        assert!(Rate::new(0, 5).is_err());
        assert!(Rate::new(5, 0).is_err());
    }

    #[test]
    fn test_rounding_boundaries() {
        // A remainder below the 7th decimal place must still round up...
        assert_eq!(round_up_7(dec("0.00000001")).to_string(), "0.0000001");
        // ...while the truncating direction drops it.
        assert_eq!(round_down_7(dec("0.00000019")).to_string(), "0.0000001");
        // Exact values are only rescaled.
        assert_eq!(round_up_7(dec("10")).to_string(), "10.0000000");
        assert_eq!(round_down_7(dec("10")).to_string(), "10.0000000");
    }

    #[test]
    fn test_max_trustline_limit_scale() {
        assert_eq!(max_trustline_limit().to_string(), "922337203685.4775807");
    }
}
