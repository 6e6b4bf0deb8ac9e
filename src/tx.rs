//! Transaction construction and signing.
//!
//! Multi-step business operations are expressed as one multi-operation
//! transaction so they apply atomically. Each operation records the signer
//! it requires in a [`SignerSet`]; submission resolves that set against the
//! key pairs the caller supplied.

use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::{Asset, Error, Rate, Result};
use crate::keys::{KeyPair, PublicKey};

/// Trustlines to the asset need explicit issuer authorization.
pub const AUTH_REQUIRED_FLAG: u32 = 0x1;
/// The issuer can revoke an authorized trustline, freezing the asset.
pub const AUTH_REVOCABLE_FLAG: u32 = 0x2;
/// The issuer can claw the asset back from a holding account.
pub const AUTH_CLAWBACK_ENABLED_FLAG: u32 = 0x8;

/// A single ledger operation. Every operation carries an explicit source
/// account; the transaction source only provides the sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    CreateAccount {
        source: PublicKey,
        destination: PublicKey,
        starting_balance: Decimal,
    },
    Payment {
        source: PublicKey,
        destination: PublicKey,
        asset: Asset,
        amount: Decimal,
    },
    ChangeTrust {
        source: PublicKey,
        asset: Asset,
        /// `None` requests the maximum limit; zero removes the trustline.
        limit: Option<Decimal>,
    },
    SetTrustLineFlags {
        source: PublicKey,
        asset: Asset,
        trustor: PublicKey,
        authorized: bool,
    },
    SetOptions {
        source: PublicKey,
        options: AccountOptions,
    },
    CreatePassiveSellOffer {
        source: PublicKey,
        selling: Asset,
        buying: Asset,
        amount: Decimal,
        price: Rate,
    },
    ManageSellOffer {
        source: PublicKey,
        offer_id: i64,
        selling: Asset,
        buying: Asset,
        amount: Decimal,
        price: Rate,
    },
    PathPaymentStrictReceive {
        source: PublicKey,
        send_asset: Asset,
        send_max: Decimal,
        destination: PublicKey,
        dest_asset: Asset,
        dest_amount: Decimal,
        path: Vec<Asset>,
    },
    AccountMerge {
        source: PublicKey,
        destination: PublicKey,
    },
    BeginSponsoringFutureReserves {
        source: PublicKey,
        sponsored_id: PublicKey,
    },
    EndSponsoringFutureReserves {
        source: PublicKey,
    },
}

/// Account settings applied by [`Operation::SetOptions`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountOptions {
    pub set_flags: Option<u32>,
    pub home_domain: Option<String>,
    pub signer: Option<AccountSigner>,
    pub master_weight: Option<u8>,
    pub low_threshold: Option<u8>,
    pub medium_threshold: Option<u8>,
    pub high_threshold: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSigner {
    pub key: PublicKey,
    pub weight: u8,
}

/// A transaction ready for signing and submission.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub source: PublicKey,
    /// The sponsor account paying the fee.
    pub fee_source: PublicKey,
    pub sequence: i64,
    pub operations: Vec<Operation>,
    pub signatures: Vec<TxSignature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxSignature {
    pub public_key: PublicKey,
    pub signature: String,
}

impl Transaction {
    /// Canonical signing payload: the transaction body without signatures.
    fn payload(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Payload<'a> {
            source: &'a PublicKey,
            fee_source: &'a PublicKey,
            sequence: i64,
            operations: &'a [Operation],
        }
        Ok(serde_json::to_vec(&Payload {
            source: &self.source,
            fee_source: &self.fee_source,
            sequence: self.sequence,
            operations: &self.operations,
        })?)
    }

    /// Hex-encoded SHA-256 hash of the signing payload.
    pub fn hash(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.payload()?)))
    }

    /// Append a signature over the transaction hash. Signing twice with the
    /// same key is a no-op.
    pub fn sign(&mut self, key: &KeyPair) -> Result<()> {
        let public_key = key.public_key();
        if self.signatures.iter().any(|s| s.public_key == public_key) {
            return Ok(());
        }
        let hash = self.hash()?;
        self.signatures.push(TxSignature {
            public_key,
            signature: key.sign(hash.as_bytes()),
        });
        Ok(())
    }
}

/// Builder for a transaction bound to a source account and a fee source.
#[derive(Debug)]
pub struct TxBuilder {
    source: PublicKey,
    fee_source: PublicKey,
    sequence: i64,
    operations: Vec<Operation>,
}

impl TxBuilder {
    pub fn new(source: PublicKey, sequence: i64, fee_source: PublicKey) -> Self {
        Self {
            source,
            fee_source,
            sequence,
            operations: Vec::new(),
        }
    }

    pub fn operations(mut self, ops: Vec<Operation>) -> Self {
        self.operations.extend(ops);
        self
    }

    pub fn build(self) -> Transaction {
        Transaction {
            source: self.source,
            fee_source: self.fee_source,
            sequence: self.sequence,
            operations: self.operations,
            signatures: Vec::new(),
        }
    }
}

/// The signers a transaction requires, accumulated while its operations are
/// built. Each entry is either one mandatory key or a set of alternatives
/// (e.g. a payment may be signed by the account or by the admin).
#[derive(Debug, Clone, Default)]
pub struct SignerSet {
    all: BTreeSet<PublicKey>,
    any: Vec<Vec<PublicKey>>,
}

impl SignerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a signature from exactly this key.
    pub fn require(&mut self, key: &PublicKey) {
        self.all.insert(key.clone());
    }

    /// Require a signature from one of the given keys.
    pub fn require_any(&mut self, keys: &[&PublicKey]) {
        self.any.push(keys.iter().map(|k| (*k).clone()).collect());
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty()
    }

    /// Match the requirements against the available key pairs, failing with
    /// a validation error naming the first missing signer.
    pub fn resolve<'a>(&self, available: &[&'a KeyPair]) -> Result<Vec<&'a KeyPair>> {
        let by_key: HashMap<PublicKey, &'a KeyPair> = available
            .iter()
            .map(|kp| (kp.public_key(), *kp))
            .collect();
        let mut resolved: Vec<&'a KeyPair> = Vec::new();
        let mut seen: BTreeSet<PublicKey> = BTreeSet::new();
        for required in &self.all {
            let key = *by_key.get(required).ok_or_else(|| {
                Error::Validation(format!("missing required signer {required}"))
            })?;
            if seen.insert(required.clone()) {
                resolved.push(key);
            }
        }
        for alternatives in &self.any {
            if alternatives.iter().any(|pk| seen.contains(pk)) {
                continue;
            }
            let key = alternatives
                .iter()
                .find_map(|pk| by_key.get(pk).map(|kp| (pk, *kp)))
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "missing required signer, expected one of: {}",
                        alternatives
                            .iter()
                            .map(|pk| pk.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?;
            seen.insert(key.0.clone());
            resolved.push(key.1);
        }
        Ok(resolved)
    }
}
