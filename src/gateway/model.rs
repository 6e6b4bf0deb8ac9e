//! Wire models for the network's REST API.
//!
//! Amounts arrive as decimal strings, assets as the usual
//! `asset_type`/`asset_code`/`asset_issuer` triple.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{AccountRecord, BalanceRecord, OfferRecord, PathRecord, PaymentRecord, TradeRecord};
use crate::core::{Asset, Error, Rate, Result};
use crate::keys::PublicKey;

#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(rename = "_embedded")]
    pub embedded: Embedded<T>,
}

#[derive(Debug, Deserialize)]
pub struct Embedded<T> {
    pub records: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct AccountResource {
    pub id: String,
    pub sequence: String,
    pub balances: Vec<BalanceResource>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceResource {
    pub asset_type: String,
    pub asset_code: Option<String>,
    pub asset_issuer: Option<String>,
    pub balance: String,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OfferResource {
    pub id: String,
    pub seller: String,
    pub selling: OfferAssetResource,
    pub buying: OfferAssetResource,
    pub amount: String,
    pub price_r: PriceResource,
}

#[derive(Debug, Deserialize)]
pub struct OfferAssetResource {
    pub asset_type: String,
    pub asset_code: Option<String>,
    pub asset_issuer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PriceResource {
    pub n: u32,
    pub d: u32,
}

#[derive(Debug, Deserialize)]
pub struct OperationResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub paging_token: String,
    pub transaction_hash: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<String>,
    pub asset_type: Option<String>,
    pub asset_code: Option<String>,
    pub asset_issuer: Option<String>,
    pub source_amount: Option<String>,
    pub source_asset_type: Option<String>,
    pub source_asset_code: Option<String>,
    pub source_asset_issuer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TradeResource {
    pub paging_token: String,
    pub base_asset_type: String,
    pub base_asset_code: Option<String>,
    pub base_asset_issuer: Option<String>,
    pub counter_asset_type: String,
    pub counter_asset_code: Option<String>,
    pub counter_asset_issuer: Option<String>,
    pub base_amount: String,
    pub counter_amount: String,
    pub base_is_seller: bool,
    pub ledger_close_time: DateTime<Utc>,
    #[serde(rename = "_links")]
    pub links: TradeLinks,
}

#[derive(Debug, Deserialize)]
pub struct TradeLinks {
    pub operation: Link,
}

#[derive(Debug, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Deserialize)]
pub struct PathResource {
    pub source_amount: String,
    pub destination_amount: String,
    pub path: Vec<OfferAssetResource>,
}

/// Error body returned on transaction submission failure.
#[derive(Debug, Deserialize)]
pub struct SubmitErrorResource {
    pub title: Option<String>,
    pub extras: Option<SubmitErrorExtras>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitErrorExtras {
    pub result_codes: Option<ResultCodes>,
}

#[derive(Debug, Deserialize)]
pub struct ResultCodes {
    pub transaction: Option<String>,
    #[serde(default)]
    pub operations: Vec<String>,
}

impl SubmitErrorResource {
    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        if let Some(codes) = self.extras.as_ref().and_then(|e| e.result_codes.as_ref()) {
            if let Some(tx) = &codes.transaction {
                parts.push(tx.clone());
            }
            parts.extend(codes.operations.iter().cloned());
        }
        if parts.is_empty() {
            self.title.clone().unwrap_or_else(|| "unknown".to_string())
        } else {
            parts.join(", ")
        }
    }
}

fn parse_amount(value: &str) -> Result<Decimal> {
    value
        .parse()
        .map_err(|_| Error::Stream(format!("unparseable amount {value:?}")))
}

/// Build an asset from its wire triple; `None` for the native token.
fn parse_asset(
    asset_type: &str,
    code: &Option<String>,
    issuer: &Option<String>,
) -> Result<Option<Asset>> {
    if asset_type == "native" {
        return Ok(None);
    }
    match (code, issuer) {
        (Some(code), Some(issuer)) => {
            Ok(Some(Asset::new(code.clone(), PublicKey::new(issuer.clone()))))
        }
        _ => Err(Error::Stream(format!(
            "asset of type {asset_type} without code or issuer"
        ))),
    }
}

fn required_asset(
    asset_type: &Option<String>,
    code: &Option<String>,
    issuer: &Option<String>,
) -> Result<Asset> {
    let kind = asset_type.as_deref().unwrap_or("credit_alphanum4");
    parse_asset(kind, code, issuer)?
        .ok_or_else(|| Error::Stream("unexpected native asset".to_string()))
}

impl TryFrom<AccountResource> for AccountRecord {
    type Error = Error;

    fn try_from(resource: AccountResource) -> Result<Self> {
        let sequence = resource
            .sequence
            .parse()
            .map_err(|_| Error::Stream(format!("unparseable sequence {:?}", resource.sequence)))?;
        let mut balances = Vec::new();
        for b in &resource.balances {
            // Native balances only hold reserves; the engine tracks assets.
            if let Some(asset) = parse_asset(&b.asset_type, &b.asset_code, &b.asset_issuer)? {
                balances.push(BalanceRecord {
                    asset,
                    balance: parse_amount(&b.balance)?,
                    limit: match &b.limit {
                        Some(limit) => parse_amount(limit)?,
                        None => crate::core::max_trustline_limit(),
                    },
                });
            }
        }
        Ok(AccountRecord {
            id: PublicKey::new(resource.id),
            sequence,
            balances,
        })
    }
}

impl TryFrom<OfferResource> for OfferRecord {
    type Error = Error;

    fn try_from(resource: OfferResource) -> Result<Self> {
        Ok(OfferRecord {
            id: resource
                .id
                .parse()
                .map_err(|_| Error::Stream(format!("unparseable offer id {:?}", resource.id)))?,
            seller: PublicKey::new(resource.seller),
            selling: required_asset(
                &Some(resource.selling.asset_type),
                &resource.selling.asset_code,
                &resource.selling.asset_issuer,
            )?,
            buying: required_asset(
                &Some(resource.buying.asset_type),
                &resource.buying.asset_code,
                &resource.buying.asset_issuer,
            )?,
            amount: parse_amount(&resource.amount)?,
            price: Rate::new(resource.price_r.n, resource.price_r.d)?,
        })
    }
}

impl OperationResource {
    pub fn is_payment(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "payment" | "path_payment_strict_receive" | "path_payment_strict_send"
        )
    }
}

impl TryFrom<OperationResource> for PaymentRecord {
    type Error = Error;

    fn try_from(resource: OperationResource) -> Result<Self> {
        let missing = |field: &str| {
            Error::Stream(format!(
                "operation {} misses payment field {field}",
                resource.id
            ))
        };
        let source_asset = match &resource.source_asset_type {
            Some(kind) => parse_asset(
                kind,
                &resource.source_asset_code,
                &resource.source_asset_issuer,
            )?,
            None => None,
        };
        Ok(PaymentRecord {
            from: PublicKey::new(resource.from.clone().ok_or_else(|| missing("from"))?),
            to: PublicKey::new(resource.to.clone().ok_or_else(|| missing("to"))?),
            asset: required_asset(&resource.asset_type, &resource.asset_code, &resource.asset_issuer)?,
            amount: parse_amount(resource.amount.as_deref().ok_or_else(|| missing("amount"))?)?,
            transaction_hash: resource.transaction_hash,
            source_asset,
            source_amount: match &resource.source_amount {
                Some(amount) => Some(parse_amount(amount)?),
                None => None,
            },
        })
    }
}

impl TryFrom<TradeResource> for TradeRecord {
    type Error = Error;

    fn try_from(resource: TradeResource) -> Result<Self> {
        // The operation link ends in the operation identifier.
        let operation_id = resource
            .links
            .operation
            .href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(TradeRecord {
            operation_id,
            base_asset: parse_asset(
                &resource.base_asset_type,
                &resource.base_asset_code,
                &resource.base_asset_issuer,
            )?,
            counter_asset: parse_asset(
                &resource.counter_asset_type,
                &resource.counter_asset_code,
                &resource.counter_asset_issuer,
            )?,
            base_amount: parse_amount(&resource.base_amount)?,
            counter_amount: parse_amount(&resource.counter_amount)?,
            base_is_seller: resource.base_is_seller,
            closed_at: resource.ledger_close_time,
            paging_token: resource.paging_token,
        })
    }
}

impl TryFrom<PathResource> for PathRecord {
    type Error = Error;

    fn try_from(resource: PathResource) -> Result<Self> {
        let mut path = Vec::with_capacity(resource.path.len());
        for hop in &resource.path {
            path.push(required_asset(
                &Some(hop.asset_type.clone()),
                &hop.asset_code,
                &hop.asset_issuer,
            )?);
        }
        Ok(PathRecord {
            source_amount: parse_amount(&resource.source_amount)?,
            destination_amount: parse_amount(&resource.destination_amount)?,
            path,
        })
    }
}
