//! Currency orchestration: on-ledger infrastructure, member accounts,
//! bridge offers and trade-event classification.
//!
//! Each currency owns five role accounts (issuer, credit, admin, external
//! issuer, external trader) plus two assets: the local asset and the bridge
//! "HOUR" asset. Cross-currency exchange works through the external trader's
//! trustlines and passive offers against other currencies' bridge assets.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::account::Account;
use crate::core::{
    Asset, CurrencyConfig, CurrencyData, CurrencyState, Error, ExternalTransfer, HOUR_CODE,
    LedgerTransfer, PathQuote, Rate, Result, Transfer, round_down_7, round_up_7,
};
use crate::events::{EventBus, LedgerEvent, OfferUpdate};
use crate::gateway::{Gateway, OfferRecord, PaymentRecord, SubmitReceipt, TradeRecord};
use crate::keys::{KeyPair, PublicKey};
use crate::tx::{
    AccountOptions, AccountSigner, AUTH_CLAWBACK_ENABLED_FLAG, AUTH_REQUIRED_FLAG,
    AUTH_REVOCABLE_FLAG, Operation, SignerSet, TxBuilder,
};

/// Minimum spacing between stream connection attempts, measured from the
/// start of the previous attempt.
const STREAM_RETRY_SPACING: Duration = Duration::from_secs(5);
/// A stream connection is proactively recycled after this long.
const STREAM_RECYCLE_AFTER: Duration = Duration::from_secs(5 * 60);
/// Total time and spacing for the bounded-retry mode of `quote_path`.
const QUOTE_RETRY_TIMEOUT: Duration = Duration::from_secs(30);
const QUOTE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The five role keys plus the sponsor, for currency lifecycle operations.
pub struct CurrencyRoleKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub issuer: &'a KeyPair,
    pub credit: &'a KeyPair,
    pub admin: &'a KeyPair,
    pub external_issuer: &'a KeyPair,
    pub external_trader: &'a KeyPair,
}

pub struct CreateAccountOptions {
    pub initial_credit: Decimal,
    pub maximum_balance: Option<Decimal>,
    /// Key pair to use instead of generating a fresh one.
    pub account_key: Option<KeyPair>,
}

/// Keys for `create_account`; the credit key only if `initial_credit > 0`.
pub struct CreateAccountKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub issuer: &'a KeyPair,
    pub credit: Option<&'a KeyPair>,
}

pub struct EnableAccountOptions {
    /// Balance to restore from the disabled-accounts pool.
    pub balance: Decimal,
    pub maximum_balance: Option<Decimal>,
}

pub struct EnableAccountKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub issuer: &'a KeyPair,
    pub account: &'a KeyPair,
    pub disabled_accounts_pool: &'a KeyPair,
}

/// A one-way trust from this currency to another currency's bridge asset.
pub struct TrustLine {
    /// The other currency's external issuer.
    pub trusted_public_key: PublicKey,
    /// Maximum exposure, expressed in local currency units. Zero removes
    /// the trustline and its offer.
    pub limit: Decimal,
}

/// Keys for `trust_currency`; the external issuer key is only needed when
/// the trader must be funded, i.e. when the limit grows.
pub struct TrustCurrencyKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub external_trader: &'a KeyPair,
    pub external_issuer: Option<&'a KeyPair>,
}

/// Keys for operations on the external trader's offers.
pub struct TraderKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub external_trader: &'a KeyPair,
}

pub struct BridgeKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub external_trader: &'a KeyPair,
    pub external_issuer: &'a KeyPair,
}

/// Path search request towards another local currency.
pub struct QuoteRequest {
    pub dest_code: String,
    pub dest_issuer: PublicKey,
    /// Amount to be received, in the destination currency.
    pub amount: Decimal,
    /// Retry for a bounded period; used right after establishing a
    /// trustline, while the network catches up.
    pub retry: bool,
}

/// Orchestrator for one currency. Owns the per-account registry and the
/// trade-event stream; never holds any private key.
pub struct Currency {
    gateway: Arc<dyn Gateway>,
    bus: Arc<EventBus>,
    sponsor: PublicKey,
    domain: String,
    config: RwLock<CurrencyConfig>,
    data: RwLock<CurrencyData>,
    state: RwLock<CurrencyState>,
    /// One account orchestrator per public key, so each account has a
    /// single sequence-number source of truth.
    accounts: Mutex<HashMap<PublicKey, Arc<Account>>>,
    stream: Mutex<Option<JoinHandle<()>>>,
    me: Weak<Currency>,
}

impl Currency {
    pub(crate) fn new(
        gateway: Arc<dyn Gateway>,
        bus: Arc<EventBus>,
        sponsor: PublicKey,
        domain: String,
        config: CurrencyConfig,
        data: CurrencyData,
        state: Option<CurrencyState>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|me| Self {
            gateway,
            bus,
            sponsor,
            domain,
            config: RwLock::new(config),
            data: RwLock::new(data),
            state: RwLock::new(state.unwrap_or_default()),
            accounts: Mutex::new(HashMap::new()),
            stream: Mutex::new(None),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> CurrencyConfig {
        self.config.read().clone()
    }

    pub fn data(&self) -> CurrencyData {
        self.data.read().clone()
    }

    pub fn state(&self) -> CurrencyState {
        self.state.read().clone()
    }

    pub fn set_config(&self, config: CurrencyConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn set_data(&self, data: CurrencyData) {
        *self.data.write() = data;
    }

    pub(crate) fn gateway(&self) -> Arc<dyn Gateway> {
        self.gateway.clone()
    }

    pub(crate) fn sponsor(&self) -> &PublicKey {
        &self.sponsor
    }

    /// The local currency asset.
    pub fn asset(&self) -> Asset {
        Asset::new(self.config.read().code.clone(), self.data.read().issuer.clone())
    }

    /// This currency's bridge asset.
    pub fn hour(&self) -> Asset {
        Asset::hour(self.data.read().external_issuer.clone())
    }

    /// Convert local currency to hours, rounding up to 7 decimal places so
    /// a bridge offer is never under-collateralized.
    pub fn local_to_hour(&self, amount: Decimal) -> Decimal {
        let rate = self.config.read().rate;
        round_up_7(amount * Decimal::from(rate.n) / Decimal::from(rate.d))
    }

    /// Convert hours to local currency, rounding down to 7 decimal places so
    /// a recipient is never over-credited.
    pub fn hour_to_local(&self, amount: Decimal) -> Decimal {
        let rate = self.config.read().rate;
        round_down_7(amount * Decimal::from(rate.d) / Decimal::from(rate.n))
    }

    // ---- accounts ------------------------------------------------------

    /// Get the loaded and updated account for a public key.
    pub async fn get_account(&self, public_key: &PublicKey) -> Result<Arc<Account>> {
        let account = {
            let mut accounts = self.accounts.lock();
            accounts
                .entry(public_key.clone())
                .or_insert_with(|| Account::new(self.me.clone(), public_key.clone()))
                .clone()
        };
        account.update().await?;
        Ok(account)
    }

    /// Like `get_account`, but `None` for an account that does not exist.
    pub async fn find_account(&self, public_key: &PublicKey) -> Result<Option<Arc<Account>>> {
        match self.get_account(public_key).await {
            Ok(account) => Ok(Some(account)),
            Err(err) if err.kind() == crate::core::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn issuer_account(&self) -> Result<Arc<Account>> {
        let id = self.data.read().issuer.clone();
        self.get_account(&id).await
    }

    pub async fn credit_account(&self) -> Result<Arc<Account>> {
        let id = self.data.read().credit.clone();
        self.get_account(&id).await
    }

    pub async fn external_trader_account(&self) -> Result<Arc<Account>> {
        let id = self.data.read().external_trader.clone();
        self.get_account(&id).await
    }

    pub async fn external_issuer_account(&self) -> Result<Arc<Account>> {
        let id = self.data.read().external_issuer.clone();
        self.get_account(&id).await
    }

    // ---- submission ----------------------------------------------------

    /// Build, sign and submit one transaction sourced at `source`. The
    /// sponsor pays the fee and always co-signs.
    pub(crate) async fn submit_for(
        &self,
        source: &Account,
        ops: Vec<Operation>,
        signers: SignerSet,
        available: &[&KeyPair],
        sponsor: &KeyPair,
    ) -> Result<SubmitReceipt> {
        let sequence = source.next_sequence()?;
        let receipt = self
            .submit_tx(source.id().clone(), sequence, ops, signers, available, sponsor)
            .await?;
        source.note_submitted(sequence);
        Ok(receipt)
    }

    /// Submit a transaction sourced at the sponsor account itself, used for
    /// installation before any currency account exists.
    async fn submit_from_sponsor(
        &self,
        ops: Vec<Operation>,
        signers: SignerSet,
        available: &[&KeyPair],
        sponsor: &KeyPair,
    ) -> Result<SubmitReceipt> {
        let record = self.gateway.load_account(&sponsor.public_key()).await?;
        self.submit_tx(record.id, record.sequence + 1, ops, signers, available, sponsor)
            .await
    }

    async fn submit_tx(
        &self,
        source: PublicKey,
        sequence: i64,
        ops: Vec<Operation>,
        signers: SignerSet,
        available: &[&KeyPair],
        sponsor: &KeyPair,
    ) -> Result<SubmitReceipt> {
        let mut tx = TxBuilder::new(source, sequence, sponsor.public_key())
            .operations(ops)
            .build();
        let mut all_available: Vec<&KeyPair> = available.to_vec();
        all_available.push(sponsor);
        for key in signers.resolve(&all_available)? {
            tx.sign(key)?;
        }
        tx.sign(sponsor)?;
        self.gateway.submit(&tx).await
    }

    pub(crate) fn emit_transfer(&self, transfer: Transfer) {
        self.bus.emit(LedgerEvent::Transfer {
            currency: self.config.read().code.clone(),
            transfer,
        });
    }

    // ---- installation --------------------------------------------------

    /// Create all on-ledger infrastructure for this currency in a single
    /// transaction signed by the five role keys and the sponsor.
    pub async fn enable(&self, keys: CurrencyRoleKeys<'_>) -> Result<()> {
        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        self.install_currency_ops(&mut ops, &mut signers);
        // The external issuer survives a previous disable when foreign
        // trustlines to its hours still exist.
        let data = self.data();
        let external_issuer_exists = match self.gateway.load_account(&data.external_issuer).await {
            Ok(_) => true,
            Err(err) if err.kind() == crate::core::ErrorKind::NotFound => false,
            Err(err) => return Err(err),
        };
        if !external_issuer_exists {
            self.install_external_issuer_ops(&mut ops, &mut signers);
        }
        self.install_external_trader_ops(&mut ops, &mut signers);

        let available = [
            keys.issuer,
            keys.credit,
            keys.admin,
            keys.external_issuer,
            keys.external_trader,
        ];
        self.submit_from_sponsor(ops, signers, &available, keys.sponsor)
            .await?;
        info!("installed currency {}", self.config.read().code);
        Ok(())
    }

    /// Issuer with asset-control flags, funded credit account and admin
    /// account.
    fn install_currency_ops(&self, ops: &mut Vec<Operation>, signers: &mut SignerSet) {
        let data = self.data();
        ops.push(Operation::BeginSponsoringFutureReserves {
            source: self.sponsor.clone(),
            sponsored_id: data.issuer.clone(),
        });
        ops.push(Operation::CreateAccount {
            source: self.sponsor.clone(),
            destination: data.issuer.clone(),
            starting_balance: Decimal::ZERO,
        });
        // Trustlines to the local asset need explicit authorization, can be
        // revoked, and the asset can be clawed back from member accounts.
        ops.push(Operation::SetOptions {
            source: data.issuer.clone(),
            options: AccountOptions {
                set_flags: Some(
                    AUTH_REQUIRED_FLAG | AUTH_REVOCABLE_FLAG | AUTH_CLAWBACK_ENABLED_FLAG,
                ),
                home_domain: Some(self.domain.clone()),
                ..Default::default()
            },
        });
        ops.push(Operation::EndSponsoringFutureReserves {
            source: data.issuer.clone(),
        });
        signers.require(&self.sponsor);
        signers.require(&data.issuer);

        self.create_account_ops(&data.credit, None, None, &self.sponsor, ops, signers);
        ops.push(Operation::Payment {
            source: data.issuer.clone(),
            destination: data.credit.clone(),
            asset: self.asset(),
            amount: self.credit_starting_balance(),
        });
        signers.require(&data.credit);

        self.create_account_ops(&data.admin, None, None, &self.sponsor, ops, signers);
    }

    /// The account issuing this currency's bridge asset.
    fn install_external_issuer_ops(&self, ops: &mut Vec<Operation>, signers: &mut SignerSet) {
        let data = self.data();
        ops.push(Operation::BeginSponsoringFutureReserves {
            source: self.sponsor.clone(),
            sponsored_id: data.external_issuer.clone(),
        });
        ops.push(Operation::CreateAccount {
            source: data.issuer.clone(),
            destination: data.external_issuer.clone(),
            starting_balance: Decimal::ZERO,
        });
        ops.push(Operation::SetOptions {
            source: data.external_issuer.clone(),
            options: AccountOptions {
                home_domain: Some(self.domain.clone()),
                ..Default::default()
            },
        });
        ops.push(Operation::EndSponsoringFutureReserves {
            source: data.external_issuer.clone(),
        });
        signers.require(&self.sponsor);
        signers.require(&data.issuer);
        signers.require(&data.external_issuer);
    }

    /// The trader account, its hour trustline and balance, and the two
    /// passive offers backing both trading directions.
    fn install_external_trader_ops(&self, ops: &mut Vec<Operation>, signers: &mut SignerSet) {
        let config = self.config();
        let data = self.data();
        self.create_account_ops(
            &data.external_trader,
            config.external_trader_maximum_balance,
            None,
            &self.sponsor,
            ops,
            signers,
        );
        if config.external_trader_initial_credit > Decimal::ZERO {
            self.add_credit_ops(
                &data.external_trader,
                config.external_trader_initial_credit,
                self.credit_starting_balance(),
                ops,
                signers,
            );
        }

        ops.push(Operation::BeginSponsoringFutureReserves {
            source: self.sponsor.clone(),
            sponsored_id: data.external_trader.clone(),
        });
        ops.push(Operation::ChangeTrust {
            source: data.external_trader.clone(),
            asset: self.hour(),
            limit: None,
        });
        let hours = self.external_trader_starting_hours();
        if hours > Decimal::ZERO {
            ops.push(Operation::Payment {
                source: data.external_issuer.clone(),
                destination: data.external_trader.clone(),
                asset: self.hour(),
                amount: hours,
            });
            signers.require(&data.external_issuer);
        }
        // Passive offer backing incoming payments (hour -> local asset)...
        if config.external_trader_initial_credit > Decimal::ZERO {
            ops.push(Operation::CreatePassiveSellOffer {
                source: data.external_trader.clone(),
                selling: self.asset(),
                buying: self.hour(),
                amount: config.external_trader_initial_credit,
                price: config.rate,
            });
        }
        // ...and outgoing payments (local asset -> hour).
        if hours > Decimal::ZERO {
            ops.push(Operation::CreatePassiveSellOffer {
                source: data.external_trader.clone(),
                selling: self.hour(),
                buying: self.asset(),
                amount: hours,
                price: config.rate.inverse(),
            });
        }
        ops.push(Operation::EndSponsoringFutureReserves {
            source: data.external_trader.clone(),
        });
        signers.require(&data.external_trader);
    }

    /// Hour balance backing outgoing payments at install time. Unbounded
    /// trader balances start with no hours; capacity then builds up through
    /// trading.
    fn external_trader_starting_hours(&self) -> Decimal {
        let config = self.config();
        match config.external_trader_maximum_balance {
            Some(maximum) => self
                .local_to_hour((maximum - config.external_trader_initial_credit).max(Decimal::ZERO)),
            None => Decimal::ZERO,
        }
    }

    /// Sponsored account creation with an authorized trustline to the local
    /// asset, and optionally the admin as high-threshold co-signer.
    fn create_account_ops(
        &self,
        public_key: &PublicKey,
        maximum_balance: Option<Decimal>,
        admin_signer: Option<&PublicKey>,
        creator: &PublicKey,
        ops: &mut Vec<Operation>,
        signers: &mut SignerSet,
    ) {
        let data = self.data();
        let asset = self.asset();
        ops.push(Operation::BeginSponsoringFutureReserves {
            source: self.sponsor.clone(),
            sponsored_id: public_key.clone(),
        });
        ops.push(Operation::CreateAccount {
            source: creator.clone(),
            destination: public_key.clone(),
            starting_balance: Decimal::ZERO,
        });
        ops.push(Operation::ChangeTrust {
            source: public_key.clone(),
            asset: asset.clone(),
            limit: maximum_balance,
        });
        ops.push(Operation::SetTrustLineFlags {
            source: data.issuer.clone(),
            asset,
            trustor: public_key.clone(),
            authorized: true,
        });
        if let Some(admin) = admin_signer {
            // Both the account key and the admin can sign payments; only the
            // admin reaches the high threshold for administrative changes.
            ops.push(Operation::SetOptions {
                source: public_key.clone(),
                options: AccountOptions {
                    signer: Some(AccountSigner {
                        key: admin.clone(),
                        weight: 2,
                    }),
                    ..Default::default()
                },
            });
            ops.push(Operation::SetOptions {
                source: public_key.clone(),
                options: AccountOptions {
                    master_weight: Some(1),
                    low_threshold: Some(1),
                    medium_threshold: Some(1),
                    high_threshold: Some(2),
                    ..Default::default()
                },
            });
        }
        ops.push(Operation::EndSponsoringFutureReserves {
            source: public_key.clone(),
        });
        signers.require(&self.sponsor);
        signers.require(&data.issuer);
        signers.require(public_key);
    }

    // ---- credit funding ------------------------------------------------

    /// Balance the credit account is topped up to, so it can operate for a
    /// while between funding transactions.
    fn credit_starting_balance(&self) -> Decimal {
        self.hour_to_local(Decimal::from(1000))
    }

    /// Top the credit account up to at least `min_amount`, in multiples of
    /// the starting balance. Returns whether issuer funding was added.
    fn fund_credit_ops(
        &self,
        credit_balance: Decimal,
        min_amount: Option<Decimal>,
        ops: &mut Vec<Operation>,
        signers: &mut SignerSet,
    ) -> bool {
        let data = self.data();
        let starting = self.credit_starting_balance();
        let minimum = min_amount.unwrap_or(starting);
        let shortfall = minimum - credit_balance;
        if shortfall <= Decimal::ZERO {
            return false;
        }
        let amount = (shortfall / starting).ceil() * starting;
        ops.push(Operation::Payment {
            source: data.issuer.clone(),
            destination: data.credit.clone(),
            asset: self.asset(),
            amount,
        });
        signers.require(&data.issuer);
        info!(
            "funding the credit account with {} {amount}",
            self.config.read().code
        );
        true
    }

    /// Pay `credit` from the credit account, funding it first if needed.
    /// Returns whether the issuer must co-sign for the funding step.
    pub(crate) fn add_credit_ops(
        &self,
        destination: &PublicKey,
        credit: Decimal,
        credit_balance: Decimal,
        ops: &mut Vec<Operation>,
        signers: &mut SignerSet,
    ) -> bool {
        if credit <= Decimal::ZERO {
            return false;
        }
        let data = self.data();
        let needs_issuer = self.fund_credit_ops(credit_balance, Some(credit), ops, signers);
        ops.push(Operation::Payment {
            source: data.credit.clone(),
            destination: destination.clone(),
            asset: self.asset(),
            amount: credit,
        });
        signers.require(&data.credit);
        needs_issuer
    }

    // ---- member accounts -----------------------------------------------

    /// Create and approve a new member account, optionally with initial
    /// credit. Returns the account's key pair for the caller to persist.
    pub async fn create_account(
        &self,
        options: CreateAccountOptions,
        keys: CreateAccountKeys<'_>,
    ) -> Result<KeyPair> {
        if keys.credit.is_some() && options.initial_credit == Decimal::ZERO {
            return Err(Error::Validation(
                "credit key not allowed when initial credit is zero".to_string(),
            ));
        }
        if keys.credit.is_none() && options.initial_credit > Decimal::ZERO {
            return Err(Error::Validation(
                "credit key required when initial credit is positive".to_string(),
            ));
        }
        let account = options.account_key.unwrap_or_else(KeyPair::random);
        let data = self.data();
        let issuer_account = self.issuer_account().await?;
        let credit_account = self.credit_account().await?;

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        self.create_account_ops(
            &account.public_key(),
            options.maximum_balance,
            Some(&data.admin),
            &data.issuer,
            &mut ops,
            &mut signers,
        );
        self.add_credit_ops(
            &account.public_key(),
            options.initial_credit,
            credit_account.balance(None)?,
            &mut ops,
            &mut signers,
        );

        let mut available: Vec<&KeyPair> = vec![keys.issuer, &account];
        if let Some(credit) = keys.credit {
            available.push(credit);
        }
        self.submit_for(&issuer_account, ops, signers, &available, keys.sponsor)
            .await?;
        info!(
            public_key = %account.public_key(),
            "created new account for currency {}",
            self.config.read().code
        );
        Ok(account)
    }

    /// Re-create a previously disabled account, restoring its balance from
    /// the disabled-accounts pool.
    pub async fn enable_account(
        &self,
        options: EnableAccountOptions,
        keys: EnableAccountKeys<'_>,
    ) -> Result<()> {
        let data = self.data();
        let issuer_account = self.issuer_account().await?;
        let public_key = keys.account.public_key();

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        self.create_account_ops(
            &public_key,
            options.maximum_balance,
            Some(&data.admin),
            &data.issuer,
            &mut ops,
            &mut signers,
        );
        if options.balance > Decimal::ZERO {
            let pool = keys.disabled_accounts_pool.public_key();
            ops.push(Operation::Payment {
                source: pool.clone(),
                destination: public_key.clone(),
                asset: self.asset(),
                amount: options.balance,
            });
            signers.require(&pool);
        }

        let available = [keys.issuer, keys.account, keys.disabled_accounts_pool];
        let receipt = self
            .submit_for(&issuer_account, ops, signers, &available, keys.sponsor)
            .await?;
        info!(
            hash = %receipt.hash,
            "enabled account {public_key} for currency {}",
            self.config.read().code
        );
        Ok(())
    }

    // ---- external trading ----------------------------------------------

    async fn fetch_external_offer(
        &self,
        selling: &Asset,
        buying: &Asset,
    ) -> Result<Option<OfferRecord>> {
        let trader = self.data.read().external_trader.clone();
        let offers = self
            .gateway
            .offers(&trader, Some(selling), Some(buying))
            .await?;
        Ok(offers.into_iter().next())
    }

    /// Establish or resize the one-way trust to another currency's bridge
    /// asset. The trader is funded with this currency's hours to back a
    /// passive offer converting foreign hours into local hours.
    pub async fn trust_currency(
        &self,
        line: TrustLine,
        keys: TrustCurrencyKeys<'_>,
    ) -> Result<()> {
        let data = self.data();
        let foreign = Asset::hour(line.trusted_public_key.clone());
        if foreign.issuer == data.external_issuer {
            return Err(Error::Validation(
                "a currency cannot trust its own bridge asset".to_string(),
            ));
        }
        let limit_hours = self.local_to_hour(line.limit);
        let trader = self.external_trader_account().await?;
        let existing = trader.trustline(&foreign)?;
        let used = existing.as_ref().map(|l| l.balance).unwrap_or(Decimal::ZERO);
        if limit_hours < used {
            return Err(Error::Validation(format!(
                "trust limit {limit_hours} is below the traded balance {used}"
            )));
        }
        let existing_limit = existing.as_ref().map(|l| l.limit).unwrap_or(Decimal::ZERO);
        let offer = self.fetch_external_offer(&self.hour(), &foreign).await?;
        let target_offer_amount = limit_hours - used;

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        signers.require(&data.external_trader);

        let require_external_issuer = |signers: &mut SignerSet| {
            signers.require(&data.external_issuer);
            keys.external_issuer.is_some()
        };

        if existing.is_none() {
            if limit_hours == Decimal::ZERO {
                debug!("no trustline to remove for {foreign}");
                return Ok(());
            }
            // New relationship: sponsored trustline, hour funding, offer.
            signers.require(&self.sponsor);
            ops.push(Operation::BeginSponsoringFutureReserves {
                source: self.sponsor.clone(),
                sponsored_id: data.external_trader.clone(),
            });
            ops.push(Operation::ChangeTrust {
                source: data.external_trader.clone(),
                asset: foreign.clone(),
                limit: Some(limit_hours),
            });
            ops.push(Operation::Payment {
                source: data.external_issuer.clone(),
                destination: data.external_trader.clone(),
                asset: self.hour(),
                amount: limit_hours,
            });
            if !require_external_issuer(&mut signers) {
                return Err(Error::Validation(
                    "external issuer key required to fund a new trustline".to_string(),
                ));
            }
            ops.push(Operation::CreatePassiveSellOffer {
                source: data.external_trader.clone(),
                selling: self.hour(),
                buying: foreign.clone(),
                amount: limit_hours,
                price: Rate::UNIT,
            });
            ops.push(Operation::EndSponsoringFutureReserves {
                source: data.external_trader.clone(),
            });
        } else if limit_hours > existing_limit {
            // Growing: widen the trustline, add hours, then grow the offer.
            let delta = limit_hours - existing_limit;
            ops.push(Operation::ChangeTrust {
                source: data.external_trader.clone(),
                asset: foreign.clone(),
                limit: Some(limit_hours),
            });
            ops.push(Operation::Payment {
                source: data.external_issuer.clone(),
                destination: data.external_trader.clone(),
                asset: self.hour(),
                amount: delta,
            });
            if !require_external_issuer(&mut signers) {
                return Err(Error::Validation(
                    "external issuer key required to fund a trustline increase".to_string(),
                ));
            }
            self.sell_offer_ops(
                offer.as_ref(),
                self.hour(),
                foreign.clone(),
                target_offer_amount,
                Rate::UNIT,
                &mut ops,
                &mut signers,
            );
        } else if limit_hours < existing_limit {
            // Shrinking: reduce the offer first, drain the hours, then
            // tighten (or remove) the trustline.
            let delta = existing_limit - limit_hours;
            self.sell_offer_ops(
                offer.as_ref(),
                self.hour(),
                foreign.clone(),
                target_offer_amount,
                Rate::UNIT,
                &mut ops,
                &mut signers,
            );
            ops.push(Operation::Payment {
                source: data.external_trader.clone(),
                destination: data.external_issuer.clone(),
                asset: self.hour(),
                amount: delta,
            });
            ops.push(Operation::ChangeTrust {
                source: data.external_trader.clone(),
                asset: foreign.clone(),
                limit: Some(limit_hours),
            });
        } else {
            debug!("trustline to {foreign} already at limit {limit_hours}");
            return Ok(());
        }

        let mut available: Vec<&KeyPair> = vec![keys.external_trader];
        if let Some(external_issuer) = keys.external_issuer {
            available.push(external_issuer);
        }
        self.submit_for(&trader, ops, signers, &available, keys.sponsor)
            .await?;
        info!(
            "updated trustline to {foreign} with limit {limit_hours} for currency {}",
            self.config.read().code
        );
        Ok(())
    }

    fn sell_offer_ops(
        &self,
        existing: Option<&OfferRecord>,
        selling: Asset,
        buying: Asset,
        amount: Decimal,
        price: Rate,
        ops: &mut Vec<Operation>,
        signers: &mut SignerSet,
    ) {
        let trader = self.data.read().external_trader.clone();
        match existing {
            Some(offer) => {
                ops.push(Operation::ManageSellOffer {
                    source: trader,
                    offer_id: offer.id,
                    selling,
                    buying,
                    amount,
                    price,
                });
            }
            None if amount > Decimal::ZERO => {
                signers.require(&self.sponsor);
                ops.push(Operation::BeginSponsoringFutureReserves {
                    source: self.sponsor.clone(),
                    sponsored_id: trader.clone(),
                });
                ops.push(Operation::CreatePassiveSellOffer {
                    source: trader.clone(),
                    selling,
                    buying,
                    amount,
                    price,
                });
                ops.push(Operation::EndSponsoringFutureReserves { source: trader });
            }
            None => {}
        }
    }

    /// Create or resize the trader's offer selling `selling` for this
    /// currency's hours, sized to the trader's balance unless an explicit
    /// amount is given. Called whenever that balance changes.
    pub async fn update_external_offer(
        &self,
        selling: &Asset,
        keys: TraderKeys<'_>,
        amount: Option<Decimal>,
    ) -> Result<()> {
        let data = self.data();
        let offer = self.fetch_external_offer(selling, &self.hour()).await?;
        let trader = self.external_trader_account().await?;
        let balance = trader.balance(Some(selling))?;
        let existing_amount = offer.as_ref().map(|o| o.amount).unwrap_or(Decimal::ZERO);
        let target = amount.unwrap_or(balance);
        if existing_amount == target {
            debug!(
                "external offer selling {selling} for currency {} is already up to date",
                self.config.read().code
            );
            return Ok(());
        }
        let price = if *selling == self.asset() {
            self.config.read().rate
        } else {
            Rate::UNIT
        };
        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        signers.require(&data.external_trader);
        self.sell_offer_ops(
            offer.as_ref(),
            selling.clone(),
            self.hour(),
            target,
            price,
            &mut ops,
            &mut signers,
        );
        self.submit_for(&trader, ops, signers, &[keys.external_trader], keys.sponsor)
            .await?;
        info!(
            "updated external offer selling {selling} for currency {}",
            self.config.read().code
        );
        self.bus.emit(LedgerEvent::ExternalOfferUpdated {
            currency: self.config.read().code.clone(),
            offer: OfferUpdate {
                selling: selling.clone(),
                buying: self.hour(),
                amount: target,
                created: offer.is_none(),
            },
        });
        Ok(())
    }

    // ---- path finding --------------------------------------------------

    async fn find_path(&self, dest: &Asset, amount: Decimal) -> Result<Option<PathQuote>> {
        let source = self.asset();
        debug!(
            "finding path from {} to {} for amount {amount}",
            source.code, dest.code
        );
        let paths = self
            .gateway
            .strict_receive_paths(&source, dest, amount)
            .await?;
        let viable = paths
            .into_iter()
            .filter(|p| p.destination_amount >= amount)
            .min_by(|a, b| a.source_amount.cmp(&b.source_amount));
        Ok(viable.map(|p| PathQuote {
            source_amount: p.source_amount,
            source_asset: source.clone(),
            dest_amount: p.destination_amount,
            dest_asset: dest.clone(),
            path: p.path,
        }))
    }

    /// Find the cheapest path delivering at least the requested amount.
    /// `None` means no viable path exists, which is an expected outcome.
    pub async fn quote_path(&self, request: &QuoteRequest) -> Result<Option<PathQuote>> {
        let dest = Asset::new(request.dest_code.clone(), request.dest_issuer.clone());
        if !request.retry {
            return self.find_path(&dest, request.amount).await;
        }
        let deadline = tokio::time::Instant::now() + QUOTE_RETRY_TIMEOUT;
        loop {
            if let Some(quote) = self.find_path(&dest, request.amount).await? {
                return Ok(Some(quote));
            }
            if tokio::time::Instant::now() + QUOTE_RETRY_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(QUOTE_RETRY_INTERVAL).await;
        }
    }

    // ---- transfers -----------------------------------------------------

    /// Reconstruct the transfer settled by a transaction.
    pub async fn get_transfer(&self, hash: &str) -> Result<LedgerTransfer> {
        let payments = self.gateway.transaction_payments(hash).await?;
        let payment = payments.into_iter().next().ok_or_else(|| {
            Error::NotFound(format!("no payment operation found in transaction {hash}"))
        })?;
        Ok(payment_to_transfer(payment))
    }

    // ---- currency disable ----------------------------------------------

    /// Tear down the trustline to another currency: remove the offer, move
    /// any foreign balance to the external issuer, drop the trustline.
    pub async fn disable_trustline(
        &self,
        trusted_public_key: &PublicKey,
        keys: BridgeKeys<'_>,
    ) -> Result<()> {
        let data = self.data();
        let foreign = Asset::hour(trusted_public_key.clone());
        let trader = self.external_trader_account().await?;
        let Some(line) = trader.trustline(&foreign)? else {
            info!(
                "no trustline to disable for currency {} and asset {foreign}",
                self.config.read().code
            );
            return Ok(());
        };

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        signers.require(&data.external_trader);

        if let Some(offer) = self.fetch_external_offer(&self.hour(), &foreign).await? {
            ops.push(Operation::ManageSellOffer {
                source: data.external_trader.clone(),
                offer_id: offer.id,
                selling: self.hour(),
                buying: foreign.clone(),
                amount: Decimal::ZERO,
                price: offer.price,
            });
        }
        if line.balance > Decimal::ZERO {
            ops.push(Operation::ChangeTrust {
                source: data.external_issuer.clone(),
                asset: foreign.clone(),
                limit: Some(line.balance),
            });
            signers.require(&data.external_issuer);
            ops.push(Operation::Payment {
                source: data.external_trader.clone(),
                destination: data.external_issuer.clone(),
                asset: foreign.clone(),
                amount: line.balance,
            });
        }
        ops.push(Operation::ChangeTrust {
            source: data.external_trader.clone(),
            asset: foreign.clone(),
            limit: Some(Decimal::ZERO),
        });

        let available = [keys.external_trader, keys.external_issuer];
        self.submit_for(&trader, ops, signers, &available, keys.sponsor)
            .await?;
        info!(
            "disabled trustline to {foreign} for currency {}",
            self.config.read().code
        );
        Ok(())
    }

    /// Remove the currency from the ledger. All member accounts must be
    /// deleted or disabled first. The external issuer is kept when foreign
    /// balances or trustlines to its hours still exist.
    pub async fn disable(&self, keys: CurrencyRoleKeys<'_>) -> Result<()> {
        let data = self.data();
        let hour = self.hour();
        let asset = self.asset();

        // Foreign trustlines go first, one transaction each, to stay below
        // the per-transaction operation limit.
        let trader = self.external_trader_account().await?;
        let foreign_lines: Vec<Asset> = trader
            .balances()?
            .into_iter()
            .map(|b| b.asset)
            .filter(|a| *a != hour && *a != asset)
            .collect();
        for line in &foreign_lines {
            self.disable_trustline(
                &line.issuer,
                BridgeKeys {
                    sponsor: keys.sponsor,
                    external_trader: keys.external_trader,
                    external_issuer: keys.external_issuer,
                },
            )
            .await?;
        }

        let issuer_account = self.issuer_account().await?;
        trader.update().await?;

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();

        // Remove the local offer pair and burn the remaining hours.
        for (selling, buying) in [(&asset, &hour), (&hour, &asset)] {
            if let Some(offer) = self.fetch_external_offer(selling, buying).await? {
                ops.push(Operation::ManageSellOffer {
                    source: data.external_trader.clone(),
                    offer_id: offer.id,
                    selling: selling.clone(),
                    buying: buying.clone(),
                    amount: Decimal::ZERO,
                    price: offer.price,
                });
            }
        }
        let hour_balance = trader.balance(Some(&hour))?;
        if hour_balance > Decimal::ZERO {
            ops.push(Operation::Payment {
                source: data.external_trader.clone(),
                destination: data.external_issuer.clone(),
                asset: hour.clone(),
                amount: hour_balance,
            });
        }
        ops.push(Operation::ChangeTrust {
            source: data.external_trader.clone(),
            asset: hour.clone(),
            limit: Some(Decimal::ZERO),
        });
        trader.move_balance_and_delete_ops(&data.issuer, &mut ops)?;
        signers.require(&data.external_trader);

        if let Some(pool) = &data.disabled_accounts_pool {
            let pool_account = self.get_account(pool).await?;
            pool_account.move_balance_and_delete_ops(&data.issuer, &mut ops)?;
            // The admin co-signs for the pool account.
            signers.require(&data.admin);
        }

        // The external issuer can only go when nothing references its hours.
        let external_issuer_account = self.external_issuer_account().await?;
        let mut keep_external_issuer = true;
        if external_issuer_account.balances()?.is_empty() {
            let holders = self.gateway.accounts_for_asset(&hour, 2).await?;
            let foreign_holders = holders
                .iter()
                .filter(|a| a.id != data.external_trader)
                .count();
            if foreign_holders == 0 {
                keep_external_issuer = false;
                ops.push(Operation::AccountMerge {
                    source: data.external_issuer.clone(),
                    destination: self.sponsor.clone(),
                });
                signers.require(&data.external_issuer);
            }
        }

        let admin_account = self.get_account(&data.admin).await?;
        admin_account.move_balance_and_delete_ops(&data.issuer, &mut ops)?;
        signers.require(&data.admin);

        let credit_account = self.credit_account().await?;
        credit_account.move_balance_and_delete_ops(&data.issuer, &mut ops)?;
        signers.require(&data.credit);

        ops.push(Operation::AccountMerge {
            source: data.issuer.clone(),
            destination: self.sponsor.clone(),
        });
        signers.require(&data.issuer);

        let available = [
            keys.issuer,
            keys.credit,
            keys.admin,
            keys.external_issuer,
            keys.external_trader,
        ];
        self.submit_for(&issuer_account, ops, signers, &available, keys.sponsor)
            .await?;
        info!("disabled currency {}", self.config.read().code);
        if keep_external_issuer {
            info!(
                "external issuer for currency {} kept: it still has balances or incoming trustlines",
                self.config.read().code
            );
        }
        Ok(())
    }

    // ---- trade stream --------------------------------------------------

    /// Classify one trade involving the external trader and publish the
    /// matching business event. Any unexpected asset pairing is an
    /// invariant violation.
    pub(crate) async fn handle_trade(&self, trade: &TradeRecord) -> Result<()> {
        let (Some(base), Some(counter)) = (trade.base_asset.clone(), trade.counter_asset.clone())
        else {
            return Err(Error::Internal(format!(
                "unexpected trade with native token at {}",
                trade.paging_token
            )));
        };
        let hour = self.hour();
        let asset = self.asset();
        let code = self.config.read().code.clone();

        if trade.base_is_seller && base == hour && counter.code == HOUR_CODE {
            // Sold local hours for foreign hours: the trader accumulated a
            // foreign bridge balance that needs a compensating offer.
            self.bus.emit(LedgerEvent::IncomingHourTrade {
                currency: code,
                external_hour: counter,
            });
        } else if !trade.base_is_seller && base.code == HOUR_CODE && counter == hour {
            self.bus.emit(LedgerEvent::IncomingHourTrade {
                currency: code,
                external_hour: base,
            });
        } else if base == asset && counter == hour {
            let transfer = self.trade_transfer(trade).await?;
            if trade.base_is_seller {
                // Local asset sold for own hours: somebody outside paid in.
                self.bus.emit(LedgerEvent::IncomingTransfer {
                    currency: code,
                    transfer,
                });
            } else {
                self.bus.emit(LedgerEvent::OutgoingTransfer {
                    currency: code,
                    transfer,
                });
            }
        } else if base == hour && counter == asset {
            let transfer = self.trade_transfer(trade).await?;
            if trade.base_is_seller {
                self.bus.emit(LedgerEvent::OutgoingTransfer {
                    currency: code,
                    transfer,
                });
            } else {
                self.bus.emit(LedgerEvent::IncomingTransfer {
                    currency: code,
                    transfer,
                });
            }
        } else {
            return Err(Error::Internal(format!(
                "unexpected trade between {base} and {counter}"
            )));
        }
        Ok(())
    }

    /// The transfer behind a trade, from its path-payment operation.
    async fn trade_transfer(&self, trade: &TradeRecord) -> Result<ExternalTransfer> {
        let payment = self.gateway.operation_payment(&trade.operation_id).await?;
        match payment_to_transfer(payment) {
            LedgerTransfer::External(transfer) => Ok(transfer),
            LedgerTransfer::Local(transfer) => Ok(ExternalTransfer {
                source_asset: transfer.asset.clone(),
                source_amount: transfer.amount,
                transfer,
            }),
        }
    }

    /// Open the external trades stream. At most one stream runs per
    /// currency; it reconnects with spaced attempts and resumes from the
    /// persisted cursor.
    pub fn start(&self) {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        debug!(
            "starting external trades stream for currency {}",
            self.config.read().code
        );
        *slot = Some(tokio::spawn(async move { me.run_trade_stream().await }));
    }

    /// Close the trade stream. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.stream.lock().take() {
            handle.abort();
        }
    }

    async fn run_trade_stream(self: Arc<Self>) {
        let trader = self.data.read().external_trader.clone();
        loop {
            let attempt_started = tokio::time::Instant::now();
            let cursor = self.state.read().external_trades_stream_cursor.clone();
            debug!(
                "opening trade stream for currency {} at cursor {cursor}",
                self.config.read().code
            );
            let mut stream = self.gateway.trades(&trader, &cursor);
            let recycle = tokio::time::sleep_until(attempt_started + STREAM_RECYCLE_AFTER);
            tokio::pin!(recycle);
            loop {
                tokio::select! {
                    _ = &mut recycle => {
                        debug!("recycling trade stream for currency {}", self.config.read().code);
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(trade)) => {
                            if let Err(err) = self.handle_trade(&trade).await {
                                self.bus.emit_error(&err);
                            }
                            // The cursor advances and is persisted whether or
                            // not the handler succeeded; handlers tolerate
                            // re-delivery after a crash in between.
                            let state = {
                                let mut state = self.state.write();
                                state.external_trades_stream_cursor = trade.paging_token.clone();
                                state.clone()
                            };
                            self.bus.emit(LedgerEvent::StateUpdated {
                                currency: self.config.read().code.clone(),
                                state,
                            });
                        }
                        Some(Err(err)) => {
                            self.bus.emit_error(&err);
                            break;
                        }
                        None => break,
                    }
                }
            }
            drop(stream);
            let elapsed = attempt_started.elapsed();
            if elapsed < STREAM_RETRY_SPACING {
                tokio::time::sleep(STREAM_RETRY_SPACING - elapsed).await;
            }
        }
    }
}

fn payment_to_transfer(payment: PaymentRecord) -> LedgerTransfer {
    let transfer = Transfer {
        payer: payment.from,
        payee: payment.to,
        amount: payment.amount,
        asset: payment.asset,
        hash: payment.transaction_hash,
    };
    match (payment.source_asset, payment.source_amount) {
        (Some(source_asset), Some(source_amount)) => LedgerTransfer::External(ExternalTransfer {
            transfer,
            source_asset,
            source_amount,
        }),
        _ => LedgerTransfer::Local(transfer),
    }
}
