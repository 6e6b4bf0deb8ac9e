//! In-memory gateway and fixtures for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::core::{Asset, CurrencyConfig, CurrencyKeys, Error, Rate, Result, max_trustline_limit};
use crate::currency::Currency;
use crate::gateway::{
    AccountRecord, BalanceRecord, Gateway, OfferRecord, PathRecord, PaymentRecord, SubmitReceipt,
    TradeRecord,
};
use crate::keys::{KeyPair, PublicKey};
use crate::ledger::{Ledger, LedgerOptions};
use crate::tx::{Operation, Transaction};

/// Gateway double keeping the whole network in memory. Submitted payment,
/// trust and merge operations are applied to the account table so balances
/// evolve like on the real network.
pub(crate) struct MockGateway {
    pub accounts: Mutex<HashMap<PublicKey, AccountRecord>>,
    pub offers: Mutex<Vec<OfferRecord>>,
    pub paths: Mutex<Vec<PathRecord>>,
    pub account_payments: Mutex<HashMap<PublicKey, Vec<PaymentRecord>>>,
    pub tx_payments: Mutex<HashMap<String, Vec<PaymentRecord>>>,
    pub op_payments: Mutex<HashMap<String, PaymentRecord>>,
    pub submitted: Mutex<Vec<Transaction>>,
    pub load_calls: AtomicUsize,
    pub load_delay: Mutex<Duration>,
    /// Scripted trade feed handed out by the next `trades` call.
    pub trade_feed: Mutex<Option<mpsc::Receiver<Result<TradeRecord>>>>,
    next_offer_id: AtomicI64,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(HashMap::new()),
            offers: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            account_payments: Mutex::new(HashMap::new()),
            tx_payments: Mutex::new(HashMap::new()),
            op_payments: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            load_calls: AtomicUsize::new(0),
            load_delay: Mutex::new(Duration::ZERO),
            trade_feed: Mutex::new(None),
            next_offer_id: AtomicI64::new(1),
        })
    }

    pub fn put_account(
        &self,
        id: &PublicKey,
        sequence: i64,
        balances: Vec<(Asset, Decimal, Decimal)>,
    ) {
        self.accounts.lock().insert(
            id.clone(),
            AccountRecord {
                id: id.clone(),
                sequence,
                balances: balances
                    .into_iter()
                    .map(|(asset, balance, limit)| BalanceRecord {
                        asset,
                        balance,
                        limit,
                    })
                    .collect(),
            },
        );
    }

    pub fn balance_of(&self, id: &PublicKey, asset: &Asset) -> Decimal {
        self.accounts
            .lock()
            .get(id)
            .and_then(|a| a.balance(asset).map(|b| b.balance))
            .unwrap_or(Decimal::ZERO)
    }

    fn apply(&self, tx: &Transaction) {
        if let Some(source) = self.accounts.lock().get_mut(&tx.source) {
            source.sequence = tx.sequence;
        }
        for op in &tx.operations {
            match op {
                Operation::CreateAccount { destination, .. } => {
                    self.put_account(destination, 0, vec![]);
                }
                Operation::Payment {
                    source,
                    destination,
                    asset,
                    amount,
                } => {
                    let mut accounts = self.accounts.lock();
                    if let Some(account) = accounts.get_mut(source) {
                        if let Some(balance) =
                            account.balances.iter_mut().find(|b| &b.asset == asset)
                        {
                            balance.balance -= *amount;
                        }
                    }
                    if let Some(account) = accounts.get_mut(destination) {
                        match account.balances.iter_mut().find(|b| &b.asset == asset) {
                            Some(balance) => balance.balance += *amount,
                            None => account.balances.push(BalanceRecord {
                                asset: asset.clone(),
                                balance: *amount,
                                limit: max_trustline_limit(),
                            }),
                        }
                    }
                }
                Operation::ChangeTrust {
                    source,
                    asset,
                    limit,
                } => {
                    let mut accounts = self.accounts.lock();
                    if let Some(account) = accounts.get_mut(source) {
                        match limit {
                            Some(limit) if limit.is_zero() => {
                                account.balances.retain(|b| &b.asset != asset);
                            }
                            _ => {
                                let limit = (*limit).unwrap_or_else(max_trustline_limit);
                                match account.balances.iter_mut().find(|b| &b.asset == asset) {
                                    Some(balance) => balance.limit = limit,
                                    None => account.balances.push(BalanceRecord {
                                        asset: asset.clone(),
                                        balance: Decimal::ZERO,
                                        limit,
                                    }),
                                }
                            }
                        }
                    }
                }
                Operation::AccountMerge { source, .. } => {
                    self.accounts.lock().remove(source);
                }
                Operation::CreatePassiveSellOffer {
                    source,
                    selling,
                    buying,
                    amount,
                    price,
                } => {
                    self.offers.lock().push(OfferRecord {
                        id: self.next_offer_id.fetch_add(1, Ordering::Relaxed),
                        seller: source.clone(),
                        selling: selling.clone(),
                        buying: buying.clone(),
                        amount: *amount,
                        price: *price,
                    });
                }
                Operation::ManageSellOffer {
                    offer_id, amount, ..
                } => {
                    let mut offers = self.offers.lock();
                    if amount.is_zero() {
                        offers.retain(|o| o.id != *offer_id);
                    } else if let Some(offer) = offers.iter_mut().find(|o| o.id == *offer_id) {
                        offer.amount = *amount;
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn load_account(&self, id: &PublicKey) -> Result<AccountRecord> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.load_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.accounts
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {id} not found")))
    }

    async fn submit(&self, tx: &Transaction) -> Result<SubmitReceipt> {
        self.apply(tx);
        let hash = tx.hash()?;
        self.submitted.lock().push(tx.clone());
        Ok(SubmitReceipt { hash })
    }

    async fn offers(
        &self,
        seller: &PublicKey,
        selling: Option<&Asset>,
        buying: Option<&Asset>,
    ) -> Result<Vec<OfferRecord>> {
        Ok(self
            .offers
            .lock()
            .iter()
            .filter(|o| {
                &o.seller == seller
                    && selling.is_none_or(|s| &o.selling == s)
                    && buying.is_none_or(|b| &o.buying == b)
            })
            .cloned()
            .collect())
    }

    async fn strict_receive_paths(
        &self,
        _source: &Asset,
        _dest: &Asset,
        _dest_amount: Decimal,
    ) -> Result<Vec<PathRecord>> {
        Ok(self.paths.lock().clone())
    }

    async fn payments(&self, account: &PublicKey) -> Result<Vec<PaymentRecord>> {
        Ok(self
            .account_payments
            .lock()
            .get(account)
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction_payments(&self, hash: &str) -> Result<Vec<PaymentRecord>> {
        self.tx_payments
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {hash} not found")))
    }

    async fn operation_payment(&self, id: &str) -> Result<PaymentRecord> {
        self.op_payments
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {id} not found")))
    }

    async fn accounts_for_asset(&self, asset: &Asset, limit: u32) -> Result<Vec<AccountRecord>> {
        Ok(self
            .accounts
            .lock()
            .values()
            .filter(|a| a.balance(asset).is_some())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn trades(
        &self,
        _account: &PublicKey,
        _cursor: &str,
    ) -> BoxStream<'static, Result<TradeRecord>> {
        match self.trade_feed.lock().take() {
            Some(rx) => {
                futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()
            }
            // Keep reconnect attempts parked instead of spinning.
            None => futures::stream::pending().boxed(),
        }
    }
}

/// A currency wired to a mock gateway, with all role accounts seeded.
pub(crate) struct Fixture {
    pub gateway: Arc<MockGateway>,
    pub ledger: Arc<Ledger>,
    pub keys: CurrencyKeys,
    pub sponsor: KeyPair,
    pub pool: Option<KeyPair>,
    pub currency: Arc<Currency>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(Rate::new(1, 10).unwrap(), false)
}

pub(crate) fn fixture_with(rate: Rate, with_pool: bool) -> Fixture {
    let gateway = MockGateway::new();
    let sponsor = KeyPair::random();
    let keys = CurrencyKeys::random();
    let mut data = keys.data();
    let pool = with_pool.then(KeyPair::random);
    data.disabled_accounts_pool = pool.as_ref().map(|p| p.public_key());

    let config = CurrencyConfig::new("WORK", rate).unwrap();
    let local = Asset::new("WORK", data.issuer.clone());
    let hour = Asset::hour(data.external_issuer.clone());
    let unlimited = max_trustline_limit();

    gateway.put_account(&sponsor.public_key(), 0, vec![]);
    gateway.put_account(&data.issuer, 0, vec![]);
    gateway.put_account(
        &data.credit,
        0,
        vec![(local.clone(), Decimal::from(10_000), unlimited)],
    );
    gateway.put_account(&data.admin, 0, vec![(local.clone(), Decimal::ZERO, unlimited)]);
    gateway.put_account(&data.external_issuer, 0, vec![]);
    gateway.put_account(
        &data.external_trader,
        0,
        vec![
            (local.clone(), Decimal::ZERO, unlimited),
            (hour.clone(), Decimal::ZERO, unlimited),
        ],
    );
    if let Some(pool) = &pool {
        gateway.put_account(
            &pool.public_key(),
            0,
            vec![(local.clone(), Decimal::ZERO, unlimited)],
        );
    }

    let ledger = Ledger::new(
        gateway.clone(),
        LedgerOptions {
            sponsor_public_key: sponsor.public_key(),
            domain: "commons.example".to_string(),
        },
    );
    let currency = ledger.get_currency(config, data, None).unwrap();

    Fixture {
        gateway,
        ledger,
        keys,
        sponsor,
        pool,
        currency,
    }
}

/// Collect every event of the given kinds for later assertions.
pub(crate) fn capture_events(
    ledger: &Arc<Ledger>,
    kinds: &[crate::events::EventKind],
) -> Arc<Mutex<Vec<crate::events::LedgerEvent>>> {
    let store = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = store.clone();
        ledger.on(*kind, move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event);
                Ok(())
            }
        });
    }
    store
}

impl Fixture {
    pub fn local_asset(&self) -> Asset {
        self.currency.asset()
    }

    pub fn hour_asset(&self) -> Asset {
        self.currency.hour()
    }

    /// Seed a member account holding the given local-asset balance.
    pub fn add_member(&self, balance: Decimal) -> KeyPair {
        let key = KeyPair::random();
        self.gateway.put_account(
            &key.public_key(),
            0,
            vec![(self.local_asset(), balance, max_trustline_limit())],
        );
        key
    }
}
