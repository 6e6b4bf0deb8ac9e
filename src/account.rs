//! Account orchestration: cached state plus the payment, credit and
//! lifecycle operations of a single ledger account.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::core::{Asset, Error, ErrorKind, ExternalTransfer, PathQuote, Result, Transfer};
use crate::currency::Currency;
use crate::gateway::{AccountRecord, BalanceRecord, SubmitReceipt};
use crate::keys::{KeyPair, PublicKey};
use crate::tx::{Operation, SignerSet};

type LoadOutcome = std::result::Result<AccountRecord, (ErrorKind, String)>;
type LoadFuture = Shared<BoxFuture<'static, LoadOutcome>>;

/// A local payment: destination and amount in the local asset.
#[derive(Debug, Clone)]
pub struct Payment {
    pub payee: PublicKey,
    pub amount: Decimal,
}

/// A cross-currency payment along a previously obtained quote. The payee
/// receives exactly `amount` of the quote's destination asset.
#[derive(Debug, Clone)]
pub struct ExternalPayment {
    pub payee: PublicKey,
    pub amount: Decimal,
    pub quote: PathQuote,
}

/// Keys for account-signed operations. `account` may be the account's own
/// key or the currency admin key for administered accounts.
pub struct PayKeys<'a> {
    pub account: &'a KeyPair,
    pub sponsor: &'a KeyPair,
}

/// Keys for administrative account operations.
pub struct AdminKeys<'a> {
    pub admin: &'a KeyPair,
    pub sponsor: &'a KeyPair,
}

/// Keys for `update_credit`: `account` when reducing, `credit` when
/// increasing, `issuer` additionally when the credit account must be funded.
pub struct UpdateCreditKeys<'a> {
    pub sponsor: &'a KeyPair,
    pub account: Option<&'a KeyPair>,
    pub credit: Option<&'a KeyPair>,
    pub issuer: Option<&'a KeyPair>,
}

/// One ledger account of a currency. At most one instance exists per public
/// key within a currency, so the cached sequence number has a single source
/// of truth.
pub struct Account {
    currency: Weak<Currency>,
    id: PublicKey,
    cached: Mutex<Option<AccountRecord>>,
    /// In-flight refresh, if any, tagged with a generation so a finished
    /// call never clears a newer one.
    inflight: Mutex<Option<(u64, LoadFuture)>>,
    generation: AtomicU64,
}

impl Account {
    pub(crate) fn new(currency: Weak<Currency>, id: PublicKey) -> Arc<Self> {
        Arc::new(Self {
            currency,
            id,
            cached: Mutex::new(None),
            inflight: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &PublicKey {
        &self.id
    }

    fn currency(&self) -> Result<Arc<Currency>> {
        self.currency
            .upgrade()
            .ok_or_else(|| Error::Internal("currency orchestrator dropped".to_string()))
    }

    /// Refresh the cached state from the network.
    ///
    /// Concurrent callers share a single network call. A refresh racing a
    /// just-submitted transaction never regresses the locally known
    /// sequence number.
    pub async fn update(&self) -> Result<()> {
        let (generation, load) = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some((generation, load)) => (*generation, load.clone()),
                None => {
                    let gateway = self.currency()?.gateway();
                    let id = self.id.clone();
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let load: LoadFuture = async move {
                        gateway
                            .load_account(&id)
                            .await
                            .map_err(|e| (e.kind(), e.to_string()))
                    }
                    .boxed()
                    .shared();
                    *slot = Some((generation, load.clone()));
                    (generation, load)
                }
            }
        };

        let outcome = load.await;

        // Always clear the in-flight marker, success or failure.
        {
            let mut slot = self.inflight.lock();
            if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
                *slot = None;
            }
        }

        match outcome {
            Ok(mut loaded) => {
                let mut cached = self.cached.lock();
                if let Some(previous) = cached.as_ref() {
                    if previous.sequence > loaded.sequence {
                        loaded.sequence = previous.sequence;
                    }
                }
                *cached = Some(loaded);
                Ok(())
            }
            Err((kind, message)) => Err(Error::from_parts(kind, message)),
        }
    }

    fn record(&self) -> Result<AccountRecord> {
        self.cached
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal(format!("account {} not loaded", self.id)))
    }

    pub(crate) fn next_sequence(&self) -> Result<i64> {
        Ok(self.record()?.sequence + 1)
    }

    /// Record a successfully submitted sequence number.
    pub(crate) fn note_submitted(&self, sequence: i64) {
        let mut cached = self.cached.lock();
        if let Some(record) = cached.as_mut() {
            if record.sequence < sequence {
                record.sequence = sequence;
            }
        }
    }

    fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    /// All asset balances of the account.
    pub fn balances(&self) -> Result<Vec<BalanceRecord>> {
        Ok(self.record()?.balances)
    }

    pub(crate) fn trustline(&self, asset: &Asset) -> Result<Option<BalanceRecord>> {
        Ok(self.record()?.balance(asset).cloned())
    }

    /// Cached balance in the given asset, defaulting to the currency's local
    /// asset. Issuers report an unbounded balance.
    pub fn balance(&self, asset: Option<&Asset>) -> Result<Decimal> {
        let currency = self.currency()?;
        let asset = match asset {
            Some(asset) => asset.clone(),
            None => currency.asset(),
        };
        let record = self.record()?;
        match record.balance(&asset) {
            Some(balance) => Ok(balance.balance),
            None if asset.issuer == self.id => Ok(Decimal::MAX),
            None => Err(Error::NotFound(format!(
                "account {} holds no trustline to {asset}",
                self.id
            ))),
        }
    }

    /// Current trustline limit for the local asset.
    pub fn maximum_balance(&self) -> Result<Decimal> {
        let currency = self.currency()?;
        let asset = currency.asset();
        self.trustline(&asset)?
            .map(|line| line.limit)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "account {} unexpectedly has no {} trustline",
                    self.id, asset.code
                ))
            })
    }

    /// Pay `amount` of the local asset to another member account.
    pub async fn pay(&self, payment: Payment, keys: PayKeys<'_>) -> Result<Transfer> {
        let currency = self.currency()?;
        let asset = currency.asset();
        let balance = self.balance(None)?;
        if balance < payment.amount {
            return Err(Error::InsufficientBalance(format!(
                "balance {balance} is not sufficient for a payment of {}",
                payment.amount
            )));
        }

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        ops.push(Operation::Payment {
            source: self.id.clone(),
            destination: payment.payee.clone(),
            asset: asset.clone(),
            amount: payment.amount,
        });
        signers.require_any(&[&self.id, &currency.data().admin]);

        debug!(
            "submitting payment of {} with sequence {}",
            payment.amount,
            self.next_sequence()? - 1
        );
        let receipt = currency
            .submit_for(self, ops, signers, &[keys.account], keys.sponsor)
            .await?;

        let transfer = Transfer {
            payer: self.id.clone(),
            payee: payment.payee,
            amount: payment.amount,
            asset,
            hash: receipt.hash,
        };
        currency.emit_transfer(transfer.clone());
        info!(
            hash = %transfer.hash,
            "account {} paid {} to {}",
            self.id, transfer.amount, transfer.payee
        );
        Ok(transfer)
    }

    /// Pay into another currency through a quoted path. The payment is
    /// strict-receive: the payee gets exactly `payment.amount`, the payer
    /// spends at most the quoted source amount.
    pub async fn external_pay(
        &self,
        payment: ExternalPayment,
        keys: PayKeys<'_>,
    ) -> Result<ExternalTransfer> {
        let currency = self.currency()?;
        let balance = self.balance(None)?;
        if balance < payment.quote.source_amount {
            return Err(Error::InsufficientBalance(format!(
                "balance {balance} is not sufficient for a path payment of {}",
                payment.quote.source_amount
            )));
        }

        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        ops.push(Operation::PathPaymentStrictReceive {
            source: self.id.clone(),
            send_asset: payment.quote.source_asset.clone(),
            send_max: payment.quote.source_amount,
            destination: payment.payee.clone(),
            dest_asset: payment.quote.dest_asset.clone(),
            dest_amount: payment.amount,
            path: payment.quote.path.clone(),
        });
        signers.require_any(&[&self.id, &currency.data().admin]);

        let receipt = currency
            .submit_for(self, ops, signers, &[keys.account], keys.sponsor)
            .await?;

        let transfer = ExternalTransfer {
            transfer: Transfer {
                payer: self.id.clone(),
                payee: payment.payee,
                amount: payment.amount,
                asset: payment.quote.dest_asset,
                hash: receipt.hash,
            },
            source_asset: payment.quote.source_asset,
            // With passive 1:1 hour offers the quoted source amount is what
            // actually gets spent.
            source_amount: payment.quote.source_amount,
        };
        info!(
            hash = %transfer.transfer.hash,
            "account {} paid {} {} through path",
            self.id, transfer.transfer.amount, transfer.transfer.asset.code
        );
        Ok(transfer)
    }

    /// All local-asset payments made from or to this account.
    async fn transfers(&self) -> Result<Vec<Transfer>> {
        let currency = self.currency()?;
        let asset = currency.asset();
        let payments = currency.gateway().payments(&self.id).await?;
        Ok(payments
            .into_iter()
            .filter(|p| p.source_asset.is_none() && p.asset == asset)
            .map(|p| Transfer {
                payer: p.from,
                payee: p.to,
                amount: p.amount,
                asset: p.asset,
                hash: p.transaction_hash,
            })
            .collect())
    }

    /// Net credit extended to this account by the currency's credit account,
    /// derived from the full payment history.
    pub async fn credit(&self) -> Result<Decimal> {
        let currency = self.currency()?;
        let credit = currency.data().credit;
        let transfers = self.transfers().await?;
        let mut total = Decimal::ZERO;
        for transfer in transfers {
            if transfer.payer == credit && transfer.payee == self.id {
                total += transfer.amount;
            } else if transfer.payer == self.id && transfer.payee == credit {
                total -= transfer.amount;
            }
        }
        Ok(total)
    }

    /// Bring the credit extended to this account to `amount`, paying the
    /// difference in the required direction. Returns the signed difference,
    /// zero when the account is already at the target.
    pub async fn update_credit(
        &self,
        amount: Decimal,
        keys: UpdateCreditKeys<'_>,
    ) -> Result<Decimal> {
        let current = self.credit().await?;
        if amount == current {
            return Ok(Decimal::ZERO);
        }
        let currency = self.currency()?;
        let diff = amount - current;
        if diff < Decimal::ZERO {
            let account = keys.account.ok_or_else(|| {
                Error::Validation("account key required when reducing the credit".to_string())
            })?;
            self.pay(
                Payment {
                    payee: currency.data().credit,
                    amount: -diff,
                },
                PayKeys {
                    account,
                    sponsor: keys.sponsor,
                },
            )
            .await?;
        } else {
            let credit_key = keys.credit.ok_or_else(|| {
                Error::Validation("credit key required when increasing the credit".to_string())
            })?;
            let credit_account = currency.credit_account().await?;
            let mut ops = Vec::new();
            let mut signers = SignerSet::new();
            let needs_issuer = currency.add_credit_ops(
                &self.id,
                diff,
                credit_account.balance(None)?,
                &mut ops,
                &mut signers,
            );
            if needs_issuer && keys.issuer.is_none() {
                return Err(Error::Validation(
                    "issuer key required to fund the credit account".to_string(),
                ));
            }
            let mut available: Vec<&KeyPair> = vec![credit_key];
            if let Some(issuer) = keys.issuer {
                available.push(issuer);
            }
            currency
                .submit_for(&credit_account, ops, signers, &available, keys.sponsor)
                .await?;
        }
        info!(
            "account {} credit updated from {current} to {amount}",
            self.id
        );
        Ok(diff)
    }

    /// Set the trustline limit for the local asset. A no-op when the limit
    /// already matches; the issuer does not co-sign limit changes.
    pub async fn update_maximum_balance(
        &self,
        amount: Option<Decimal>,
        keys: PayKeys<'_>,
    ) -> Result<()> {
        if amount.is_some() && amount == Some(self.maximum_balance()?) {
            return Ok(());
        }
        let currency = self.currency()?;
        let mut ops = Vec::new();
        let mut signers = SignerSet::new();
        ops.push(Operation::ChangeTrust {
            source: self.id.clone(),
            asset: currency.asset(),
            limit: amount,
        });
        signers.require(&self.id);
        currency
            .submit_for(self, ops, signers, &[keys.account], keys.sponsor)
            .await?;
        info!(
            "account {} maximum balance updated to {:?}",
            self.id, amount
        );
        Ok(())
    }

    /// Move any remaining balance, drop the trustline and remove the
    /// account, in one transaction.
    pub(crate) fn move_balance_and_delete_ops(
        &self,
        destination: &PublicKey,
        ops: &mut Vec<Operation>,
    ) -> Result<()> {
        let currency = self.currency()?;
        let asset = currency.asset();
        let balance = self.balance(Some(&asset))?;
        if balance > Decimal::ZERO {
            ops.push(Operation::Payment {
                source: self.id.clone(),
                destination: destination.clone(),
                asset: asset.clone(),
                amount: balance,
            });
        }
        ops.push(Operation::ChangeTrust {
            source: self.id.clone(),
            asset,
            limit: Some(Decimal::ZERO),
        });
        // The base reserve returns to the sponsor.
        ops.push(Operation::AccountMerge {
            source: self.id.clone(),
            destination: currency.sponsor().clone(),
        });
        Ok(())
    }

    async fn move_balance_and_delete(
        &self,
        destination: &PublicKey,
        keys: AdminKeys<'_>,
    ) -> Result<SubmitReceipt> {
        let currency = self.currency()?;
        let mut ops = Vec::new();
        self.move_balance_and_delete_ops(destination, &mut ops)?;
        // Deleting is a high threshold operation; the admin key meets it.
        let mut signers = SignerSet::new();
        signers.require_any(&[&self.id, &currency.data().admin]);
        let receipt = currency
            .submit_for(self, ops, signers, &[keys.admin], keys.sponsor)
            .await?;
        self.invalidate();
        Ok(receipt)
    }

    /// Permanently remove the account, returning its balance to the credit
    /// account.
    pub async fn delete(&self, keys: AdminKeys<'_>) -> Result<()> {
        let currency = self.currency()?;
        let destination = currency.data().credit;
        self.move_balance_and_delete(&destination, keys).await?;
        info!("account {} deleted", self.id);
        Ok(())
    }

    /// Disable the account: its balance moves to the currency's shared
    /// disabled-accounts pool and the account leaves the ledger until it is
    /// enabled again.
    pub async fn disable(&self, keys: AdminKeys<'_>) -> Result<()> {
        let currency = self.currency()?;
        let pool = currency.data().disabled_accounts_pool.ok_or_else(|| {
            Error::Internal("currency does not have a disabled accounts pool".to_string())
        })?;
        let receipt = self.move_balance_and_delete(&pool, keys).await?;
        info!(
            hash = %receipt.hash,
            "account {} disabled in currency {}",
            self.id,
            currency.config().code
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::gateway::PaymentRecord;
    use crate::testutil::{capture_events, fixture, fixture_with};
    use std::time::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_updates_share_one_load() {
        let fx = fixture();
        let member = fx.add_member(dec("100"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        *fx.gateway.load_delay.lock() = Duration::from_millis(50);
        fx.gateway.load_calls.store(0, Ordering::Relaxed);

        let results = futures::future::join_all((0..5).map(|_| account.update())).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fx.gateway.load_calls.load(Ordering::Relaxed), 1);

        // A later refresh starts a fresh load.
        account.update().await.unwrap();
        assert_eq!(fx.gateway.load_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_update_clears_inflight_on_failure() {
        let fx = fixture();
        let member = fx.add_member(dec("10"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        fx.gateway.accounts.lock().remove(&member.public_key());
        assert_eq!(
            account.update().await.unwrap_err().kind(),
            crate::core::ErrorKind::NotFound
        );

        // The in-flight marker was cleared; a new call works again.
        fx.gateway.put_account(&member.public_key(), 9, vec![]);
        account.update().await.unwrap();
        assert_eq!(account.next_sequence().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_update_never_regresses_sequence() {
        let fx = fixture();
        let member = fx.add_member(dec("10"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        // A local submission raced the refresh: the cache knows sequence 7
        // while the network still reports 0.
        account.note_submitted(7);
        account.update().await.unwrap();
        assert_eq!(account.next_sequence().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_balance_issuer_and_missing_trustline() {
        let fx = fixture();
        let issuer = fx.currency.issuer_account().await.unwrap();
        assert_eq!(issuer.balance(None).unwrap(), Decimal::MAX);

        let other = Asset::new("ELSE", KeyPair::random().public_key());
        let member = fx.add_member(dec("10"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();
        assert_eq!(
            account.balance(Some(&other)).unwrap_err().kind(),
            crate::core::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_pay_insufficient_balance() {
        let fx = fixture();
        let payer = fx.add_member(dec("50"));
        let payee = fx.add_member(dec("0"));
        let account = fx.currency.get_account(&payer.public_key()).await.unwrap();

        let err = account
            .pay(
                Payment {
                    payee: payee.public_key(),
                    amount: dec("50.0000001"),
                },
                PayKeys {
                    account: &payer,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::InsufficientBalance);
        assert!(fx.gateway.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pay_moves_exact_amount_and_emits_transfer() {
        let fx = fixture();
        let events = capture_events(&fx.ledger, &[EventKind::Transfer]);
        let payer = fx.add_member(dec("50"));
        let payee = fx.add_member(dec("5"));
        let account = fx.currency.get_account(&payer.public_key()).await.unwrap();

        let transfer = account
            .pay(
                Payment {
                    payee: payee.public_key(),
                    amount: dec("50"),
                },
                PayKeys {
                    account: &payer,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap();
        assert_eq!(transfer.amount, dec("50"));
        assert_eq!(transfer.payer, payer.public_key());

        account.update().await.unwrap();
        assert_eq!(account.balance(None).unwrap(), dec("0"));
        assert_eq!(
            fx.gateway
                .balance_of(&payee.public_key(), &fx.local_asset()),
            dec("55")
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pay_accepts_admin_signature() {
        let fx = fixture();
        let payer = fx.add_member(dec("20"));
        let payee = fx.add_member(dec("0"));
        let account = fx.currency.get_account(&payer.public_key()).await.unwrap();

        account
            .pay(
                Payment {
                    payee: payee.public_key(),
                    amount: dec("5"),
                },
                PayKeys {
                    account: &fx.keys.admin,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap();

        // A third-party key signs neither alternative.
        let stranger = KeyPair::random();
        let err = account
            .pay(
                Payment {
                    payee: payee.public_key(),
                    amount: dec("5"),
                },
                PayKeys {
                    account: &stranger,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_external_pay_checks_source_amount() {
        let fx = fixture();
        let payer = fx.add_member(dec("10"));
        let account = fx.currency.get_account(&payer.public_key()).await.unwrap();
        let dest_asset = Asset::new("PEAR", KeyPair::random().public_key());
        let quote = PathQuote {
            source_amount: dec("12"),
            source_asset: fx.local_asset(),
            dest_amount: dec("1"),
            dest_asset: dest_asset.clone(),
            path: vec![fx.hour_asset(), Asset::hour(KeyPair::random().public_key())],
        };

        let err = account
            .external_pay(
                ExternalPayment {
                    payee: KeyPair::random().public_key(),
                    amount: dec("1"),
                    quote: quote.clone(),
                },
                PayKeys {
                    account: &payer,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::InsufficientBalance);

        fx.gateway.put_account(
            &payer.public_key(),
            1,
            vec![(fx.local_asset(), dec("12"), crate::core::max_trustline_limit())],
        );
        account.update().await.unwrap();
        let transfer = account
            .external_pay(
                ExternalPayment {
                    payee: KeyPair::random().public_key(),
                    amount: dec("1"),
                    quote,
                },
                PayKeys {
                    account: &payer,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap();
        assert_eq!(transfer.transfer.asset, dest_asset);
        assert_eq!(transfer.source_amount, dec("12"));
        let submitted = fx.gateway.submitted.lock();
        assert!(matches!(
            submitted[0].operations[0],
            Operation::PathPaymentStrictReceive { .. }
        ));
    }

    fn credit_payment(fx: &crate::testutil::Fixture, to: &PublicKey, amount: Decimal) -> PaymentRecord {
        PaymentRecord {
            from: fx.currency.data().credit,
            to: to.clone(),
            asset: fx.local_asset(),
            amount,
            transaction_hash: "aa11".to_string(),
            source_asset: None,
            source_amount: None,
        }
    }

    #[tokio::test]
    async fn test_update_credit_is_idempotent() {
        let fx = fixture();
        let member = fx.add_member(dec("100"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();
        fx.gateway.account_payments.lock().insert(
            member.public_key(),
            vec![credit_payment(&fx, &member.public_key(), dec("100"))],
        );

        let diff = account
            .update_credit(
                dec("100"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: None,
                    credit: None,
                    issuer: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(diff, Decimal::ZERO);
        assert!(fx.gateway.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_credit_repays_with_account_key() {
        let fx = fixture();
        let member = fx.add_member(dec("100"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();
        fx.gateway.account_payments.lock().insert(
            member.public_key(),
            vec![credit_payment(&fx, &member.public_key(), dec("100"))],
        );

        // The account key is mandatory for a repayment.
        let err = account
            .update_credit(
                dec("40"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: None,
                    credit: Some(&fx.keys.credit),
                    issuer: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);

        let diff = account
            .update_credit(
                dec("40"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: Some(&member),
                    credit: None,
                    issuer: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(diff, dec("-60"));
        assert_eq!(
            fx.gateway.balance_of(&member.public_key(), &fx.local_asset()),
            dec("40")
        );
    }

    #[tokio::test]
    async fn test_update_credit_increase_funds_credit_account() {
        let fx = fixture();
        let member = fx.add_member(dec("10"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        let diff = account
            .update_credit(
                dec("50"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: None,
                    credit: Some(&fx.keys.credit),
                    issuer: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(diff, dec("50"));
        assert_eq!(
            fx.gateway.balance_of(&member.public_key(), &fx.local_asset()),
            dec("60")
        );

        // Drain the credit account; the next increase needs issuer funding.
        let credit_pk = fx.currency.data().credit;
        fx.gateway.put_account(
            &credit_pk,
            2,
            vec![(fx.local_asset(), dec("10"), crate::core::max_trustline_limit())],
        );
        let err = account
            .update_credit(
                dec("150"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: None,
                    credit: Some(&fx.keys.credit),
                    issuer: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);

        account
            .update_credit(
                dec("150"),
                UpdateCreditKeys {
                    sponsor: &fx.sponsor,
                    account: None,
                    credit: Some(&fx.keys.credit),
                    issuer: Some(&fx.keys.issuer),
                },
            )
            .await
            .unwrap();
        // Funding arrives in multiples of the starting balance (1000 hours
        // at a 1/10 rate is 10000 local units).
        assert_eq!(
            fx.gateway.balance_of(&credit_pk, &fx.local_asset()),
            dec("10") + dec("10000.0000000") - dec("150")
        );
    }

    #[tokio::test]
    async fn test_update_maximum_balance_noop_on_equal_limit() {
        let fx = fixture();
        let member = KeyPair::random();
        fx.gateway.put_account(
            &member.public_key(),
            0,
            vec![(fx.local_asset(), dec("1"), dec("500"))],
        );
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        account
            .update_maximum_balance(
                Some(dec("500")),
                PayKeys {
                    account: &member,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap();
        assert!(fx.gateway.submitted.lock().is_empty());

        account
            .update_maximum_balance(
                Some(dec("700")),
                PayKeys {
                    account: &member,
                    sponsor: &fx.sponsor,
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.gateway.submitted.lock().len(), 1);
        account.update().await.unwrap();
        assert_eq!(account.maximum_balance().unwrap(), dec("700"));
    }

    #[tokio::test]
    async fn test_delete_returns_balance_to_credit_account() {
        let fx = fixture();
        let member = fx.add_member(dec("30"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();
        let credit_pk = fx.currency.data().credit;
        let before = fx.gateway.balance_of(&credit_pk, &fx.local_asset());

        account
            .delete(AdminKeys {
                admin: &fx.keys.admin,
                sponsor: &fx.sponsor,
            })
            .await
            .unwrap();

        assert_eq!(
            fx.gateway.balance_of(&credit_pk, &fx.local_asset()),
            before + dec("30")
        );
        assert!(!fx.gateway.accounts.lock().contains_key(&member.public_key()));
        // The cached state is invalidated.
        assert_eq!(
            account.balance(None).unwrap_err().kind(),
            crate::core::ErrorKind::Internal
        );
    }

    #[tokio::test]
    async fn test_disable_without_pool_fails_and_leaves_account() {
        let fx = fixture();
        let member = fx.add_member(dec("30"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        let err = account
            .disable(AdminKeys {
                admin: &fx.keys.admin,
                sponsor: &fx.sponsor,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Internal);
        assert!(fx.gateway.submitted.lock().is_empty());
        assert!(fx.gateway.accounts.lock().contains_key(&member.public_key()));
    }

    #[tokio::test]
    async fn test_disable_moves_balance_to_pool() {
        let fx = fixture_with(crate::core::Rate::new(1, 10).unwrap(), true);
        let pool = fx.pool.as_ref().unwrap().public_key();
        let member = fx.add_member(dec("30"));
        let account = fx.currency.get_account(&member.public_key()).await.unwrap();

        account
            .disable(AdminKeys {
                admin: &fx.keys.admin,
                sponsor: &fx.sponsor,
            })
            .await
            .unwrap();
        assert_eq!(fx.gateway.balance_of(&pool, &fx.local_asset()), dec("30"));
        assert!(!fx.gateway.accounts.lock().contains_key(&member.public_key()));
    }
}
