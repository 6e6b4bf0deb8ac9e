//! Ledger facade: the entry point tying the gateway, the event bus and the
//! currency orchestrators together.
//!
//! Persistence is entirely the caller's concern: currency data, state and
//! all private keys live outside this engine and are passed in per call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::core::{CurrencyConfig, CurrencyData, CurrencyKeys, CurrencyState, Error, Result};
use crate::currency::{Currency, CurrencyRoleKeys, TraderKeys};
use crate::events::{EventBus, EventKind, HandlerId, LedgerEvent};
use crate::gateway::{AccountRecord, Gateway, SubmitReceipt};
use crate::keys::{KeyPair, PublicKey};
use crate::tx::Transaction;

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Account sponsoring fees and reserves for all currencies.
    pub sponsor_public_key: PublicKey,
    /// Home domain recorded on issuer accounts.
    pub domain: String,
}

/// Top-level handle to the ledger engine.
pub struct Ledger {
    gateway: Arc<dyn Gateway>,
    bus: Arc<EventBus>,
    options: LedgerOptions,
    /// Currencies created through this facade, by code.
    currencies: Mutex<HashMap<String, Arc<Currency>>>,
}

impl Ledger {
    pub fn new(gateway: Arc<dyn Gateway>, options: LedgerOptions) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            bus: EventBus::new(),
            options,
            currencies: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register an event handler. See [`EventBus::on`].
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(LedgerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.bus.off(id)
    }

    /// Generate the five role key pairs for a new currency and install its
    /// on-ledger infrastructure. The caller must persist the returned keys;
    /// the engine keeps none of them.
    pub async fn create_currency(
        &self,
        config: CurrencyConfig,
        sponsor: &KeyPair,
    ) -> Result<CurrencyKeys> {
        let keys = CurrencyKeys::random();
        let data = keys.data();
        let currency = self.build_currency(config, data, None)?;
        currency
            .enable(CurrencyRoleKeys {
                sponsor,
                issuer: &keys.issuer,
                credit: &keys.credit,
                admin: &keys.admin,
                external_issuer: &keys.external_issuer,
                external_trader: &keys.external_trader,
            })
            .await?;
        info!("created currency {}", currency.config().code);
        Ok(keys)
    }

    /// Construct the orchestrator for an existing currency. Pure and
    /// synchronous; the network is not touched.
    pub fn get_currency(
        &self,
        config: CurrencyConfig,
        data: CurrencyData,
        state: Option<CurrencyState>,
    ) -> Result<Arc<Currency>> {
        let currency = self.build_currency(config, data, state)?;
        self.currencies
            .lock()
            .insert(currency.config().code.clone(), currency.clone());
        Ok(currency)
    }

    fn build_currency(
        &self,
        config: CurrencyConfig,
        data: CurrencyData,
        state: Option<CurrencyState>,
    ) -> Result<Arc<Currency>> {
        Currency::new(
            self.gateway.clone(),
            self.bus.clone(),
            self.options.sponsor_public_key.clone(),
            self.options.domain.clone(),
            config,
            data,
            state,
        )
    }

    /// A currency previously obtained through `get_currency`.
    pub fn currency(&self, code: &str) -> Option<Arc<Currency>> {
        self.currencies.lock().get(code).cloned()
    }

    /// Detach all event handlers and stop the streams of every currency
    /// created through this facade. Idempotent.
    pub fn stop(&self) {
        self.bus.clear();
        for currency in self.currencies.lock().values() {
            currency.stop();
        }
    }

    /// Low-level primitive: load the current state of any account.
    pub async fn load_account(&self, id: &PublicKey) -> Result<AccountRecord> {
        self.gateway.load_account(id).await
    }

    /// Low-level primitive: submit an already signed transaction.
    pub async fn submit(&self, tx: &Transaction) -> Result<SubmitReceipt> {
        self.gateway.submit(tx).await
    }
}

/// Register the expected `IncomingHourTrade` handler: whenever the external
/// trader of a currency takes in a foreign bridge asset, its sell offer for
/// that asset is resized to the new balance, keeping the order book in line
/// with actual liquidity.
///
/// `resolve` maps a currency code to the sponsor and trader keys, typically
/// by decrypting them from the caller's store.
pub fn rebalance_on_hour_trade<F, Fut>(ledger: &Arc<Ledger>, resolve: F) -> HandlerId
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(KeyPair, KeyPair)>> + Send + 'static,
{
    // The bus outlives this handler; a weak reference avoids keeping the
    // facade alive from its own handler list.
    let weak = Arc::downgrade(ledger);
    let resolve = Arc::new(resolve);
    ledger.bus().on(EventKind::IncomingHourTrade, move |event| {
        let weak = weak.clone();
        let resolve = resolve.clone();
        async move {
            let LedgerEvent::IncomingHourTrade {
                currency: code,
                external_hour,
            } = event
            else {
                return Ok(());
            };
            let Some(ledger) = weak.upgrade() else {
                return Ok(());
            };
            let currency = ledger
                .currency(&code)
                .ok_or_else(|| Error::NotFound(format!("unknown currency {code}")))?;
            let (sponsor, external_trader) = resolve(code).await?;
            currency
                .update_external_offer(
                    &external_hour,
                    TraderKeys {
                        sponsor: &sponsor,
                        external_trader: &external_trader,
                    },
                    None,
                )
                .await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Asset;
    use crate::testutil::fixture;
    use rust_decimal::Decimal;
    use std::time::Duration;

    #[tokio::test]
    async fn test_currency_registry_lookup() {
        let fx = fixture();
        let found = fx.ledger.currency("WORK").unwrap();
        assert_eq!(found.config().code, "WORK");
        assert!(fx.ledger.currency("NONE").is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = fixture();
        fx.ledger.on(crate::events::EventKind::Transfer, |_| async { Ok(()) });
        fx.currency.start();
        fx.ledger.stop();
        fx.ledger.stop();
        // Handlers are detached.
        assert!(!fx.ledger.off(1));
    }

    #[tokio::test]
    async fn test_rebalance_handler_updates_offer() {
        let fx = fixture();
        let foreign = Asset::hour(crate::keys::KeyPair::random().public_key());
        let data = fx.currency.data();
        // The trader took in 3 foreign hours through a trade.
        fx.gateway.put_account(
            &data.external_trader,
            0,
            vec![
                (fx.local_asset(), Decimal::ZERO, crate::core::max_trustline_limit()),
                (fx.hour_asset(), Decimal::ZERO, crate::core::max_trustline_limit()),
                (foreign.clone(), Decimal::from(3), Decimal::from(10)),
            ],
        );

        let sponsor = fx.sponsor.clone();
        let trader = fx.keys.external_trader.clone();
        rebalance_on_hour_trade(&fx.ledger, move |_code| {
            let keys = (sponsor.clone(), trader.clone());
            async move { Ok(keys) }
        });

        fx.ledger.bus().emit(LedgerEvent::IncomingHourTrade {
            currency: "WORK".to_string(),
            external_hour: foreign.clone(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let offers = fx.gateway.offers.lock();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].selling, foreign);
        assert_eq!(offers[0].buying, fx.hour_asset());
        assert_eq!(offers[0].amount, Decimal::from(3));
    }
}
