//! Typed event bus for ledger activity.
//!
//! Events are a tagged union dispatched to per-kind handlers on spawned
//! tasks. A handler that fails is caught at the dispatch site and its error
//! republished as an [`LedgerEvent::Error`] instead of unwinding into
//! unrelated call stacks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::error;

use crate::core::{Asset, CurrencyState, Error, ErrorKind, ExternalTransfer, Result, Transfer};

/// Event classes a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transfer,
    IncomingTransfer,
    OutgoingTransfer,
    IncomingHourTrade,
    ExternalOfferUpdated,
    StateUpdated,
    Error,
}

/// A change to one of the external trader's offers.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferUpdate {
    pub selling: Asset,
    pub buying: Asset,
    pub amount: Decimal,
    pub created: bool,
}

/// Ledger activity, tagged by the code of the currency it concerns.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// A local payment was made.
    Transfer { currency: String, transfer: Transfer },
    /// An external payment was received.
    IncomingTransfer {
        currency: String,
        transfer: ExternalTransfer,
    },
    /// An external payment was sent.
    OutgoingTransfer {
        currency: String,
        transfer: ExternalTransfer,
    },
    /// The external trader exchanged bridge assets; its offers need
    /// rebalancing via `update_external_offer`.
    IncomingHourTrade {
        currency: String,
        external_hour: Asset,
    },
    /// An offer of the external trader was created or resized.
    ExternalOfferUpdated { currency: String, offer: OfferUpdate },
    /// The currency state changed and should be persisted by the caller.
    StateUpdated {
        currency: String,
        state: CurrencyState,
    },
    /// A handler or stream failed.
    Error { kind: ErrorKind, message: String },
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::Transfer { .. } => EventKind::Transfer,
            LedgerEvent::IncomingTransfer { .. } => EventKind::IncomingTransfer,
            LedgerEvent::OutgoingTransfer { .. } => EventKind::OutgoingTransfer,
            LedgerEvent::IncomingHourTrade { .. } => EventKind::IncomingHourTrade,
            LedgerEvent::ExternalOfferUpdated { .. } => EventKind::ExternalOfferUpdated,
            LedgerEvent::StateUpdated { .. } => EventKind::StateUpdated,
            LedgerEvent::Error { .. } => EventKind::Error,
        }
    }
}

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(LedgerEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Process-wide bus shared by a ledger facade and its currencies.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register an async handler for one event kind.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(LedgerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns whether it was still registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Remove all handlers.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Dispatch an event to all matching handlers, each on its own task.
    pub fn emit(self: &Arc<Self>, event: LedgerEvent) {
        let kind = event.kind();
        for handler in self.handlers_for(kind) {
            let event = event.clone();
            let bus = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handler(event).await {
                    if kind == EventKind::Error {
                        // Never recurse through failing error handlers.
                        error!("error handler failed: {err}");
                    } else {
                        bus.emit_error(&err);
                    }
                }
            });
        }
    }

    /// Publish an error on the bus, or log it if nobody listens.
    pub fn emit_error(self: &Arc<Self>, err: &Error) {
        if self.handlers_for(EventKind::Error).is_empty() {
            error!("unhandled ledger error: {err}");
            return;
        }
        self.emit(LedgerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}
