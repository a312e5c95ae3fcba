use std::sync::{Arc, RwLock, PoisonError};

use tracing::warn;

use crate::exchange::Exchange;

/// Hook invoked as exchanges move through a channel. Observers see the
/// handle of the side that performed the action.
pub trait ExchangeObserver: Send + Sync {
    /// The exchange was sent by one side.
    fn on_sent(&self, exchange: &Exchange) -> crate::Result<()> {
        let _ = exchange;
        Ok(())
    }

    /// The exchange was accepted (pulled or pushed) by one side.
    fn on_accepted(&self, exchange: &Exchange) -> crate::Result<()> {
        let _ = exchange;
        Ok(())
    }
}

/// Fan-out over the registered observers. A failing observer is logged and
/// skipped; observation never aborts delivery.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Arc<dyn ExchangeObserver>>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn ExchangeObserver>) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).push(observer);
    }

    pub(crate) fn sent(&self, exchange: &Exchange) {
        for observer in self.inner.read().unwrap_or_else(PoisonError::into_inner).iter() {
            if let Err(e) = observer.on_sent(exchange) {
                warn!(exchange = %exchange.id(), error = %e, "exchange observer failed on sent");
            }
        }
    }

    pub(crate) fn accepted(&self, exchange: &Exchange) {
        for observer in self.inner.read().unwrap_or_else(PoisonError::into_inner).iter() {
            if let Err(e) = observer.on_accepted(exchange) {
                warn!(exchange = %exchange.id(), error = %e, "exchange observer failed on accepted");
            }
        }
    }
}
