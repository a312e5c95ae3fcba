use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::packet::ErrorInfo;
use crate::pattern::{ExchangeStatus, Role, TxState};
use crate::registry::{ComponentId, Registry};
use crate::tx::TransactionManager;

/// A routing strategy. The broker hands each exchange to the first flow
/// that claims it.
pub trait Flow: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this flow is able to carry the given exchange.
    fn can_handle(&self, exchange: &Exchange) -> bool {
        let _ = exchange;
        true
    }

    /// Carry the exchange to its target component. The handle passed in is
    /// the target side's.
    fn send(&self, exchange: Exchange) -> Result<()>;

    fn shutdown(&self);
}

/// Deliver the exchange into the target component's channel. Providers are
/// looked up by destination, answers travel back to the source.
pub fn do_routing(registry: &Registry, exchange: Exchange) -> Result<()> {
    let id = match exchange.role() {
        Role::Provider => exchange.destination_id(),
        Role::Consumer => exchange.source_id(),
    }
    .ok_or_else(|| Error::NoRoute {
        id: exchange.id(),
        service: exchange.service(),
        interface: exchange.interface(),
    })?;
    let channel = registry.channel(&id)?;
    if channel.is_closed() {
        return Err(Error::ComponentStopped(id.to_string()));
    }
    channel.process_inbound(exchange)
}

/// Routes on the calling thread. Transaction and sync context carry over
/// untouched, so this flow handles every exchange.
pub struct StraightThroughFlow {
    registry: Arc<Registry>,
}

impl StraightThroughFlow {
    pub fn new(registry: Arc<Registry>) -> Self {
        StraightThroughFlow { registry }
    }
}

impl Flow for StraightThroughFlow {
    fn name(&self) -> &str {
        "st"
    }

    fn send(&self, exchange: Exchange) -> Result<()> {
        trace!(exchange = %exchange.id(), "routing straight through");
        do_routing(&self.registry, exchange)
    }

    fn shutdown(&self) {}
}

struct SedaQueue {
    sender: mpsc::Sender<Exchange>,
    worker: JoinHandle<()>,
}

/// Staged delivery: each destination component gets a dedicated queue and
/// worker thread, decoupling sender from receiver.
pub struct SedaFlow {
    registry: Arc<Registry>,
    tx: Arc<dyn TransactionManager>,
    queues: DashMap<ComponentId, SedaQueue>,
}

impl SedaFlow {
    pub fn new(registry: Arc<Registry>, tx: Arc<dyn TransactionManager>) -> Self {
        SedaFlow { registry, tx, queues: DashMap::new() }
    }

    fn enqueue(&self, id: ComponentId, exchange: Exchange) -> Result<()> {
        let sender = self
            .queues
            .entry(id.clone())
            .or_insert_with(|| self.start_queue(id.clone()))
            .sender
            .clone();
        sender
            .send(exchange)
            .map_err(|_| Error::ComponentStopped(id.to_string()))
    }

    fn start_queue(&self, id: ComponentId) -> SedaQueue {
        debug!(component = %id, "starting seda queue");
        let (sender, receiver) = mpsc::channel::<Exchange>();
        let registry = self.registry.clone();
        let tx = self.tx.clone();
        let worker = std::thread::spawn(move || {
            for exchange in receiver {
                trace!(component = %id, exchange = %exchange.id(), "dequeued");
                let result = resume_and_route(&registry, tx.as_ref(), &exchange);
                if let Err(e) = result {
                    error!(component = %id, exchange = %exchange.id(), error = %e, "error routing exchange");
                    exchange.abort(ErrorInfo::other(e.to_string()));
                    exchange.mirror().notify_answered();
                }
            }
        });
        SedaQueue { sender, worker }
    }
}

fn resume_and_route(
    registry: &Registry,
    tx: &dyn TransactionManager,
    exchange: &Exchange,
) -> Result<()> {
    if let Some(token) = exchange.transaction() {
        tx.resume(token).map_err(|e| Error::Transaction(e.to_string()))?;
    }
    do_routing(registry, exchange.clone())
}

impl Flow for SedaFlow {
    fn name(&self) -> &str {
        "seda"
    }

    fn can_handle(&self, exchange: &Exchange) -> bool {
        if exchange.persistent() == Some(true) {
            return false;
        }
        // An active transacted exchange must stay on the sending thread so
        // the transaction rendezvous works, unless it was sent synchronously.
        if exchange.transaction().is_some()
            && !exchange.synchronous()
            && exchange.status() == ExchangeStatus::Active
        {
            return false;
        }
        true
    }

    fn send(&self, exchange: Exchange) -> Result<()> {
        let id = match exchange.role() {
            Role::Provider => exchange.destination_id(),
            Role::Consumer => exchange.source_id(),
        }
        .ok_or_else(|| Error::NoRoute {
            id: exchange.id(),
            service: exchange.service(),
            interface: exchange.interface(),
        })?;
        if exchange.transaction().is_some() {
            exchange.set_tx_state(TxState::Conveyed);
            if let Some(token) = exchange.transaction() {
                // Hand the transaction to the worker thread.
                match self.tx.suspend() {
                    Ok(Some(suspended)) if suspended == token => {}
                    Ok(_) => {
                        return Err(Error::Transaction(
                            "the transaction carried by the exchange is not bound to the current thread"
                                .into(),
                        ));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.enqueue(id, exchange)
    }

    fn shutdown(&self) {
        let ids: Vec<ComponentId> = self.queues.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, queue)) = self.queues.remove(&id) {
                drop(queue.sender);
                if queue.worker.join().is_err() {
                    warn!(component = %id, "seda worker panicked");
                }
            }
        }
    }
}
