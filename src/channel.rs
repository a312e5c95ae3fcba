use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::broker::Broker;
use crate::config::{ActivationSpec, BusConfig};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeKey, TxLock};
use crate::factory::ExchangeFactory;
use crate::observer::Observers;
use crate::packet::ErrorInfo;
use crate::pattern::{ExchangeStatus, Role, SyncState, TxState};
use crate::registry::{ComponentId, Registry};
use crate::tx::TransactionManager;

/// Implemented by components that want exchanges pushed to them on the
/// sender's thread instead of pulling from [`DeliveryChannel::accept`].
pub trait ExchangeHandler: Send + Sync {
    fn handle(&self, exchange: Exchange) -> Result<()>;
}

enum Poll {
    Item(Exchange),
    Empty,
    Closed,
}

/// Bounded inbound queue. Senders block while it is full; closing drains it
/// and releases everyone.
struct BoundedQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct QueueState {
    items: VecDeque<Exchange>,
    closed: bool,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        BoundedQueue {
            state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).items.len()
    }

    /// Blocks while the queue is full. On a closed queue the exchange is
    /// handed back to the caller.
    fn put(&self, exchange: Exchange) -> std::result::Result<(), Exchange> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.items.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(exchange);
        }
        state.items.push_back(exchange);
        self.not_empty.notify_one();
        Ok(())
    }

    fn poll(&self, timeout: Option<Duration>) -> Poll {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(exchange) = state.items.pop_front() {
                self.not_full.notify_one();
                return Poll::Item(exchange);
            }
            if state.closed {
                return Poll::Closed;
            }
            match deadline {
                None => {
                    state = self.not_empty.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Poll::Empty;
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    fn close(&self) -> Vec<Exchange> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        let drained = state.items.drain(..).collect();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        drained
    }
}

enum Waiter {
    /// A thread blocked in send_sync waiting for the answer.
    Answer(Exchange),
    /// A thread parked on a transactional rendezvous.
    Lock(Arc<TxLock>),
}

/// The single conduit through which one component talks to the bus.
///
/// Outbound, [`send`](DeliveryChannel::send) hands the exchange to the
/// broker for routing; [`send_sync`](DeliveryChannel::send_sync) does the
/// same but parks the calling thread until the answer comes back. Inbound,
/// exchanges land on a bounded queue consumed through
/// [`accept`](DeliveryChannel::accept), or are pushed straight into the
/// component's [`ExchangeHandler`] when one is registered and optimized
/// delivery is on.
pub struct DeliveryChannel {
    component: ComponentId,
    spec: ActivationSpec,
    config: BusConfig,
    broker: Weak<Broker>,
    registry: Arc<Registry>,
    tx: Arc<dyn TransactionManager>,
    observers: Observers,
    queue: BoundedQueue,
    closed: Arc<AtomicBool>,
    throttle_count: Mutex<u32>,
    /// Outstanding synchronous sends, so that a reply which round-tripped
    /// through a marshalling flow can be folded back into the instance the
    /// sender is blocked on.
    pending: DashMap<ExchangeKey, Exchange>,
    waiters: DashMap<u64, Waiter>,
    next_waiter: AtomicU64,
    handler: Mutex<Option<Arc<dyn ExchangeHandler>>>,
}

impl DeliveryChannel {
    pub(crate) fn new(
        spec: ActivationSpec,
        config: BusConfig,
        broker: Weak<Broker>,
        registry: Arc<Registry>,
        tx: Arc<dyn TransactionManager>,
        observers: Observers,
    ) -> Arc<DeliveryChannel> {
        Arc::new(DeliveryChannel {
            component: ComponentId::new(spec.component.clone()),
            queue: BoundedQueue::new(spec.queue_capacity),
            spec,
            config,
            broker,
            registry,
            tx,
            observers,
            closed: Arc::new(AtomicBool::new(false)),
            throttle_count: Mutex::new(0),
            pending: DashMap::new(),
            waiters: DashMap::new(),
            next_waiter: AtomicU64::new(0),
            handler: Mutex::new(None),
        })
    }

    pub fn component(&self) -> &ComponentId {
        &self.component
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of exchanges waiting in the inbound queue.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Register a push handler; takes effect for subsequent deliveries.
    pub fn set_handler(&self, handler: Arc<dyn ExchangeHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Factory pre-stamped with this component's addressing defaults.
    pub fn exchange_factory(&self) -> ExchangeFactory {
        ExchangeFactory::new(self.component.clone(), &self.spec, self.closed.clone())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed(self.component.to_string()))
        } else {
            Ok(())
        }
    }

    /// Route an exchange through the broker, fire and forget.
    pub fn send(&self, exchange: &Exchange) -> Result<()> {
        self.check_open()?;
        debug!(component = %self.component, exchange = %exchange.id(), "send");
        exchange.set_synchronous(false);
        self.do_send(exchange, false)
    }

    /// Route an exchange and block until the other side answers.
    ///
    /// Returns true when the answer arrived, false when the call timed out
    /// or the exchange was aborted; in the latter case the exchange is
    /// latched to Error. `None` waits forever, a zero duration polls once
    /// and gives up immediately.
    pub fn send_sync(&self, exchange: &Exchange, timeout: Option<Duration>) -> Result<bool> {
        self.check_open()?;
        debug!(component = %self.component, exchange = %exchange.id(), "send_sync");
        exchange.set_synchronous(true);
        let key = exchange.key();
        self.pending.insert(key.clone(), exchange.clone());
        let result = self.send_sync_inner(exchange, timeout);
        self.pending.remove(&key);
        result
    }

    fn send_sync_inner(&self, exchange: &Exchange, timeout: Option<Duration>) -> Result<bool> {
        self.do_send(exchange, true)?;
        if exchange.sync_state() != SyncState::SyncReceived {
            let waiter = self.add_waiter(Waiter::Answer(exchange.clone()));
            exchange.wait_for_answer(timeout);
            self.waiters.remove(&waiter);
        } else {
            debug!(exchange = %exchange.id(), "already answered, no need to wait");
        }
        if exchange.sync_state() == SyncState::SyncReceived {
            exchange.handle_accept()?;
            self.resume_tx(exchange)?;
            self.observers.accepted(exchange);
            Ok(true)
        } else {
            debug!(exchange = %exchange.id(), "synchronous send was not answered");
            exchange.abort(ErrorInfo::timeout(format!(
                "send_sync timeout for {}",
                exchange.id()
            )));
            Ok(false)
        }
    }

    fn do_send(&self, exchange: &Exchange, sync: bool) -> Result<()> {
        let mirror = exchange.mirror();
        let finished = exchange.status().is_terminal();
        let result = (|| {
            // A thread may have given up on this exchange already.
            if exchange.aborted() {
                return Err(Error::Aborted(exchange.id()));
            }
            self.auto_enlist(exchange)?;
            self.auto_set_persistent(exchange);
            if exchange.role() == Role::Consumer && exchange.status() == ExchangeStatus::Active {
                // Only requests leaving a consumer are throttled, never
                // answers or acknowledgements.
                self.throttle();
            }
            if exchange.role() == Role::Consumer {
                exchange.set_source_id(self.component.clone());
            }
            // Observers run before ownership changes hands.
            self.observers.sent(exchange);
            exchange.handle_send(sync)?;
            mirror.set_tx_state(TxState::None);
            // The terminal ack of a synchronous transactional exchange is
            // not part of the transaction any more.
            if finished
                && exchange.tx_lock().is_none()
                && exchange.tx_state() == TxState::Conveyed
                && !exchange.push_delivered()
                && exchange.role() == Role::Consumer
            {
                exchange.set_transaction(None);
            }
            let broker = self
                .broker
                .upgrade()
                .ok_or_else(|| Error::Closed(self.component.to_string()))?;
            broker.send_exchange(&mirror)
        })();
        // The sender holds a tx rendezvous: hand the transaction over and
        // release the parked thread, whatever happened above.
        if let Some(lock) = exchange.detach_tx_lock() {
            if mirror.tx_state() == TxState::Enlisted {
                self.suspend_tx(&mirror);
            }
            lock.notify();
        }
        result
    }

    /// Pull the next inbound exchange, blocking until one arrives.
    pub fn accept(&self) -> Result<Option<Exchange>> {
        self.accept_timeout(None)
    }

    /// Pull the next inbound exchange, waiting at most `timeout`. Returns
    /// Ok(None) when nothing arrived in time.
    pub fn accept_timeout(&self, timeout: Option<Duration>) -> Result<Option<Exchange>> {
        self.check_open()?;
        let exchange = match self.queue.poll(timeout) {
            Poll::Item(exchange) => exchange,
            Poll::Empty => return Ok(None),
            Poll::Closed => return Err(Error::Closed(self.component.to_string())),
        };
        if exchange.aborted() {
            // A thread gave up on it while it sat in the queue; the
            // component never sees it.
            debug!(component = %self.component, exchange = %exchange.id(), "discarding aborted exchange");
            return Ok(None);
        }
        trace!(component = %self.component, exchange = %exchange.id(), "accepting");
        if let Some(lock) = exchange.tx_lock() {
            if exchange.status().is_terminal() {
                // Finished rendezvous delivery: release the parked sender,
                // do not resume its transaction here.
                lock.notify();
                exchange.handle_accept()?;
            } else {
                self.resume_tx(&exchange)?;
                exchange.handle_accept()?;
            }
        } else if exchange.transaction().is_some() && exchange.status().is_terminal() {
            // Transactionally delivered finished exchange; nothing to resume.
            exchange.handle_accept()?;
        } else {
            self.resume_tx(&exchange)?;
            exchange.handle_accept()?;
        }
        self.observers.accepted(&exchange);
        Ok(Some(exchange))
    }

    /// Inbound entry point used by flows to hand an exchange to this
    /// component.
    pub fn process_inbound(&self, incoming: Exchange) -> Result<()> {
        trace!(component = %self.component, exchange = %incoming.id(), "processing inbound exchange");
        self.check_open()?;
        // Fold a round-tripped copy back into the pending original.
        let me = if let Some(original) = self.pending.get(&incoming.key()).map(|e| e.value().clone())
        {
            if !original.same_core(&incoming) {
                original.copy_from(&incoming);
            }
            original
        } else {
            incoming
        };

        // Answer to a synchronous send: wake the parked sender instead of
        // queueing.
        if me.sync_state() == SyncState::SyncSent {
            self.suspend_tx(&me);
            me.set_sync_state(SyncState::SyncReceived);
            me.notify_answered();
            return Ok(());
        }

        // Push delivery on the sending thread.
        let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            if self.config.optimized_delivery {
                me.handle_accept()?;
                trace!(component = %self.component, exchange = %me.id(), "pushed");
                self.observers.accepted(&me);
                // Transaction boundaries differ for pushed exchanges.
                me.set_push_delivered(true);
                return handler.handle(me);
            }
        }

        // Pull delivery. A transacted active exchange needs its transaction
        // detached from this thread; unless the transaction is conveyed with
        // the exchange, the thread must also park until the answer is sent
        // so the transaction can be handed back to it.
        if me.transaction().is_some() && me.status() == ExchangeStatus::Active {
            if me.tx_state() == TxState::Conveyed {
                self.suspend_tx(&me);
                self.put_queue(me);
            } else {
                let lock = TxLock::new();
                me.attach_tx_lock(lock.clone());
                self.suspend_tx(&me);
                self.put_queue(me.clone());
                // A failed enqueue aborts the exchange, which wakes the
                // lock; the wait below still ends. The lock is detached and
                // the transaction resumed on every path out of here.
                let waiter = self.add_waiter(Waiter::Lock(lock.clone()));
                lock.wait();
                self.waiters.remove(&waiter);
                me.detach_tx_lock();
                self.resume_tx(&me)?;
            }
        } else {
            self.put_queue(me);
        }
        Ok(())
    }

    /// Enqueue for pull delivery. When the queue was closed underneath us
    /// the exchange is marked aborted and dropped, never bounced back to the
    /// sender.
    fn put_queue(&self, exchange: Exchange) {
        if let Err(exchange) = self.queue.put(exchange) {
            debug!(exchange = %exchange.id(), "aborted, channel closed while enqueueing");
            exchange.abort(ErrorInfo::aborted("delivery channel closed"));
        }
    }

    fn add_waiter(&self, waiter: Waiter) -> u64 {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.waiters.insert(id, waiter);
        id
    }

    /// Close the channel: fail subsequent calls, drain the queue and
    /// release every blocked thread. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(component = %self.component, "closing delivery channel");
        for exchange in self.queue.close() {
            // A sender may be parked on the mirror of a queued exchange.
            let mirror = exchange.mirror();
            if exchange.transaction().is_some() && mirror.sync_state() == SyncState::SyncSent {
                mirror.notify_answered();
            }
        }
        for entry in self.waiters.iter() {
            match entry.value() {
                Waiter::Answer(exchange) => {
                    exchange.abort(ErrorInfo::aborted("delivery channel closed"));
                }
                Waiter::Lock(lock) => lock.wake(),
            }
        }
        for endpoint in self.registry.endpoints_for_component(&self.component) {
            self.registry.deactivate_endpoint(&endpoint.service, &endpoint.name);
        }
    }

    /// Wake every thread blocked on an outstanding synchronous send. The
    /// woken senders observe an unanswered exchange and report failure.
    pub fn cancel_pending_exchanges(&self) {
        for entry in self.pending.iter() {
            entry.value().notify_answered();
        }
    }

    fn auto_enlist(&self, exchange: &Exchange) -> Result<()> {
        if !self.config.auto_enlist {
            return Ok(());
        }
        if let Some(current) = self.tx.current() {
            match exchange.transaction() {
                None => exchange.set_transaction(Some(current)),
                Some(existing) if existing != current => {
                    return Err(Error::Transaction(
                        "the transaction carried by the exchange is not bound to the current thread"
                            .into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn auto_set_persistent(&self, exchange: &Exchange) {
        if exchange.persistent().is_none() {
            let persistent = self.spec.persistent.unwrap_or(self.config.persistent);
            exchange.set_persistent(persistent);
        }
    }

    /// Pause the sending thread on every interval-th outbound request.
    fn throttle(&self) {
        let Some(throttling) = &self.spec.throttling else {
            return;
        };
        let pause = {
            let mut count = self.throttle_count.lock().unwrap_or_else(PoisonError::into_inner);
            if *count + 1 >= throttling.interval {
                *count = 0;
                true
            } else {
                *count += 1;
                false
            }
        };
        if pause {
            debug!(component = %self.component, timeout_ms = throttling.timeout_ms, "throttling");
            std::thread::sleep(Duration::from_millis(throttling.timeout_ms));
        }
    }

    /// Detach the exchange's transaction from the calling thread. A mismatch
    /// between the thread's transaction and the exchange's aborts the
    /// exchange rather than failing the call.
    fn suspend_tx(&self, exchange: &Exchange) {
        if let Some(token) = exchange.transaction() {
            debug!(exchange = %exchange.id(), "suspending transaction");
            match self.tx.suspend() {
                Ok(Some(suspended)) if suspended == token => {}
                Ok(_) => {
                    warn!(exchange = %exchange.id(), "aborted, transaction not bound to the current thread");
                    exchange.abort(ErrorInfo::aborted(
                        "the transaction carried by the exchange is not bound to the current thread",
                    ));
                }
                Err(e) => {
                    warn!(exchange = %exchange.id(), error = %e, "aborted due to transaction error");
                    exchange.abort(ErrorInfo::other(e.to_string()));
                }
            }
        }
    }

    fn resume_tx(&self, exchange: &Exchange) -> Result<()> {
        if let Some(token) = exchange.transaction() {
            debug!(exchange = %exchange.id(), "resuming transaction");
            self.tx
                .resume(token)
                .map_err(|e| Error::Transaction(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("component", &self.component)
            .field("closed", &self.is_closed())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ErrorKind, Message};
    use crate::pattern::{Pattern, Slot};
    use crate::tx::{NoopTransactionManager, ThreadBoundTransactionManager};
    use serde_json::json;
    use std::thread;

    fn test_channel(spec: ActivationSpec) -> Arc<DeliveryChannel> {
        DeliveryChannel::new(
            spec,
            BusConfig::default(),
            Weak::new(),
            Arc::new(Registry::new()),
            Arc::new(NoopTransactionManager),
            Observers::new(),
        )
    }

    #[test]
    fn queue_blocks_when_full_and_drains_in_order() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.put(Exchange::new(Pattern::InOnly)).unwrap();

        let q = queue.clone();
        let second = Exchange::new(Pattern::InOnly);
        let second_id = second.id();
        let producer = thread::spawn(move || q.put(second).is_ok());

        thread::sleep(Duration::from_millis(20));
        let first = match queue.poll(Some(Duration::from_millis(100))) {
            Poll::Item(e) => e,
            _ => panic!("expected an exchange"),
        };
        assert!(producer.join().unwrap());
        let next = match queue.poll(Some(Duration::from_millis(100))) {
            Poll::Item(e) => e,
            _ => panic!("expected the blocked producer's exchange"),
        };
        assert_ne!(first.id(), next.id());
        assert_eq!(next.id(), second_id);
    }

    #[test]
    fn queue_close_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.put(Exchange::new(Pattern::InOnly)).unwrap();

        let q = queue.clone();
        let producer = thread::spawn(move || q.put(Exchange::new(Pattern::InOnly)));
        thread::sleep(Duration::from_millis(20));

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        // The blocked producer gets its exchange back.
        assert!(producer.join().unwrap().is_err());
        assert!(matches!(queue.poll(None), Poll::Closed));
    }

    #[test]
    fn accept_times_out_with_none() {
        let channel = test_channel(ActivationSpec::new("echo"));
        let got = channel.accept_timeout(Some(Duration::from_millis(10))).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn closed_channel_rejects_everything() {
        let channel = test_channel(ActivationSpec::new("echo"));
        channel.close();
        channel.close(); // idempotent

        assert!(matches!(channel.accept(), Err(Error::Closed(_))));
        let exchange = Exchange::new(Pattern::InOnly);
        assert!(matches!(channel.send(&exchange), Err(Error::Closed(_))));
        assert!(matches!(channel.send_sync(&exchange, None), Err(Error::Closed(_))));
        assert!(matches!(channel.exchange_factory().in_only(), Err(Error::Closed(_))));
    }

    #[test]
    fn close_deactivates_component_endpoints() {
        let registry = Arc::new(Registry::new());
        let channel = DeliveryChannel::new(
            ActivationSpec::new("echo"),
            BusConfig::default(),
            Weak::new(),
            registry.clone(),
            Arc::new(NoopTransactionManager),
            Observers::new(),
        );
        registry
            .activate_endpoint(crate::registry::Endpoint {
                component: channel.component().clone(),
                service: "echo-svc".into(),
                name: "main".into(),
                interface: None,
            })
            .unwrap();

        channel.close();
        assert!(registry.endpoint("echo-svc", "main").is_none());
    }

    #[test]
    fn close_wakes_a_blocked_accept() {
        let channel = test_channel(ActivationSpec::new("echo"));
        let blocked = channel.clone();
        let waiter = thread::spawn(move || blocked.accept());
        thread::sleep(Duration::from_millis(30));
        channel.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Closed(_))));
    }

    #[test]
    fn aborted_exchanges_are_discarded_on_accept() {
        let channel = test_channel(ActivationSpec::new("echo"));
        let exchange = Exchange::new(Pattern::InOnly);
        exchange.abort(ErrorInfo::aborted("gave up"));
        channel.queue.put(exchange).unwrap();

        let got = channel.accept_timeout(Some(Duration::from_millis(10))).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn failed_enqueue_aborts_the_exchange_without_an_error() {
        let channel = test_channel(ActivationSpec::new("echo"));
        channel.queue.close();

        let exchange = Exchange::new(Pattern::InOnly);
        channel.put_queue(exchange.clone());
        assert!(exchange.aborted());
        assert_eq!(exchange.error().unwrap().kind, ErrorKind::Aborted);
    }

    #[test]
    fn transacted_rendezvous_releases_the_tx_when_the_queue_closes() {
        let tm = Arc::new(ThreadBoundTransactionManager::new());
        let channel = DeliveryChannel::new(
            ActivationSpec::new("echo"),
            BusConfig::default(),
            Weak::new(),
            Arc::new(Registry::new()),
            tm.clone(),
            Observers::new(),
        );
        // The queue closes between the open check and the enqueue.
        channel.queue.close();

        let token = tm.begin().unwrap();
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.set_transaction(Some(token));
        consumer.handle_send(false).unwrap();
        let provider = consumer.mirror();

        channel.process_inbound(provider.clone()).unwrap();
        // The enqueue failed, but the lock is gone and the transaction is
        // back on this thread.
        assert!(provider.aborted());
        assert!(provider.tx_lock().is_none());
        assert_eq!(tm.current(), Some(token));
        tm.commit().unwrap();
    }

    #[test]
    fn throttle_pauses_every_interval() {
        let channel = test_channel(ActivationSpec::new("echo").with_throttling(3, 40));
        let start = Instant::now();
        channel.throttle();
        channel.throttle();
        assert!(start.elapsed() < Duration::from_millis(30), "early sends must not pause");
        channel.throttle(); // third send pays the pause
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
