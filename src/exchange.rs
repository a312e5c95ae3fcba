use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::{ErrorInfo, ExchangePacket, Message};
use crate::pattern::{ExchangeStatus, Pattern, Role, Slot, SyncState, TxState};
use crate::registry::ComponentId;
use crate::states::{
    self, CAN_OWNER, CAN_SEND, Caps, StateRow, outcome, slot_cap, status_cap, transition_table,
};
use crate::tx::TxToken;

/// Correlation key of one side of an exchange, e.g. `consumer:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeKey(pub Role, pub String);

impl fmt::Display for ExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Rendezvous used when a transacted exchange must hold the sending thread
/// until the receiver is done with it.
#[derive(Debug, Default)]
pub(crate) struct TxLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    notified: bool,
    woken: bool,
}

impl TxLock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(TxLock::default())
    }

    /// Mark the rendezvous complete and release any waiter.
    pub(crate) fn notify(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.notified = true;
        self.cond.notify_all();
    }

    /// Release any waiter without completing the rendezvous, e.g. on close.
    pub(crate) fn wake(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.woken = true;
        self.cond.notify_all();
    }

    /// Block until notified or woken. Both are latched, so a wake that lands
    /// before the waiter arrives is not lost. Returns true when the
    /// rendezvous actually completed.
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.notified && !state.woken {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.notified
    }
}

/// Per-side bookkeeping; never travels on the wire.
#[derive(Debug, Default)]
struct SideState {
    state: usize,
    sync_state: SyncState,
    tx_state: TxState,
    push_delivered: bool,
    tx_lock: Option<Arc<TxLock>>,
}

#[derive(Debug)]
struct Shared {
    packet: ExchangePacket,
    sides: [SideState; 2],
    wakes: u64,
}

#[derive(Debug)]
struct ExchangeCore {
    shared: Mutex<Shared>,
    answered: Condvar,
}

/// One side's handle on a message exchange.
///
/// The two handles of an exchange (consumer and provider) share a single
/// packet and state record; [`Exchange::mirror`] yields the opposite handle.
/// All state checks are made against the transition table of the handle's
/// own role, so ownership alternates between the two sides as the exchange
/// is sent back and forth.
#[derive(Clone)]
pub struct Exchange {
    core: Arc<ExchangeCore>,
    role: Role,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock_shared();
        f.debug_struct("Exchange")
            .field("id", &shared.packet.exchange_id)
            .field("pattern", &shared.packet.pattern)
            .field("role", &self.role)
            .field("status", &shared.packet.status)
            .field("state", &shared.sides[self.role.index()].state)
            .finish()
    }
}

impl Exchange {
    /// A fresh exchange, held by the consumer side.
    pub fn new(pattern: Pattern) -> Self {
        Exchange::from_packet(ExchangePacket::new(pattern))
    }

    pub(crate) fn from_packet(packet: ExchangePacket) -> Self {
        Exchange {
            core: Arc::new(ExchangeCore {
                shared: Mutex::new(Shared { packet, sides: Default::default(), wakes: 0 }),
                answered: Condvar::new(),
            }),
            role: Role::Consumer,
        }
    }

    /// The opposite side's handle on the same exchange.
    pub fn mirror(&self) -> Exchange {
        Exchange { core: self.core.clone(), role: self.role.opposite() }
    }

    /// True when both handles refer to the same underlying exchange.
    pub fn same_core(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> String {
        self.lock_shared().packet.exchange_id.clone()
    }

    pub fn pattern(&self) -> Pattern {
        self.lock_shared().packet.pattern
    }

    /// Correlation key for this side, used to pair replies with pending
    /// synchronous sends.
    pub fn key(&self) -> ExchangeKey {
        ExchangeKey(self.role, self.id())
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.core.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row(&self, shared: &MutexGuard<'_, Shared>) -> &'static StateRow {
        let table = transition_table(shared.packet.pattern, self.role);
        &table[shared.sides[self.role.index()].state]
    }

    /// Capability check against this side's current state.
    pub fn can(&self, cap: Caps) -> bool {
        let shared = self.lock_shared();
        self.row(&shared).can(cap)
    }

    // ---- packet accessors -------------------------------------------------

    pub fn status(&self) -> ExchangeStatus {
        self.lock_shared().packet.effective_status()
    }

    /// Set the status ahead of a send. Only the owning side may do this.
    pub fn set_status(&self, status: ExchangeStatus) -> Result<()> {
        let mut shared = self.lock_shared();
        if !self.row(&shared).can(CAN_OWNER) {
            return Err(Error::NotOwner(self.role));
        }
        shared.packet.status = status;
        Ok(())
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.lock_shared().packet.error.clone()
    }

    /// Record an error condition; implies status Error.
    pub fn set_error(&self, error: ErrorInfo) -> Result<()> {
        let mut shared = self.lock_shared();
        if !self.row(&shared).can(CAN_OWNER) {
            return Err(Error::NotOwner(self.role));
        }
        shared.packet.status = ExchangeStatus::Error;
        shared.packet.error = Some(error);
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<serde_json::Value> {
        self.lock_shared().packet.properties.get(name).cloned()
    }

    pub fn set_property(&self, name: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let mut shared = self.lock_shared();
        if !self.row(&shared).can(CAN_OWNER) {
            return Err(Error::NotOwner(self.role));
        }
        shared.packet.properties.insert(name.into(), value);
        Ok(())
    }

    pub fn message(&self, slot: Slot) -> Option<Message> {
        let shared = self.lock_shared();
        match slot {
            Slot::In => shared.packet.in_message.clone(),
            Slot::Out => shared.packet.out_message.clone(),
            Slot::Fault => shared.packet.fault_message.clone(),
        }
    }

    /// Attach a message to the given slot. Each slot accepts one message in
    /// the lifetime of the exchange, and only from the owning side in a
    /// state that permits it.
    pub fn set_message(&self, slot: Slot, message: Message) -> Result<()> {
        let mut shared = self.lock_shared();
        let row = self.row(&shared);
        if !row.can(CAN_OWNER) {
            return Err(Error::NotOwner(self.role));
        }
        if !row.can(slot_cap(slot)) {
            return Err(Error::SlotDenied(slot));
        }
        if slot == Slot::Fault && !message.fault {
            return Err(Error::NotAFault);
        }
        let target = match slot {
            Slot::In => &mut shared.packet.in_message,
            Slot::Out => &mut shared.packet.out_message,
            Slot::Fault => &mut shared.packet.fault_message,
        };
        if target.is_some() {
            return Err(Error::AlreadySet(slot));
        }
        *target = Some(message);
        Ok(())
    }

    pub fn service(&self) -> Option<String> {
        self.lock_shared().packet.service.clone()
    }

    pub fn set_service(&self, service: impl Into<String>) {
        self.lock_shared().packet.service = Some(service.into());
    }

    pub fn endpoint(&self) -> Option<String> {
        self.lock_shared().packet.endpoint.clone()
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        self.lock_shared().packet.endpoint = Some(endpoint.into());
    }

    pub fn interface(&self) -> Option<String> {
        self.lock_shared().packet.interface.clone()
    }

    pub fn set_interface(&self, interface: impl Into<String>) {
        self.lock_shared().packet.interface = Some(interface.into());
    }

    pub fn operation(&self) -> Option<String> {
        self.lock_shared().packet.operation.clone()
    }

    pub fn set_operation(&self, operation: impl Into<String>) {
        self.lock_shared().packet.operation = Some(operation.into());
    }

    pub fn source_id(&self) -> Option<ComponentId> {
        self.lock_shared().packet.source_id.clone()
    }

    pub(crate) fn set_source_id(&self, id: ComponentId) {
        self.lock_shared().packet.source_id = Some(id);
    }

    pub fn destination_id(&self) -> Option<ComponentId> {
        self.lock_shared().packet.destination_id.clone()
    }

    pub(crate) fn set_destination_id(&self, id: ComponentId) {
        self.lock_shared().packet.destination_id = Some(id);
    }

    pub fn persistent(&self) -> Option<bool> {
        self.lock_shared().packet.persistent
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.lock_shared().packet.persistent = Some(persistent);
    }

    pub fn synchronous(&self) -> bool {
        self.lock_shared().packet.synchronous
    }

    pub(crate) fn set_synchronous(&self, synchronous: bool) {
        self.lock_shared().packet.synchronous = synchronous;
    }

    pub fn aborted(&self) -> bool {
        self.lock_shared().packet.aborted
    }

    pub fn transaction(&self) -> Option<TxToken> {
        self.lock_shared().packet.transaction
    }

    pub fn set_transaction(&self, token: Option<TxToken>) {
        self.lock_shared().packet.transaction = token;
    }

    // ---- per-side bookkeeping --------------------------------------------

    pub(crate) fn sync_state(&self) -> SyncState {
        self.lock_shared().sides[self.role.index()].sync_state
    }

    pub(crate) fn set_sync_state(&self, sync_state: SyncState) {
        self.lock_shared().sides[self.role.index()].sync_state = sync_state;
    }

    pub(crate) fn tx_state(&self) -> TxState {
        self.lock_shared().sides[self.role.index()].tx_state
    }

    pub(crate) fn set_tx_state(&self, tx_state: TxState) {
        self.lock_shared().sides[self.role.index()].tx_state = tx_state;
    }

    pub(crate) fn push_delivered(&self) -> bool {
        self.lock_shared().sides[self.role.index()].push_delivered
    }

    pub(crate) fn set_push_delivered(&self, delivered: bool) {
        self.lock_shared().sides[self.role.index()].push_delivered = delivered;
    }

    pub(crate) fn tx_lock(&self) -> Option<Arc<TxLock>> {
        self.lock_shared().sides[self.role.index()].tx_lock.clone()
    }

    pub(crate) fn attach_tx_lock(&self, lock: Arc<TxLock>) {
        self.lock_shared().sides[self.role.index()].tx_lock = Some(lock);
    }

    pub(crate) fn detach_tx_lock(&self) -> Option<Arc<TxLock>> {
        self.lock_shared().sides[self.role.index()].tx_lock.take()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Validate and apply a send from this side, advancing its state.
    pub(crate) fn handle_send(&self, sync: bool) -> Result<()> {
        let mut shared = self.lock_shared();
        let row = self.row(&shared);
        if !row.can(CAN_OWNER) {
            return Err(Error::NotOwner(self.role));
        }
        if !row.can(CAN_SEND) {
            return Err(Error::IllegalSend("the current state does not allow sending"));
        }
        let status = shared.packet.status;
        if sync && status != ExchangeStatus::Active {
            return Err(Error::IllegalSend("send_sync requires an active exchange"));
        }
        if !row.can(status_cap(status)) {
            return Err(Error::IllegalStatus(status));
        }
        let out = outcome(status, shared.packet.fault_message.is_some());
        let table = transition_table(shared.packet.pattern, self.role);
        let idx = self.role.index();
        shared.sides[idx].state = states::advance(table, shared.sides[idx].state, out, status)?;
        if sync {
            shared.sides[idx].sync_state = SyncState::SyncSent;
        }
        Ok(())
    }

    /// Apply an accept on this side, advancing its state to mirror the
    /// peer's send.
    pub(crate) fn handle_accept(&self) -> Result<()> {
        let mut shared = self.lock_shared();
        let status = shared.packet.status;
        let out = outcome(status, shared.packet.fault_message.is_some());
        let table = transition_table(shared.packet.pattern, self.role);
        let idx = self.role.index();
        shared.sides[idx].state = states::advance(table, shared.sides[idx].state, out, status)?;
        Ok(())
    }

    /// Abort the exchange: latch the error, release every blocked thread.
    pub(crate) fn abort(&self, error: ErrorInfo) {
        let mut shared = self.lock_shared();
        shared.packet.aborted = true;
        if shared.packet.error.is_none() {
            shared.packet.error = Some(error);
        }
        shared.wakes += 1;
        for side in &shared.sides {
            if let Some(lock) = &side.tx_lock {
                lock.wake();
            }
        }
        self.core.answered.notify_all();
    }

    /// Wake a thread blocked in [`Exchange::wait_for_answer`] on this side.
    pub(crate) fn notify_answered(&self) {
        let mut shared = self.lock_shared();
        shared.wakes += 1;
        self.core.answered.notify_all();
    }

    /// Block until this side's reply arrives, the exchange is woken or
    /// aborted, or the timeout elapses. `None` waits forever; a zero
    /// duration polls.
    pub(crate) fn wait_for_answer(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut shared = self.lock_shared();
        let start_wakes = shared.wakes;
        let idx = self.role.index();
        loop {
            // The aborted flag is latched, so an abort that landed before
            // this thread got here still ends the wait.
            if shared.sides[idx].sync_state == SyncState::SyncReceived
                || shared.packet.aborted
                || shared.wakes != start_wakes
            {
                return;
            }
            match deadline {
                None => {
                    shared = self
                        .core
                        .answered
                        .wait(shared)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    let (guard, _) = self
                        .core
                        .answered
                        .wait_timeout(shared, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    shared = guard;
                }
            }
        }
    }

    /// How far along its lifecycle this side is, normalized to 0..=4 so
    /// exchanges of different patterns compare fairly. Used to drain older
    /// work first under pressure.
    pub fn age_rank(&self) -> usize {
        let shared = self.lock_shared();
        let table = transition_table(shared.packet.pattern, self.role);
        shared.sides[self.role.index()].state * 4 / (table.len() - 1)
    }

    /// Fold a round-tripped copy of this exchange back into this instance:
    /// packet fields and both sides' table states are taken from `other`,
    /// while local-only bookkeeping (transaction, sync state, locks) is kept.
    pub(crate) fn copy_from(&self, other: &Exchange) {
        // Snapshot the peer first; never hold both locks at once.
        let (packet, states) = {
            let shared = other.lock_shared();
            (shared.packet.clone(), [shared.sides[0].state, shared.sides[1].state])
        };
        let mut shared = self.lock_shared();
        shared.packet.copy_from(&packet);
        shared.sides[0].state = states[0];
        shared.sides[1].state = states[1];
    }

    /// Snapshot for crossing a transport boundary.
    pub fn to_wire(&self) -> WireExchange {
        let shared = self.lock_shared();
        WireExchange {
            packet: shared.packet.clone(),
            consumer_state: shared.sides[0].state,
            provider_state: shared.sides[1].state,
        }
    }

    /// Rebuild a handle from a wire snapshot, in the given role. The state
    /// indices come from outside the process and are checked against the
    /// pattern's tables before they are trusted.
    pub fn from_wire(wire: WireExchange, role: Role) -> Result<Exchange> {
        let consumer = transition_table(wire.packet.pattern, Role::Consumer).len();
        let provider = transition_table(wire.packet.pattern, Role::Provider).len();
        if wire.consumer_state >= consumer || wire.provider_state >= provider {
            return Err(Error::Snapshot(format!(
                "state indices {}/{} out of range for pattern {}",
                wire.consumer_state, wire.provider_state, wire.packet.pattern
            )));
        }
        let exchange = Exchange::from_packet(wire.packet);
        {
            let mut shared = exchange.lock_shared();
            shared.sides[0].state = wire.consumer_state;
            shared.sides[1].state = wire.provider_state;
        }
        Ok(Exchange { core: exchange.core, role })
    }
}

/// Serializable form of an exchange for transport flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireExchange {
    pub packet: ExchangePacket,
    pub consumer_state: usize,
    pub provider_state: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ErrorKind;
    use serde_json::json;

    #[test]
    fn mirror_shares_the_packet() {
        let consumer = Exchange::new(Pattern::InOut);
        let provider = consumer.mirror();
        assert!(consumer.same_core(&provider));
        assert_eq!(consumer.id(), provider.id());
        assert_eq!(provider.role(), Role::Provider);

        consumer.set_service("orders");
        assert_eq!(provider.service().as_deref(), Some("orders"));
    }

    #[test]
    fn keys_differ_per_side() {
        let consumer = Exchange::new(Pattern::InOnly);
        let provider = consumer.mirror();
        assert_ne!(consumer.key(), provider.key());
        assert_eq!(consumer.key().to_string(), format!("consumer:{}", consumer.id()));
    }

    #[test]
    fn each_slot_is_settable_at_most_once() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!(1))).unwrap();
        let err = consumer.set_message(Slot::In, Message::new(json!(2))).unwrap_err();
        assert_eq!(err, Error::AlreadySet(Slot::In));
        // The payload was not replaced.
        assert_eq!(consumer.message(Slot::In).unwrap().content, json!(1));
    }

    #[test]
    fn fault_slot_requires_a_fault_message() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(false).unwrap();
        let provider = consumer.mirror();
        provider.handle_accept().unwrap();

        let err = provider.set_message(Slot::Fault, Message::new(json!("not a fault"))).unwrap_err();
        assert_eq!(err, Error::NotAFault);
        provider.set_message(Slot::Fault, Message::fault(json!("boom"))).unwrap();
    }

    #[test]
    fn non_owner_cannot_mutate() {
        let consumer = Exchange::new(Pattern::InOut);
        let provider = consumer.mirror();
        // The provider has not accepted anything yet.
        let err = provider.set_message(Slot::Out, Message::new(json!(1))).unwrap_err();
        assert_eq!(err, Error::NotOwner(Role::Provider));
        assert_eq!(provider.set_status(ExchangeStatus::Done), Err(Error::NotOwner(Role::Provider)));
    }

    #[test]
    fn in_slot_is_closed_after_the_first_send() {
        let consumer = Exchange::new(Pattern::InOnly);
        consumer.set_message(Slot::In, Message::new(json!("x"))).unwrap();
        consumer.handle_send(false).unwrap();
        // Ownership moved away; the in slot can no longer be touched.
        let err = consumer.set_message(Slot::Out, Message::new(json!("y"))).unwrap_err();
        assert_eq!(err, Error::NotOwner(Role::Consumer));
    }

    #[test]
    fn full_in_out_conversation() {
        let consumer = Exchange::new(Pattern::InOut);
        let provider = consumer.mirror();

        consumer.set_message(Slot::In, Message::new(json!("ping"))).unwrap();
        consumer.handle_send(false).unwrap();
        provider.handle_accept().unwrap();

        provider.set_message(Slot::Out, Message::new(json!("pong"))).unwrap();
        provider.handle_send(false).unwrap();
        consumer.handle_accept().unwrap();

        consumer.set_status(ExchangeStatus::Done).unwrap();
        consumer.handle_send(false).unwrap();
        provider.handle_accept().unwrap();

        assert_eq!(consumer.status(), ExchangeStatus::Done);
        // Both sides are spent.
        assert!(consumer.handle_send(false).is_err());
        assert!(provider.handle_send(false).is_err());
    }

    #[test]
    fn in_out_provider_cannot_answer_done_directly() {
        let consumer = Exchange::new(Pattern::InOut);
        let provider = consumer.mirror();
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(false).unwrap();
        provider.handle_accept().unwrap();

        provider.set_status(ExchangeStatus::Done).unwrap();
        let err = provider.handle_send(false).unwrap_err();
        assert_eq!(err, Error::IllegalStatus(ExchangeStatus::Done));
    }

    #[test]
    fn send_sync_requires_active_status() {
        let consumer = Exchange::new(Pattern::InOnly);
        consumer.set_message(Slot::In, Message::new(json!("x"))).unwrap();
        consumer.handle_send(false).unwrap();
        let provider = consumer.mirror();
        provider.handle_accept().unwrap();
        provider.set_status(ExchangeStatus::Done).unwrap();
        assert!(matches!(provider.handle_send(true), Err(Error::IllegalSend(_))));
    }

    #[test]
    fn abort_latches_error_status_and_wakes_waiters() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(true).unwrap();
        assert_eq!(consumer.sync_state(), SyncState::SyncSent);

        let waiter = consumer.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait_for_answer(Some(Duration::from_secs(30)));
        });
        // Give the waiter a moment to block.
        std::thread::sleep(Duration::from_millis(20));
        consumer.abort(ErrorInfo::aborted("channel closed"));
        handle.join().unwrap();

        assert!(consumer.aborted());
        assert_eq!(consumer.status(), ExchangeStatus::Error);
        assert_eq!(consumer.error().unwrap().kind, ErrorKind::Aborted);
    }

    #[test]
    fn wait_entered_after_an_abort_returns_promptly() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(true).unwrap();
        consumer.abort(ErrorInfo::aborted("channel closed"));

        // The abort happened before the wait started; the latched flag must
        // still end the wait instead of sleeping out the timeout.
        let start = Instant::now();
        consumer.wait_for_answer(Some(Duration::from_millis(500)));
        assert!(start.elapsed() < Duration::from_millis(100));
        consumer.wait_for_answer(None);
    }

    #[test]
    fn tx_lock_wake_before_wait_is_not_lost() {
        let lock = TxLock::new();
        lock.wake();
        assert!(!lock.wait());

        let lock = TxLock::new();
        lock.notify();
        assert!(lock.wait());
    }

    #[test]
    fn wait_with_zero_timeout_polls() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(true).unwrap();
        let start = Instant::now();
        consumer.wait_for_answer(Some(Duration::ZERO));
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(consumer.sync_state(), SyncState::SyncSent);
    }

    #[test]
    fn age_rank_orders_exchanges_by_progress() {
        // A freshly accepted in-out request ranks below a finished in-only.
        let in_out = Exchange::new(Pattern::InOut);
        in_out.set_message(Slot::In, Message::new(json!(1))).unwrap();
        in_out.handle_send(false).unwrap();
        let in_out_provider = in_out.mirror();
        in_out_provider.handle_accept().unwrap();

        let in_only = Exchange::new(Pattern::InOnly);
        in_only.set_message(Slot::In, Message::new(json!(2))).unwrap();
        in_only.handle_send(false).unwrap();
        let in_only_provider = in_only.mirror();
        in_only_provider.handle_accept().unwrap();
        in_only_provider.set_status(ExchangeStatus::Done).unwrap();
        in_only_provider.handle_send(false).unwrap();
        in_only.handle_accept().unwrap();

        assert_eq!(in_out_provider.age_rank(), 1);
        assert_eq!(in_only.age_rank(), 4);
        assert!(in_only.age_rank() > in_out_provider.age_rank());
    }

    #[test]
    fn wire_round_trip_preserves_states() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_message(Slot::In, Message::new(json!("q"))).unwrap();
        consumer.handle_send(false).unwrap();

        let wire = consumer.to_wire();
        let text = serde_json::to_string(&wire).unwrap();
        let wire: WireExchange = serde_json::from_str(&text).unwrap();

        let provider = Exchange::from_wire(wire, Role::Provider).unwrap();
        provider.handle_accept().unwrap();
        provider.set_message(Slot::Out, Message::new(json!("a"))).unwrap();
        provider.handle_send(false).unwrap();

        // Fold the answered copy back into the original consumer instance.
        consumer.copy_from(&provider);
        consumer.handle_accept().unwrap();
        assert_eq!(consumer.message(Slot::Out).unwrap().content, json!("a"));
    }

    #[test]
    fn corrupt_wire_snapshot_is_rejected() {
        let consumer = Exchange::new(Pattern::InOnly);
        let mut wire = consumer.to_wire();
        wire.provider_state = 7;
        let err = Exchange::from_wire(wire, Role::Provider).unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }

    #[test]
    fn copy_from_keeps_the_local_transaction() {
        let consumer = Exchange::new(Pattern::InOut);
        consumer.set_transaction(Some(TxToken::new(9)));

        let remote = Exchange::from_wire(consumer.to_wire(), Role::Provider).unwrap();
        assert_eq!(remote.transaction(), None);
        remote.lock_shared().packet.status = ExchangeStatus::Done;

        consumer.copy_from(&remote);
        assert_eq!(consumer.transaction(), Some(TxToken::new(9)));
    }
}
