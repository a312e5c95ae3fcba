use thiserror::Error;

use crate::pattern::{ExchangeStatus, Role, Slot};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the bus, its channels and the broker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The delivery channel has been closed; every later call fails with this.
    #[error("delivery channel for '{0}' has been closed")]
    Closed(String),

    /// A mutation was attempted by the side that does not own the exchange.
    #[error("{0:?} side is not the owner of the exchange")]
    NotOwner(Role),

    /// The current state does not allow setting this message slot.
    #[error("setting the {0} message is not allowed in the current state")]
    SlotDenied(Slot),

    /// The slot already holds a message; each slot is settable at most once.
    #[error("{0} message is already set")]
    AlreadySet(Slot),

    /// A non-fault message was passed for the fault slot.
    #[error("setting fault, but the message is not a fault")]
    NotAFault,

    /// send/send_sync called from a state without the send capability,
    /// or send_sync on a non-active exchange.
    #[error("illegal call to send/send_sync: {0}")]
    IllegalSend(&'static str),

    /// The exchange status is not allowed in the current state.
    #[error("illegal exchange status: {0}")]
    IllegalStatus(ExchangeStatus),

    /// The (status, fault) outcome has no transition from the current state.
    #[error("no legal transition for status {status} from the current state")]
    IllegalOutcome { status: ExchangeStatus },

    /// A synchronous send was not answered in time.
    #[error("send_sync timeout for exchange {0}")]
    Timeout(String),

    /// The exchange was aborted while a thread was blocked on it.
    #[error("exchange {0} has been aborted")]
    Aborted(String),

    /// No destination could be resolved for the exchange.
    #[error("could not find a route for exchange {id} (service: {service:?}, interface: {interface:?})")]
    NoRoute {
        id: String,
        service: Option<String>,
        interface: Option<String>,
    },

    /// No registered flow accepted the exchange.
    #[error("unable to choose a flow for exchange {0}")]
    NoFlow(String),

    /// The destination component is not registered.
    #[error("no component named '{0}'")]
    NoComponent(String),

    /// A component with the same name is already attached to the bus.
    #[error("component '{0}' is already activated")]
    ComponentExists(String),

    /// The destination component is registered but its channel is closed.
    #[error("component '{0}' is shut down")]
    ComponentStopped(String),

    /// A transaction manager call failed or the thread-bound transaction did
    /// not match the one carried by the exchange.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// An endpoint with the same service/name pair is already active.
    #[error("endpoint {service}:{endpoint} is already activated")]
    EndpointExists { service: String, endpoint: String },

    /// A push handler refused the exchange.
    #[error("push handler failed: {0}")]
    Handler(String),

    /// A deserialized wire snapshot carried state indices outside the
    /// pattern's transition tables.
    #[error("corrupt exchange snapshot: {0}")]
    Snapshot(String),
}
