use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The fixed conversational shape of an exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Pattern {
    /// One-way: the consumer sends a request, the provider acknowledges.
    InOnly,
    /// One-way with a fault path: the provider may answer with a fault that
    /// the consumer must acknowledge.
    RobustInOnly,
    /// Request/reply: the provider answers with an output or a fault.
    InOut,
    /// Request with optional reply; faults may flow in either direction.
    InOptionalOut,
}

/// Which side of the conversation a proxy handle represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Consumer => Role::Provider,
            Role::Provider => Role::Consumer,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Role::Consumer => 0,
            Role::Provider => 1,
        }
    }
}

/// Processing status of an exchange; monotonic per the transition tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeStatus {
    #[default]
    Active,
    Done,
    Error,
}

impl ExchangeStatus {
    /// Done and Error are terminal; Active is not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExchangeStatus::Active)
    }
}

/// Tracks whether a synchronous reply is outstanding on one side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncState {
    #[default]
    Async,
    SyncSent,
    SyncReceived,
}

/// How a transaction relates to the exchange on one side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TxState {
    /// The exchange is not transactional.
    #[default]
    None,
    /// Enlisted in the sender's transaction; the transaction must complete
    /// for the exchange to be delivered.
    Enlisted,
    /// The transaction travels with the exchange and is handed to the target.
    Conveyed,
}

/// Message slots of an exchange, each settable at most once.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Slot {
    In,
    Out,
    Fault,
}
