//! Per-pattern, per-role transition tables.
//!
//! Every exchange proxy walks one of these tables. A row carries the
//! capability bitmask for that state plus the next-state index for each of
//! the four outcome kinds (active output, active fault, error, done). The
//! tables are a compatibility-critical format: changing the wiring breaks
//! components built against the existing lifecycle.

use crate::error::{Error, Result};
use crate::pattern::{ExchangeStatus, Pattern, Role, Slot};

/// Capability bitmask for one state of one side of an exchange.
pub type Caps = u32;

pub const CAN_SET_IN: Caps = 1 << 0;
pub const CAN_SET_OUT: Caps = 1 << 1;
pub const CAN_SET_FAULT: Caps = 1 << 2;
pub const CAN_SEND: Caps = 1 << 3;
pub const CAN_STATUS_ACTIVE: Caps = 1 << 4;
pub const CAN_STATUS_DONE: Caps = 1 << 5;
pub const CAN_STATUS_ERROR: Caps = 1 << 6;
pub const CAN_OWNER: Caps = 1 << 7;

/// Capability guarding writes to the given message slot.
pub fn slot_cap(slot: Slot) -> Caps {
    match slot {
        Slot::In => CAN_SET_IN,
        Slot::Out => CAN_SET_OUT,
        Slot::Fault => CAN_SET_FAULT,
    }
}

/// Capability a state must carry for the exchange to be sent with the
/// given status.
pub fn status_cap(status: ExchangeStatus) -> Caps {
    match status {
        ExchangeStatus::Active => CAN_STATUS_ACTIVE,
        ExchangeStatus::Done => CAN_STATUS_DONE,
        ExchangeStatus::Error => CAN_STATUS_ERROR,
    }
}

/// Outcome kind of a send or accept, computed from (status, fault present).
/// A set fault outranks plain output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Output,
    Fault,
    Error,
    Done,
}

pub fn outcome(status: ExchangeStatus, has_fault: bool) -> Outcome {
    match status {
        ExchangeStatus::Active if has_fault => Outcome::Fault,
        ExchangeStatus::Active => Outcome::Output,
        ExchangeStatus::Error => Outcome::Error,
        ExchangeStatus::Done => Outcome::Done,
    }
}

/// One row of a transition table.
#[derive(Debug, Copy, Clone)]
pub struct StateRow {
    pub caps: Caps,
    pub on_output: Option<usize>,
    pub on_fault: Option<usize>,
    pub on_error: Option<usize>,
    pub on_done: Option<usize>,
}

impl StateRow {
    pub fn can(&self, cap: Caps) -> bool {
        self.caps & cap == cap
    }

    pub fn next(&self, outcome: Outcome) -> Option<usize> {
        match outcome {
            Outcome::Output => self.on_output,
            Outcome::Fault => self.on_fault,
            Outcome::Error => self.on_error,
            Outcome::Done => self.on_done,
        }
    }
}

const fn row(
    caps: Caps,
    on_output: Option<usize>,
    on_fault: Option<usize>,
    on_error: Option<usize>,
    on_done: Option<usize>,
) -> StateRow {
    StateRow { caps, on_output, on_fault, on_error, on_done }
}

// in-only: consumer sends the request, provider answers done or error.
const IN_ONLY_CONSUMER: &[StateRow] = &[
    row(CAN_OWNER | CAN_SET_IN | CAN_SEND | CAN_STATUS_ACTIVE, Some(1), None, None, None),
    row(0, None, None, Some(2), Some(2)),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
];
const IN_ONLY_PROVIDER: &[StateRow] = &[
    row(0, Some(1), None, None, None),
    row(CAN_OWNER | CAN_SEND | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, Some(2), Some(2)),
    row(0, None, None, None, None),
];

// robust-in-only: the provider may answer with a fault, which the consumer
// must acknowledge with done or error.
const ROBUST_IN_ONLY_CONSUMER: &[StateRow] = &[
    row(CAN_OWNER | CAN_SET_IN | CAN_SEND | CAN_STATUS_ACTIVE, Some(1), None, None, None),
    row(0, None, Some(2), Some(4), Some(4)),
    row(CAN_OWNER | CAN_SEND | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, Some(3), Some(3)),
    row(0, None, None, None, None),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
];
const ROBUST_IN_ONLY_PROVIDER: &[StateRow] = &[
    row(0, Some(1), None, None, None),
    row(
        CAN_OWNER | CAN_SET_FAULT | CAN_SEND | CAN_STATUS_ACTIVE | CAN_STATUS_DONE | CAN_STATUS_ERROR,
        None,
        Some(2),
        Some(4),
        Some(4),
    ),
    row(0, None, None, Some(3), Some(3)),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
    row(0, None, None, None, None),
];

// in-out: the provider must answer with an output, a fault or an error; the
// consumer closes the exchange with done or error.
const IN_OUT_CONSUMER: &[StateRow] = &[
    row(CAN_OWNER | CAN_SET_IN | CAN_SEND | CAN_STATUS_ACTIVE, Some(1), None, None, None),
    row(0, Some(2), Some(2), Some(4), None),
    row(CAN_OWNER | CAN_SEND | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, Some(3), Some(3)),
    row(0, None, None, None, None),
    row(CAN_OWNER | CAN_STATUS_ERROR, None, None, None, None),
];
const IN_OUT_PROVIDER: &[StateRow] = &[
    row(0, Some(1), None, None, None),
    row(
        CAN_OWNER | CAN_SET_OUT | CAN_SET_FAULT | CAN_SEND | CAN_STATUS_ACTIVE | CAN_STATUS_ERROR,
        Some(2),
        Some(2),
        Some(4),
        None,
    ),
    row(0, None, None, Some(3), Some(3)),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
    row(0, None, None, None, None),
];

// in-optional-out: the provider may answer with an output, a fault or a
// terminal status; faults flow in either direction and are always
// acknowledged with done or error by the side that receives them.
const IN_OPTIONAL_OUT_CONSUMER: &[StateRow] = &[
    row(CAN_OWNER | CAN_SET_IN | CAN_SEND | CAN_STATUS_ACTIVE, Some(1), None, None, None),
    row(0, Some(2), Some(3), Some(6), Some(6)),
    row(
        CAN_OWNER | CAN_SET_FAULT | CAN_SEND | CAN_STATUS_ACTIVE | CAN_STATUS_DONE | CAN_STATUS_ERROR,
        None,
        Some(4),
        Some(5),
        Some(5),
    ),
    row(CAN_OWNER | CAN_SEND | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, Some(5), Some(5)),
    row(0, None, None, Some(6), Some(6)),
    row(0, None, None, None, None),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
];
const IN_OPTIONAL_OUT_PROVIDER: &[StateRow] = &[
    row(0, Some(1), None, None, None),
    row(
        CAN_OWNER
            | CAN_SET_OUT
            | CAN_SET_FAULT
            | CAN_SEND
            | CAN_STATUS_ACTIVE
            | CAN_STATUS_DONE
            | CAN_STATUS_ERROR,
        Some(2),
        Some(3),
        Some(5),
        Some(5),
    ),
    row(0, None, Some(4), Some(6), Some(6)),
    row(0, None, None, Some(6), Some(6)),
    row(CAN_OWNER | CAN_SEND | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, Some(5), Some(5)),
    row(0, None, None, None, None),
    row(CAN_OWNER | CAN_STATUS_DONE | CAN_STATUS_ERROR, None, None, None, None),
];

/// The transition table for one side of one pattern.
pub fn transition_table(pattern: Pattern, role: Role) -> &'static [StateRow] {
    match (pattern, role) {
        (Pattern::InOnly, Role::Consumer) => IN_ONLY_CONSUMER,
        (Pattern::InOnly, Role::Provider) => IN_ONLY_PROVIDER,
        (Pattern::RobustInOnly, Role::Consumer) => ROBUST_IN_ONLY_CONSUMER,
        (Pattern::RobustInOnly, Role::Provider) => ROBUST_IN_ONLY_PROVIDER,
        (Pattern::InOut, Role::Consumer) => IN_OUT_CONSUMER,
        (Pattern::InOut, Role::Provider) => IN_OUT_PROVIDER,
        (Pattern::InOptionalOut, Role::Consumer) => IN_OPTIONAL_OUT_CONSUMER,
        (Pattern::InOptionalOut, Role::Provider) => IN_OPTIONAL_OUT_PROVIDER,
    }
}

/// Compute the next state for the given outcome.
///
/// A missing entry means the outcome is not legal from this state and is a
/// protocol violation reported to the caller. An entry pointing outside the
/// table means the table itself is malformed, which is a configuration
/// defect and panics.
pub(crate) fn advance(
    table: &'static [StateRow],
    state: usize,
    out: Outcome,
    status: ExchangeStatus,
) -> Result<usize> {
    match table[state].next(out) {
        None => Err(Error::IllegalOutcome { status }),
        Some(next) => {
            assert!(
                next < table.len(),
                "malformed transition table: state {state} wired to {next} (table has {} states)",
                table.len()
            );
            Ok(next)
        }
    }
}
