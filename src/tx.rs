use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque handle for a transaction. The bus never inspects it, it only
/// suspends and resumes around queue boundaries through the
/// [`TransactionManager`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxToken(u64);

impl TxToken {
    pub fn new(id: u64) -> Self {
        TxToken(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Binding between threads and transactions.
///
/// Implementations are expected to associate at most one transaction with
/// the calling thread. `suspend` detaches the current association and hands
/// it back, `resume` re-attaches a previously suspended one on a (possibly
/// different) thread.
pub trait TransactionManager: Send + Sync {
    /// The transaction bound to the calling thread, if any.
    fn current(&self) -> Option<TxToken>;

    /// Detach the calling thread's transaction and return it.
    fn suspend(&self) -> Result<Option<TxToken>>;

    /// Bind the given transaction to the calling thread.
    fn resume(&self, token: TxToken) -> Result<()>;
}

/// Manager for non-transactional deployments; every exchange runs plain.
#[derive(Debug, Default)]
pub struct NoopTransactionManager;

impl TransactionManager for NoopTransactionManager {
    fn current(&self) -> Option<TxToken> {
        None
    }

    fn suspend(&self) -> Result<Option<TxToken>> {
        Ok(None)
    }

    fn resume(&self, token: TxToken) -> Result<()> {
        Err(Error::Transaction(format!(
            "cannot resume transaction {} without a transaction manager",
            token.id()
        )))
    }
}

thread_local! {
    static BOUND_TX: Cell<Option<TxToken>> = const { Cell::new(None) };
}

/// In-process manager that binds tokens to the current thread. Suitable for
/// tests and for embeddings that only need suspend/resume bookkeeping.
#[derive(Debug, Default)]
pub struct ThreadBoundTransactionManager {
    next_id: AtomicU64,
}

impl ThreadBoundTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh transaction and bind it to the calling thread.
    pub fn begin(&self) -> Result<TxToken> {
        if BOUND_TX.with(Cell::get).is_some() {
            return Err(Error::Transaction("thread already has a transaction".into()));
        }
        let token = TxToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        BOUND_TX.with(|cell| cell.set(Some(token)));
        Ok(token)
    }

    /// Drop the transaction bound to the calling thread, if any.
    pub fn commit(&self) -> Result<()> {
        BOUND_TX.with(|cell| cell.set(None));
        Ok(())
    }
}

impl TransactionManager for ThreadBoundTransactionManager {
    fn current(&self) -> Option<TxToken> {
        BOUND_TX.with(Cell::get)
    }

    fn suspend(&self) -> Result<Option<TxToken>> {
        Ok(BOUND_TX.with(|cell| cell.take()))
    }

    fn resume(&self, token: TxToken) -> Result<()> {
        BOUND_TX.with(|cell| {
            if cell.get().is_some() {
                return Err(Error::Transaction(
                    "thread already has a transaction, cannot resume another".into(),
                ));
            }
            cell.set(Some(token));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_bound_suspend_resume() {
        let tm = ThreadBoundTransactionManager::new();
        let token = tm.begin().unwrap();
        assert_eq!(tm.current(), Some(token));

        let suspended = tm.suspend().unwrap();
        assert_eq!(suspended, Some(token));
        assert_eq!(tm.current(), None);

        tm.resume(token).unwrap();
        assert_eq!(tm.current(), Some(token));
        tm.commit().unwrap();
        assert_eq!(tm.current(), None);
    }

    #[test]
    fn resume_over_existing_transaction_fails() {
        let tm = ThreadBoundTransactionManager::new();
        let first = tm.begin().unwrap();
        assert!(tm.resume(first).is_err());
        tm.commit().unwrap();
    }

    #[test]
    fn transactions_are_per_thread() {
        let tm = std::sync::Arc::new(ThreadBoundTransactionManager::new());
        let token = tm.begin().unwrap();

        let tm2 = tm.clone();
        std::thread::spawn(move || {
            assert_eq!(tm2.current(), None);
            tm2.resume(token).unwrap();
            assert_eq!(tm2.current(), Some(token));
        })
        .join()
        .unwrap();

        assert_eq!(tm.current(), Some(token));
        tm.commit().unwrap();
    }
}
