//! Transactions
//!
//! A [`Transaction`] is a unit of work against the persistence store. Work
//! can attach after-commit and after-rollback callbacks, and can retain
//! exclusive sections that stay held until the transaction has completed
//! and its callbacks have fired.

use parking_lot::Mutex;
use std::any::Any;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::sync::KeyedMutex;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// An open unit of work
pub struct Transaction {
    id: Uuid,
    after_commit: Mutex<Vec<Callback>>,
    after_rollback: Mutex<Vec<Callback>>,
    sections: Mutex<Vec<(String, Box<dyn Any + Send>)>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            after_commit: Mutex::new(Vec::new()),
            after_rollback: Mutex::new(Vec::new()),
            sections: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registers work to run once the transaction has committed
    pub fn on_after_commit(&self, callback: impl FnOnce() + Send + 'static) {
        self.after_commit.lock().push(Box::new(callback));
    }

    /// Registers work to run once the transaction has rolled back
    pub fn on_after_rollback(&self, callback: impl FnOnce() + Send + 'static) {
        self.after_rollback.lock().push(Box::new(callback));
    }

    /// Keeps `guard` alive until the transaction completes
    pub fn retain_section(&self, label: impl Into<String>, guard: impl Any + Send) {
        self.sections.lock().push((label.into(), Box::new(guard)));
    }

    pub fn holds_section(&self, label: &str) -> bool {
        self.sections.lock().iter().any(|(held, _)| held == label)
    }

    /// Enters the section for `key` and holds it for the rest of the transaction
    ///
    /// Re-entering a section this transaction already holds is a no-op.
    pub fn hold_section<K>(&self, label: impl Into<String>, sections: &KeyedMutex<K>, key: K)
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let label = label.into();
        if self.holds_section(&label) {
            return;
        }
        let guard = sections.lock(key);
        self.retain_section(label, guard);
    }

    /// Fires the callbacks for `outcome` in registration order, then
    /// releases every retained section
    ///
    /// A panicking callback is logged and does not stop the rest.
    pub(crate) fn complete(&self, outcome: Outcome) {
        let callbacks = match outcome {
            Outcome::Committed => {
                self.after_rollback.lock().clear();
                std::mem::take(&mut *self.after_commit.lock())
            }
            Outcome::RolledBack => {
                self.after_commit.lock().clear();
                std::mem::take(&mut *self.after_rollback.lock())
            }
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::error!(tx = %self.id, ?outcome, "Transaction callback panicked");
            }
        }

        let mut sections = std::mem::take(&mut *self.sections.lock());
        while let Some((label, guard)) = sections.pop() {
            drop(guard);
            tracing::trace!(tx = %self.id, section = %label, "Released section");
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

/// Begins, commits and rolls back transactions against a store
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Transaction, StoreError>;

    /// Makes every write of `tx` durable and visible, or none of them
    fn commit(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Discards every write of `tx`; calling it twice is harmless
    fn rollback(&self, tx: &Transaction);
}

/// Runs closures inside transactions
#[derive(Clone)]
pub struct Transactions {
    manager: Arc<dyn TransactionManager>,
}

impl Transactions {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }

    /// Runs `work` in a new transaction
    ///
    /// Commits when `work` returns `Ok`. Rolls back when it returns `Err`,
    /// when it panics (the panic is resumed afterwards) and when the commit
    /// itself fails.
    pub fn run<T, E>(&self, work: impl FnOnce(&Transaction) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self.manager.begin()?;
        let span = tracing::debug_span!("transaction", tx = %tx.id());
        let _enter = span.enter();

        match catch_unwind(AssertUnwindSafe(|| work(&tx))) {
            Ok(Ok(value)) => match self.manager.commit(&tx) {
                Ok(()) => {
                    tx.complete(Outcome::Committed);
                    Ok(value)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Commit failed, rolling back");
                    self.manager.rollback(&tx);
                    tx.complete(Outcome::RolledBack);
                    Err(err.into())
                }
            },
            Ok(Err(err)) => {
                tracing::debug!("Transaction rolled back");
                self.manager.rollback(&tx);
                tx.complete(Outcome::RolledBack);
                Err(err)
            }
            Err(panic) => {
                tracing::error!("Transaction work panicked, rolling back");
                self.manager.rollback(&tx);
                tx.complete(Outcome::RolledBack);
                resume_unwind(panic)
            }
        }
    }
}

impl std::fmt::Debug for Transactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactions").finish_non_exhaustive()
    }
}
