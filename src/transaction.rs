//! Nested transactions over a savepoint stack.
//!
//! Depth 0 uses `BEGIN`/`COMMIT`/`ROLLBACK`; every deeper level reuses the
//! savepoint name `__pglue_tx`, relying on savepoint shadowing: releasing the
//! name always resolves to the most recent one. The wire keeps an ordered
//! stack of open entries; finishing an entry truncates the stack at its
//! position, which implicitly closes anything nested inside it.

use std::sync::Arc;

use tracing::debug;

use crate::connection::WireInner;
use crate::error::{Error, Result};

/// Savepoint name shared by every nested level.
const SAVEPOINT: &str = "__pglue_tx";

/// One open entry on the wire's transaction stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxEntry {
    pub id: u64,
    /// Connection generation the entry was opened on; entries from a dead
    /// connection are never replayed against a new one.
    pub generation: u64,
}

/// An open transaction or savepoint.
///
/// Dropping an unfinished transaction rolls it back in the background.
pub struct Transaction {
    wire: Arc<WireInner>,
    id: u64,
    generation: u64,
    done: bool,
}

impl Transaction {
    pub(crate) async fn begin(wire: Arc<WireInner>) -> Result<Transaction> {
        let mut stack = wire.tx_stack.lock().await;
        let generation = wire.generation();
        stack.retain(|e| e.generation == generation);

        let sql = if stack.is_empty() {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {SAVEPOINT}")
        };
        wire.execute_sql(&sql).await?;

        let id = wire.next_tx_id();
        stack.push(TxEntry { id, generation });
        drop(stack);
        Ok(Transaction {
            wire,
            id,
            generation,
            done: false,
        })
    }

    /// Whether this entry is still on the wire's stack.
    pub async fn is_open(&self) -> bool {
        if self.done {
            return false;
        }
        let stack = self.wire.tx_stack.lock().await;
        self.generation == self.wire.generation() && stack.iter().any(|e| e.id == self.id)
    }

    /// Commit: `COMMIT` at depth 0, `RELEASE` otherwise.
    pub async fn commit(mut self) -> Result<()> {
        self.done = true;
        finish(&self.wire, self.id, self.generation, true).await
    }

    /// Roll back: `ROLLBACK` at depth 0, `ROLLBACK TO` plus `RELEASE`
    /// otherwise.
    pub async fn rollback(mut self) -> Result<()> {
        self.done = true;
        finish(&self.wire, self.id, self.generation, false).await
    }
}

async fn finish(wire: &Arc<WireInner>, id: u64, generation: u64, commit: bool) -> Result<()> {
    let mut stack = wire.tx_stack.lock().await;
    if generation != wire.generation() {
        return Err(Error::TransactionClosed);
    }
    let Some(index) = stack.iter().position(|e| e.id == id) else {
        return Err(Error::TransactionClosed);
    };
    stack.truncate(index);

    let sql = match (commit, index == 0) {
        (true, true) => "COMMIT".to_string(),
        (true, false) => format!("RELEASE {SAVEPOINT}"),
        (false, true) => "ROLLBACK".to_string(),
        (false, false) => format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"),
    };
    wire.execute_sql(&sql).await?;
    drop(stack);
    Ok(())
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let wire = Arc::clone(&self.wire);
        let (id, generation) = (self.id, self.generation);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match finish(&wire, id, generation, false).await {
                    Ok(()) => debug!(id, "rolled back dropped transaction"),
                    // Already closed entries are the common benign case here.
                    Err(Error::TransactionClosed) => {}
                    Err(e) => debug!(id, error = %e, "rollback of dropped transaction failed"),
                }
            });
        }
    }
}
