//! Outstanding device-initiated requests
//!
//! Every entry is completed exactly once: by a matching response, by its
//! timer, or by cancellation when the device closes. Whichever path removes
//! the entry from the map under the lock owns the completion; the others find
//! nothing and do nothing.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::CorrelationId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback receiving the single outcome of a transaction
pub type Completion = Box<dyn FnOnce(DeviceResult<Value>) + Send + 'static>;

struct Transaction {
    completion: Completion,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<CorrelationId, Transaction>,
    last_id: CorrelationId,
}

/// Correlation-id keyed registry of pending requests
#[derive(Clone, Default)]
pub struct TransactionTable {
    inner: Arc<Mutex<TableInner>>,
}

/// Next id: the wall clock in milliseconds, bumped past the previous id
pub fn next_correlation_id(last: CorrelationId, now_ms: u64) -> CorrelationId {
    now_ms.max(last.saturating_add(1))
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transaction and arm its timer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn begin(&self, timeout: Duration, completion: Completion) -> DeviceResult<CorrelationId> {
        let mut inner = self.lock();
        let id = next_correlation_id(inner.last_id, now_ms());
        if inner.entries.contains_key(&id) {
            return Err(DeviceError::internal(format!(
                "correlation id {id} is already outstanding"
            )));
        }
        inner.last_id = id;

        let table = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = Weak::upgrade(&table) {
                TransactionTable { inner }.timeout_fire(id, timeout);
            }
        });

        inner.entries.insert(
            id,
            Transaction {
                completion,
                timer: Some(timer),
            },
        );
        debug!(id, timeout_ms = timeout.as_millis() as u64, "Transaction started");
        Ok(id)
    }

    /// Complete the transaction with a response
    ///
    /// Returns false for late or unknown ids, which are ignored.
    pub fn resolve(&self, id: CorrelationId, result: DeviceResult<Value>) -> bool {
        let entry = self.lock().entries.remove(&id);
        match entry {
            Some(transaction) => {
                if let Some(timer) = transaction.timer {
                    timer.abort();
                }
                (transaction.completion)(result);
                true
            }
            None => {
                debug!(id, "No pending transaction for response");
                false
            }
        }
    }

    /// Fail the transaction with a timeout if it is still pending
    pub fn timeout_fire(&self, id: CorrelationId, timeout: Duration) -> bool {
        let entry = self.lock().entries.remove(&id);
        match entry {
            Some(transaction) => {
                warn!(id, "Transaction timed out");
                (transaction.completion)(Err(DeviceError::Timeout {
                    id,
                    timeout_ms: timeout.as_millis() as u64,
                }));
                true
            }
            None => false,
        }
    }

    /// Fail every pending transaction with a cancellation error
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().entries.drain().collect();
        let count = drained.len();
        for (id, transaction) in drained {
            if let Some(timer) = transaction.timer {
                timer.abort();
            }
            (transaction.completion)(Err(DeviceError::Cancelled {
                id,
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            debug!(count, reason, "Cancelled pending transactions");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().entries.contains_key(&id)
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TransactionTable")
            .field("pending", &inner.entries.len())
            .field("last_id", &inner.last_id)
            .finish()
    }
}
