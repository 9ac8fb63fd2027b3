//! Transaction correlation
//!
//! Responses arrive on the push channel out of order with respect to the
//! requests that caused them. A caller registers its generated transaction
//! id before sending the request; the connection read loop deposits every
//! `Response` frame into this shared table, and the caller polls the table
//! until its id is answered or the round-trip deadline expires. Deposits
//! for ids nobody registered, or that a timed-out caller already
//! abandoned, are dropped so the table never accumulates orphans.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::RpcError;

/// Outcome of one answered request.
#[derive(Debug, Clone)]
struct Outcome {
    result: Option<Value>,
    error: Option<String>,
}

enum Slot {
    /// Registered, no response yet.
    Pending,
    Ready(Outcome),
}

/// Shared result table keyed by transaction id.
pub struct CorrelationTable {
    slots: Mutex<HashMap<Uuid, Slot>>,
    poll_interval: Duration,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(100))
    }

    /// Shorter intervals keep tests fast; production uses the default.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Reserves a slot for `txn`. Must happen before the request goes out:
    /// only registered transactions can receive a deposit.
    pub fn register(&self, txn: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(txn, Slot::Pending);
    }

    /// Drops the slot of a registered transaction whose request never went
    /// out.
    pub fn forget(&self, txn: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&txn);
    }

    /// Deposits the outcome of a request, called by the read loop. A
    /// deposit for an unregistered or abandoned id is dropped.
    pub fn insert(&self, txn: Uuid, result: Option<Value>, error: Option<String>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(&txn) {
            Some(slot) => *slot = Slot::Ready(Outcome { result, error }),
            None => debug!("dropping response for unknown transaction {}", txn),
        }
    }

    /// Polls for the outcome of `txn` until `timeout` elapses.
    ///
    /// An outcome carrying an error field becomes `RpcError::Remote`; expiry
    /// becomes `RpcError::Timeout` and the slot is removed so a late
    /// response is dropped instead of lingering.
    pub async fn wait(&self, txn: Uuid, timeout: Duration) -> Result<Option<Value>, RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.take_ready(txn) {
                return match outcome.error {
                    Some(message) => Err(RpcError::Remote(message)),
                    None => Ok(outcome.result),
                };
            }
            if Instant::now() >= deadline {
                self.forget(txn);
                return Err(RpcError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn take_ready(&self, txn: Uuid) -> Option<Outcome> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(slots.get(&txn), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(outcome)) = slots.remove(&txn) {
                return Some(outcome);
            }
        }
        None
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_table() -> CorrelationTable {
        CorrelationTable::with_poll_interval(Duration::from_millis(5))
    }

    fn slot_count(table: &CorrelationTable) -> usize {
        table.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_wait_returns_deposited_result() {
        let table = fast_table();
        let txn = Uuid::new_v4();
        table.register(txn);
        table.insert(txn, Some(serde_json::json!("ack")), None);

        let result = table.wait(txn, Duration::from_millis(100)).await.unwrap();
        assert_eq!(result, Some(serde_json::json!("ack")));
        assert_eq!(slot_count(&table), 0);
    }

    #[tokio::test]
    async fn test_wait_sees_result_deposited_later() {
        let table = std::sync::Arc::new(fast_table());
        let txn = Uuid::new_v4();
        table.register(txn);

        let depositor = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                table.insert(txn, None, None);
            })
        };

        let result = table.wait(txn, Duration::from_millis(500)).await.unwrap();
        assert_eq!(result, None);
        depositor.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_outcome_becomes_remote_error() {
        let table = fast_table();
        let txn = Uuid::new_v4();
        table.register(txn);
        table.insert(txn, None, Some("no such database".to_string()));

        let err = table.wait(txn, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg.contains("no such database")));
    }

    #[tokio::test]
    async fn test_expiry_is_timeout() {
        let table = fast_table();
        let txn = Uuid::new_v4();
        table.register(txn);
        let err = table
            .wait(txn, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
    }

    #[tokio::test]
    async fn test_late_response_after_expiry_is_dropped() {
        let table = fast_table();
        let txn = Uuid::new_v4();
        table.register(txn);
        let err = table
            .wait(txn, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));

        // The agent answers after the caller gave up.
        table.insert(txn, Some(serde_json::json!("late")), None);
        assert_eq!(slot_count(&table), 0, "abandoned transactions must not accumulate");
    }

    #[tokio::test]
    async fn test_unregistered_deposit_is_dropped() {
        let table = fast_table();
        table.insert(Uuid::new_v4(), Some(serde_json::json!("stray")), None);
        assert_eq!(slot_count(&table), 0);
    }
}
