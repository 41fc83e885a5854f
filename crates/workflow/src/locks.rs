use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use expensio_core::domain::expense::ExpenseId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("timed out after {waited:?} waiting for expense {expense_id}")]
pub struct LockTimeout {
    pub expense_id: ExpenseId,
    pub waited: Duration,
}

/// Serializes writers of one expense inside this process.
///
/// Slots are created on demand and pruned once nobody holds or awaits them, so
/// the map stays proportional to the number of expenses currently contended.
#[derive(Clone)]
pub struct ExpenseLocks {
    slots: Arc<Mutex<HashMap<ExpenseId, Arc<tokio::sync::Mutex<()>>>>>,
    timeout: Duration,
}

/// Held for the duration of one read-modify-write of an expense.
pub struct ExpenseGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ExpenseLocks {
    pub fn new(timeout: Duration) -> Self {
        Self { slots: Arc::new(Mutex::new(HashMap::new())), timeout }
    }

    pub async fn acquire(&self, expense_id: &ExpenseId) -> Result<ExpenseGuard, LockTimeout> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(expense_id.clone()).or_default().clone()
        };

        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(ExpenseGuard { _guard: guard }),
            Err(_) => Err(LockTimeout { expense_id: expense_id.clone(), waited: self.timeout }),
        }
    }

    pub fn tracked(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use expensio_core::domain::expense::ExpenseId;

    use super::ExpenseLocks;

    #[tokio::test]
    async fn second_writer_times_out_while_first_holds_the_lock() {
        let locks = ExpenseLocks::new(Duration::from_millis(50));
        let id = ExpenseId("EXP-1".to_string());

        let held = locks.acquire(&id).await.expect("first lock");
        let contended = locks.acquire(&id).await;
        assert!(contended.is_err());

        drop(held);
        assert!(locks.acquire(&id).await.is_ok());
    }

    #[tokio::test]
    async fn different_expenses_do_not_contend() {
        let locks = ExpenseLocks::new(Duration::from_millis(50));
        let _first = locks.acquire(&ExpenseId("EXP-1".to_string())).await.expect("first");
        let _second = locks.acquire(&ExpenseId("EXP-2".to_string())).await.expect("second");
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn idle_slots_are_pruned() {
        let locks = ExpenseLocks::new(Duration::from_millis(50));
        drop(locks.acquire(&ExpenseId("EXP-1".to_string())).await.expect("lock"));
        drop(locks.acquire(&ExpenseId("EXP-2".to_string())).await.expect("lock"));
        assert_eq!(locks.tracked(), 1);
    }
}
