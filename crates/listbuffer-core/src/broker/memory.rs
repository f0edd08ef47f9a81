//! In-process broker with failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{QueueBroker, QueueLengths};
use crate::Item;
use crate::error::BrokerError;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    Lengths,
    PopFront,
    PopAll,
    PushBack,
    PushFront,
}

/// Pending injected failures for one op.
#[derive(Debug, Clone, Copy)]
struct Failure {
    remaining: u32,
    disconnect: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<Item>>,
    failures: HashMap<BrokerOp, Failure>,
    calls: HashMap<BrokerOp, u64>,
}

/// Lists held in memory. Clones share the same lists, so a test can keep a
/// handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append items to the tail of `key`.
    pub fn seed<I, S>(&self, key: &str, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Item>,
    {
        let mut state = self.state();
        let list = state.lists.entry(key.to_string()).or_default();
        list.extend(items.into_iter().map(Into::into));
    }

    /// Snapshot of `key`, head first.
    #[must_use]
    pub fn items(&self, key: &str) -> Vec<Item> {
        self.state()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.state().lists.get(key).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// Make the next `times` calls of `op` fail with `BrokerError::Unavailable`.
    pub fn fail_next(&self, op: BrokerOp, times: u32) {
        let failure = Failure {
            remaining: times,
            disconnect: false,
        };
        self.state().failures.insert(op, failure);
    }

    /// Make the next `times` calls of `op` fail with `BrokerError::Disconnected`.
    pub fn disconnect_next(&self, op: BrokerOp, times: u32) {
        let failure = Failure {
            remaining: times,
            disconnect: true,
        };
        self.state().failures.insert(op, failure);
    }

    /// How many times `op` was attempted, failed calls included.
    #[must_use]
    pub fn calls(&self, op: BrokerOp) -> u64 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn begin(&self, op: BrokerOp) -> Result<MutexGuard<'_, MemoryState>, BrokerError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(failure) = state.failures.get_mut(&op) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                if failure.disconnect {
                    return Err(BrokerError::Disconnected);
                }
                return Err(BrokerError::Unavailable(format!("injected {op:?} failure")));
            }
        }
        Ok(state)
    }
}

impl QueueBroker for MemoryBroker {
    async fn lengths(&mut self, in_key: &str, out_key: &str) -> Result<QueueLengths, BrokerError> {
        let state = self.begin(BrokerOp::Lengths)?;
        let len = |key: &str| state.lists.get(key).map_or(0, VecDeque::len) as i64;
        Ok(QueueLengths {
            in_len: len(in_key),
            out_len: len(out_key),
        })
    }

    async fn pop_front(&mut self, key: &str, count: u64) -> Result<Vec<Item>, BrokerError> {
        let mut state = self.begin(BrokerOp::PopFront)?;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = list.len().min(usize::try_from(count).unwrap_or(usize::MAX));
        Ok(list.drain(..take).collect())
    }

    async fn pop_all(&mut self, key: &str) -> Result<Vec<Item>, BrokerError> {
        let mut state = self.begin(BrokerOp::PopAll)?;
        Ok(state
            .lists
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn push_back(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::PushBack)?;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn push_front(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOp::PushFront)?;
        let list = state.lists.entry(key.to_string()).or_default();
        for item in items.iter().rev() {
            list.push_front(item.clone());
        }
        Ok(())
    }
}
