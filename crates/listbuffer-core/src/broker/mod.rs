//! Queue broker boundary.
//!
//! The engine only needs list lengths, an atomic pop from the head of a
//! list, and pushes to either end. [`RedisBroker`] speaks RESP to a Redis
//! server; [`MemoryBroker`] keeps the lists in process.

pub mod memory;
pub mod redis;
pub mod resp;

use serde::{Deserialize, Serialize};

use crate::Item;
use crate::error::BrokerError;

pub use memory::{BrokerOp, MemoryBroker};
pub use redis::RedisBroker;

/// Depths of the two queues, sampled in one round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLengths {
    pub in_len: i64,
    pub out_len: i64,
}

/// List operations the buffer engine relies on.
///
/// Item order is always head-to-tail: `pop_front` returns the oldest item
/// first, `push_back` appends in slice order, and `push_front` leaves the
/// slice at the head in slice order.
#[allow(async_fn_in_trait)]
pub trait QueueBroker {
    async fn lengths(&mut self, in_key: &str, out_key: &str)
    -> Result<QueueLengths, BrokerError>;

    /// Remove and return up to `count` items from the head of `key`.
    async fn pop_front(&mut self, key: &str, count: u64) -> Result<Vec<Item>, BrokerError>;

    /// Remove and return every item in `key`.
    async fn pop_all(&mut self, key: &str) -> Result<Vec<Item>, BrokerError>;

    async fn push_back(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError>;

    async fn push_front(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError>;
}
