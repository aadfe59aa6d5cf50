//! Backing-store boundary.
//!
//! The coordinator talks to its store through [`QueueStore`], a
//! narrow trait: every method is one indivisible unit on the server side. Any
//! networked list/set store can back it as long as each call honours that
//! atomicity contract.

use relq_core::{NodeId, QueueName};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "redis")]
mod scripts;

pub use in_memory::{Fault, InMemoryStore};
#[cfg(feature = "redis")]
pub use redis::RedisStore;

/// Upper bound on entries moved by a single dequeue.
pub const MAX_DEQUEUE: usize = 100;

/// Entries moved per recovery batch.
pub const RECOVERY_BATCH: usize = 1000;

/// Store failure, classified by what the caller may do about it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The connection hiccupped; the next call may succeed after reconnecting.
    #[error("transient store error: {0}")]
    Transient(String),
    /// Protocol or command failure; the connection cannot be trusted.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Node presence recorded in the same atomic unit as a dequeue.
#[derive(Debug, Clone, Copy)]
pub struct Presence<'a> {
    pub node_id: &'a NodeId,
    pub queue: &'a QueueName,
}

/// Arguments of the atomic move primitive.
///
/// Pops up to `count` entries from the tail of `source` one at a time, pushing
/// each onto the head of `destination`. The returned entries are in pop order.
#[derive(Debug, Clone, Copy)]
pub struct Transfer<'a> {
    pub source: &'a str,
    pub destination: &'a str,
    pub count: usize,
    pub presence: Option<Presence<'a>>,
}

/// Outcome of one recovery batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBatch {
    /// Entries still left in the source list.
    pub remaining: usize,
    /// Entries moved by this batch.
    pub moved: usize,
}

/// Bounds applied to a sorted set right after an insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetTrim {
    /// Members scored strictly below this are dropped.
    pub min_score: f64,
    /// Keep at most this many highest-scored members.
    pub max_len: usize,
}

/// A sorted-set insert, optionally releasing the member's old list entry in
/// the same atomic unit.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledEntry<'a> {
    pub set: &'a str,
    pub score: f64,
    pub member: &'a str,
    /// `(list, value)`: remove the last occurrence of `value` from `list`.
    pub release: Option<(&'a str, &'a str)>,
    pub trim: Option<SetTrim>,
}

/// Connection-level operations a coordinator needs.
///
/// Implementations own a single connection and are used from one thread.
pub trait QueueStore: Send + 'static {
    /// Connect (if needed) and register server-side scripts.
    fn bootstrap(&mut self) -> Result<(), StoreError>;

    /// Atomically move entries; see [`Transfer`].
    fn atomic_transfer(&mut self, transfer: &Transfer<'_>) -> Result<Vec<String>, StoreError>;

    /// Remove the occurrence of `value` nearest the tail of `list`.
    /// Returns the number removed (0 or 1).
    fn remove_last(&mut self, list: &str, value: &str) -> Result<usize, StoreError>;

    /// Atomically pop up to `limit` entries from the head of `source` and push
    /// them onto the tail of `destination`, preserving their order.
    fn drain_batch(
        &mut self,
        source: &str,
        destination: &str,
        limit: usize,
    ) -> Result<DrainBatch, StoreError>;

    /// Insert into a sorted set; see [`ScheduledEntry`].
    fn schedule(&mut self, entry: &ScheduledEntry<'_>) -> Result<(), StoreError>;
}

impl<S: QueueStore + ?Sized> QueueStore for Box<S> {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        (**self).bootstrap()
    }

    fn atomic_transfer(&mut self, transfer: &Transfer<'_>) -> Result<Vec<String>, StoreError> {
        (**self).atomic_transfer(transfer)
    }

    fn remove_last(&mut self, list: &str, value: &str) -> Result<usize, StoreError> {
        (**self).remove_last(list, value)
    }

    fn drain_batch(
        &mut self,
        source: &str,
        destination: &str,
        limit: usize,
    ) -> Result<DrainBatch, StoreError> {
        (**self).drain_batch(source, destination, limit)
    }

    fn schedule(&mut self, entry: &ScheduledEntry<'_>) -> Result<(), StoreError> {
        (**self).schedule(entry)
    }
}
