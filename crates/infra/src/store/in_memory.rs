//! In-memory store for tests/dev.
//!
//! Clones share one state, the way several connections share one server.
//! Every operation runs under a single lock, which gives the same
//! indivisibility a server-side script or `MULTI/EXEC` block gives.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use relq_core::keys::{NODES_KEY, node_queues_key};

use super::{DrainBatch, QueueStore, ScheduledEntry, StoreError, Transfer};

/// A failure to inject into the next store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail before touching any data; reported as transient.
    Transient,
    /// Fail before touching any data; reported as fatal.
    Fatal,
    /// Apply the operation, then report a dropped connection: the server did
    /// the work but the client never saw the reply.
    DropAfterApply,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Front is the head (`LPUSH` side), back is the tail (`RPOP` side).
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Ordered by (score, member).
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
    scripts_loaded: bool,
    faults: VecDeque<Fault>,
}

/// In-memory list/set store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::fatal("in-memory store lock poisoned"))
    }

    fn inspect<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *guard)
    }

    /// Push onto the head of a list (`LPUSH`), the way producers enqueue.
    pub fn push(&self, list: &str, value: impl Into<String>) {
        let value = value.into();
        self.inspect(|s| s.lists.entry(list.to_string()).or_default().push_front(value));
    }

    /// Snapshot of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inspect(|s| {
            s.lists
                .get(key)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.inspect(|s| s.lists.get(key).map_or(0, VecDeque::len))
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        self.inspect(|s| {
            s.sets
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Snapshot of a sorted set, lowest score first.
    pub fn sorted_set(&self, key: &str) -> Vec<(f64, String)> {
        self.inspect(|s| s.sorted_sets.get(key).cloned().unwrap_or_default())
    }

    /// Forget registered scripts, as `SCRIPT FLUSH` would.
    pub fn flush_scripts(&self) {
        self.inspect(|s| s.scripts_loaded = false);
    }

    /// Queue a fault for the next operation (faults fire in FIFO order).
    pub fn inject(&self, fault: Fault) {
        self.inspect(|s| s.faults.push_back(fault));
    }

    /// Run `op` against the state, honouring any pending fault.
    fn run<T>(&self, op: impl FnOnce(&mut MemoryState) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut state = self.lock()?;
        match state.faults.pop_front() {
            Some(Fault::Transient) => Err(StoreError::transient("connection reset by peer")),
            Some(Fault::Fatal) => Err(StoreError::fatal("ERR injected protocol failure")),
            Some(Fault::DropAfterApply) => {
                op(&mut *state)?;
                Err(StoreError::transient("connection dropped before reply"))
            }
            None => op(&mut *state),
        }
    }
}

impl MemoryState {
    fn require_scripts(&self) -> Result<(), StoreError> {
        if self.scripts_loaded {
            Ok(())
        } else {
            Err(StoreError::fatal(
                "NOSCRIPT No matching script. Please use EVAL.",
            ))
        }
    }

    fn remove_last(&mut self, list: &str, value: &str) -> usize {
        let Some(entries) = self.lists.get_mut(list) else {
            return 0;
        };
        match entries.iter().rposition(|e| e == value) {
            Some(idx) => {
                entries.remove(idx);
                1
            }
            None => 0,
        }
    }
}

impl QueueStore for InMemoryStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        self.run(|state| {
            state.scripts_loaded = true;
            Ok(())
        })
    }

    fn atomic_transfer(&mut self, transfer: &Transfer<'_>) -> Result<Vec<String>, StoreError> {
        self.run(|state| {
            state.require_scripts()?;

            if let Some(presence) = transfer.presence {
                state
                    .sets
                    .entry(NODES_KEY.to_string())
                    .or_default()
                    .insert(presence.node_id.to_string());
                state
                    .sets
                    .entry(node_queues_key(presence.node_id))
                    .or_default()
                    .insert(presence.queue.to_string());
            }

            let mut moved = Vec::new();
            for _ in 0..transfer.count {
                let Some(entry) = state
                    .lists
                    .get_mut(transfer.source)
                    .and_then(VecDeque::pop_back)
                else {
                    break;
                };
                state
                    .lists
                    .entry(transfer.destination.to_string())
                    .or_default()
                    .push_front(entry.clone());
                moved.push(entry);
            }
            Ok(moved)
        })
    }

    fn remove_last(&mut self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.run(|state| Ok(state.remove_last(list, value)))
    }

    fn drain_batch(
        &mut self,
        source: &str,
        destination: &str,
        limit: usize,
    ) -> Result<DrainBatch, StoreError> {
        self.run(|state| {
            state.require_scripts()?;

            let mut moved = 0;
            while moved < limit {
                let Some(entry) = state.lists.get_mut(source).and_then(VecDeque::pop_front) else {
                    break;
                };
                state
                    .lists
                    .entry(destination.to_string())
                    .or_default()
                    .push_back(entry);
                moved += 1;
            }
            let remaining = state.lists.get(source).map_or(0, VecDeque::len);
            Ok(DrainBatch { remaining, moved })
        })
    }

    fn schedule(&mut self, entry: &ScheduledEntry<'_>) -> Result<(), StoreError> {
        self.run(|state| {
            let set = state.sorted_sets.entry(entry.set.to_string()).or_default();
            set.retain(|(_, member)| member != entry.member);
            set.push((entry.score, entry.member.to_string()));
            set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

            if let Some(trim) = entry.trim {
                set.retain(|(score, _)| *score >= trim.min_score);
                let excess = set.len().saturating_sub(trim.max_len);
                set.drain(..excess);
            }

            if let Some((list, value)) = entry.release {
                state.remove_last(list, value);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use relq_core::{NodeId, QueueName};

    use super::*;
    use crate::store::{Presence, SetTrim};

    fn ready_store() -> InMemoryStore {
        let mut store = InMemoryStore::new();
        store.bootstrap().unwrap();
        store
    }

    fn transfer<'a>(count: usize) -> Transfer<'a> {
        Transfer {
            source: "queue:q",
            destination: "inprogress:q:n",
            count,
            presence: None,
        }
    }

    #[test]
    fn transfer_moves_tail_to_head_in_order() {
        let mut store = ready_store();
        for i in 1..=5 {
            store.push("queue:q", format!("e{i}"));
        }
        // head -> tail: e5 e4 e3 e2 e1

        let moved = store.atomic_transfer(&transfer(3)).unwrap();

        assert_eq!(moved, vec!["e1", "e2", "e3"]);
        assert_eq!(store.list("queue:q"), vec!["e5", "e4"]);
        assert_eq!(store.list("inprogress:q:n"), vec!["e3", "e2", "e1"]);
    }

    #[test]
    fn transfer_requires_registered_scripts() {
        let mut store = InMemoryStore::new();
        store.push("queue:q", "e1");

        let err = store.atomic_transfer(&transfer(1)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.list_len("queue:q"), 1);
    }

    #[test]
    fn transfer_registers_presence() {
        let mut store = ready_store();
        let node = NodeId::new("n").unwrap();
        let queue = QueueName::new("q").unwrap();

        let moved = store
            .atomic_transfer(&Transfer {
                presence: Some(Presence {
                    node_id: &node,
                    queue: &queue,
                }),
                ..transfer(10)
            })
            .unwrap();

        assert!(moved.is_empty());
        assert_eq!(store.set_members(NODES_KEY), vec!["n"]);
        assert_eq!(store.set_members("relq:node:n:queues"), vec!["q"]);
    }

    #[test]
    fn remove_last_takes_occurrence_nearest_tail() {
        let mut store = ready_store();
        store.push("l", "a");
        store.push("l", "b");
        store.push("l", "a");
        // head -> tail: a b a

        assert_eq!(store.remove_last("l", "a").unwrap(), 1);
        assert_eq!(store.list("l"), vec!["a", "b"]);
        assert_eq!(store.remove_last("l", "missing").unwrap(), 0);
    }

    #[test]
    fn drain_batch_preserves_order_at_tail() {
        let mut store = ready_store();
        store.push("queue:q", "pending");
        for i in 1..=3 {
            store.push("inprogress:q:n", format!("e{i}"));
        }
        // inprogress head -> tail: e3 e2 e1

        let batch = store.drain_batch("inprogress:q:n", "queue:q", 2).unwrap();
        assert_eq!(batch, DrainBatch { remaining: 1, moved: 2 });

        let batch = store.drain_batch("inprogress:q:n", "queue:q", 2).unwrap();
        assert_eq!(batch, DrainBatch { remaining: 0, moved: 1 });

        assert_eq!(store.list("queue:q"), vec!["pending", "e3", "e2", "e1"]);
    }

    #[test]
    fn schedule_releases_and_trims() {
        let mut store = ready_store();
        store.push("inprogress:q:n", "job");

        for (score, member) in [(1.0, "old"), (5.0, "a"), (6.0, "b")] {
            store
                .schedule(&ScheduledEntry {
                    set: "dead",
                    score,
                    member,
                    release: None,
                    trim: None,
                })
                .unwrap();
        }
        store
            .schedule(&ScheduledEntry {
                set: "dead",
                score: 7.0,
                member: "job",
                release: Some(("inprogress:q:n", "job")),
                trim: Some(SetTrim {
                    min_score: 2.0,
                    max_len: 2,
                }),
            })
            .unwrap();

        let members: Vec<_> = store.sorted_set("dead").into_iter().map(|(_, m)| m).collect();
        assert_eq!(members, vec!["b", "job"]);
        assert_eq!(store.list_len("inprogress:q:n"), 0);
    }

    #[test]
    fn drop_after_apply_mutates_but_reports_error() {
        let mut store = ready_store();
        store.push("queue:q", "e1");
        store.inject(Fault::DropAfterApply);

        let err = store.atomic_transfer(&transfer(1)).unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(store.list("inprogress:q:n"), vec!["e1"]);
        assert_eq!(store.list_len("queue:q"), 0);
    }
}
