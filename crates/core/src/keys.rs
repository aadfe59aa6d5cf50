//! Store key layout.
//!
//! Every queue has its own keys; nothing here is shared between queues except
//! the node discovery set and the retry/dead sorted sets.

use crate::id::{NodeId, QueueName};

/// Set of every node that has ever dequeued with tracking enabled.
pub const NODES_KEY: &str = "relq_nodes";

/// Sorted set of jobs waiting for a retry, scored by due time.
pub const RETRY_KEY: &str = "retry";

/// Sorted set of terminally failed jobs, scored by failure time.
pub const DEAD_KEY: &str = "dead";

/// Work queue: `queue:<queue>`.
pub fn queue_key(queue: &QueueName) -> String {
    format!("queue:{queue}")
}

/// Node-local in-progress list: `inprogress:<queue>:<node>`.
pub fn inprogress_key(queue: &QueueName, node: &NodeId) -> String {
    format!("inprogress:{queue}:{node}")
}

/// Queues owned by a node: `relq:node:<node>:queues`.
pub fn node_queues_key(node: &NodeId) -> String {
    format!("relq:node:{node}:queues")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let queue = QueueName::new("orders").unwrap();
        let node = NodeId::new("n1").unwrap();
        assert_eq!(queue_key(&queue), "queue:orders");
        assert_eq!(inprogress_key(&queue, &node), "inprogress:orders:n1");
        assert_eq!(node_queues_key(&node), "relq:node:n1:queues");
    }
}
