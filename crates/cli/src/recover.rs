//! Draining a node's in-progress lists back onto their queues.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use relq_core::{BackoffPolicy, QueueName};
use relq_infra::store::{QueueStore, StoreError};
use relq_infra::{CallError, CoordinatorError, DEFAULT_CALL_TIMEOUT, Supervisor};

#[derive(Debug, Clone)]
pub struct RecoverOptions {
    /// Coordinator restarts allowed before a queue is given up on.
    pub max_restarts: u32,
    pub call_timeout: Duration,
    /// Pause before each restart.
    pub backoff: BackoffPolicy,
}

impl Default for RecoverOptions {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            backoff: BackoffPolicy::exponential(Duration::from_millis(250), Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoverError {
    #[error("coordinator failed to start: {0}")]
    Start(#[from] CoordinatorError),

    #[error("gave up after {restarts} restart(s): {last}")]
    Exhausted { restarts: u32, last: CallError },
}

/// Call `enqueue_inprogress` on `queue`'s coordinator until it reports done.
///
/// A failed call halts the coordinator; it is then rebuilt from scratch
/// (fresh connection, scripts registered again) up to `max_restarts` times.
/// Timed-out calls count against the same budget. Returns the number of jobs
/// moved.
pub fn drain_queue<S, F>(
    supervisor: &mut Supervisor<S, F>,
    queue: &QueueName,
    options: &RecoverOptions,
) -> Result<usize, RecoverError>
where
    S: QueueStore,
    F: FnMut(&QueueName) -> Result<S, StoreError>,
{
    let mut handle = supervisor.start(queue)?;
    let mut moved = 0;
    let mut restarts = 0;

    loop {
        let last = match handle.enqueue_inprogress(options.call_timeout) {
            Ok(drain) => {
                moved += drain.moved();
                if drain.is_done() {
                    return Ok(moved);
                }
                info!(queue = %queue, moved, "recovery in progress");
                continue;
            }
            Err(err) => err,
        };

        if restarts >= options.max_restarts {
            return Err(RecoverError::Exhausted { restarts, last });
        }
        restarts += 1;
        warn!(queue = %queue, attempt = restarts, error = %last, "recovery call failed");
        thread::sleep(options.backoff.delay_for_attempt(restarts));

        // Timeouts leave the coordinator running; only halted ones are rebuilt.
        supervisor.restart_halted();
        if let Some(fresh) = supervisor.handle(queue) {
            handle = fresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use relq_core::NodeId;
    use relq_infra::CoordinatorConfig;
    use relq_infra::store::{Fault, InMemoryStore};

    use super::*;

    const IN_PROGRESS: &str = "inprogress:q:crashed";

    fn queue() -> QueueName {
        QueueName::new("q").unwrap()
    }

    fn options() -> RecoverOptions {
        RecoverOptions {
            max_restarts: 2,
            call_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::fixed(Duration::ZERO),
        }
    }

    fn supervisor(
        store: &InMemoryStore,
    ) -> Supervisor<InMemoryStore, impl FnMut(&QueueName) -> Result<InMemoryStore, StoreError> + '_>
    {
        let config = CoordinatorConfig::new(queue(), NodeId::new("crashed").unwrap())
            .with_bootstrap_attempts(1)
            .with_bootstrap_backoff(Duration::ZERO);
        Supervisor::new(config, move |_: &QueueName| Ok(store.clone()))
    }

    #[test]
    fn drains_everything_across_batches() {
        let store = InMemoryStore::new();
        for i in 0..2_345 {
            store.push(IN_PROGRESS, format!("e{i}"));
        }
        let mut supervisor = supervisor(&store);

        let moved = drain_queue(&mut supervisor, &queue(), &options()).unwrap();

        assert_eq!(moved, 2_345);
        assert_eq!(store.list_len(IN_PROGRESS), 0);
        assert_eq!(store.list_len("queue:q"), 2_345);
        supervisor.shutdown();
    }

    #[test]
    fn restarts_after_a_failed_call() {
        let store = InMemoryStore::new();
        store.push(IN_PROGRESS, "e1");
        let mut supervisor = supervisor(&store);
        supervisor.start(&queue()).unwrap();
        store.inject(Fault::Transient);

        let moved = drain_queue(&mut supervisor, &queue(), &options()).unwrap();

        assert_eq!(moved, 1);
        assert_eq!(store.list("queue:q"), vec!["e1"]);
        supervisor.shutdown();
    }

    #[test]
    fn gives_up_when_restarts_are_exhausted() {
        let store = InMemoryStore::new();
        store.push(IN_PROGRESS, "e1");
        let mut supervisor = supervisor(&store);
        supervisor.start(&queue()).unwrap();
        // One fault fails the call, the rest fail every restart's bootstrap.
        for _ in 0..3 {
            store.inject(Fault::Fatal);
        }

        let err = drain_queue(&mut supervisor, &queue(), &options()).unwrap_err();

        assert!(matches!(err, RecoverError::Exhausted { restarts: 2, .. }));
        assert_eq!(store.list(IN_PROGRESS), vec!["e1"]);
        supervisor.shutdown();
    }
}
