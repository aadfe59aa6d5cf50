//! Owns one coordinator per queue and restarts the ones that halt.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use relq_core::QueueName;

use crate::coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorHandle, RunningCoordinator,
};
use crate::store::{QueueStore, StoreError};

/// Keeps a coordinator running per queue.
///
/// `factory` opens a fresh store (one connection) for a queue; it is called on
/// every start and restart.
pub struct Supervisor<S, F>
where
    S: QueueStore,
    F: FnMut(&QueueName) -> Result<S, StoreError>,
{
    base: CoordinatorConfig,
    factory: F,
    running: BTreeMap<QueueName, RunningCoordinator>,
}

impl<S, F> Supervisor<S, F>
where
    S: QueueStore,
    F: FnMut(&QueueName) -> Result<S, StoreError>,
{
    /// `base` supplies every setting except the queue.
    pub fn new(base: CoordinatorConfig, factory: F) -> Self {
        Self {
            base,
            factory,
            running: BTreeMap::new(),
        }
    }

    /// Start the coordinator for `queue`, or return the one already running.
    pub fn start(&mut self, queue: &QueueName) -> Result<CoordinatorHandle, CoordinatorError> {
        if let Some(running) = self.running.get(queue) {
            if running.state().is_running() {
                return Ok(running.handle());
            }
        }
        self.spawn(queue)
    }

    fn spawn(&mut self, queue: &QueueName) -> Result<CoordinatorHandle, CoordinatorError> {
        let store = (self.factory)(queue).map_err(CoordinatorError::Connect)?;
        let running = Coordinator::start(self.base.for_queue(queue.clone()), store)?;
        let handle = running.handle();

        if let Some(previous) = self.running.insert(queue.clone(), running) {
            reap(queue, previous);
        }
        Ok(handle)
    }

    /// Handle for `queue`'s current coordinator.
    pub fn handle(&self, queue: &QueueName) -> Option<CoordinatorHandle> {
        self.running.get(queue).map(RunningCoordinator::handle)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueName> {
        self.running.keys()
    }

    /// Replace every halted coordinator with a fresh one.
    ///
    /// Returns the queues that were restarted, each with the outcome. A queue
    /// whose restart fails stays halted and is retried on the next call.
    pub fn restart_halted(&mut self) -> Vec<(QueueName, Result<(), CoordinatorError>)> {
        let halted: Vec<QueueName> = self
            .running
            .iter()
            .filter(|(_, running)| running.handle().is_halted())
            .map(|(queue, _)| queue.clone())
            .collect();

        halted
            .into_iter()
            .map(|queue| {
                warn!(queue = %queue, "restarting halted coordinator");
                let outcome = self.spawn(&queue).map(|_| ());
                if let Err(err) = &outcome {
                    error!(queue = %queue, error = %err, "coordinator restart failed");
                }
                (queue, outcome)
            })
            .collect()
    }

    /// Stop every coordinator and wait for their threads.
    pub fn shutdown(self) {
        for running in self.running.values() {
            running.handle().shutdown();
        }
        for (queue, running) in self.running {
            reap(&queue, running);
        }
        info!("all queue coordinators stopped");
    }
}

fn reap(queue: &QueueName, running: RunningCoordinator) {
    if let Err(err) = running.join() {
        warn!(queue = %queue, error = %err, "coordinator exited with error");
    }
}
