use std::error::Error;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::error;

use relq_core::{FailureReport, Job, NodeId, QueueName};

use super::actor::Request;
use super::{CallError, CoordinatorConfig, CoordinatorError, CoordinatorState, Drain, Health};

/// Cloneable client for one queue's coordinator.
///
/// Handles stay bound to the coordinator they were created for. After a
/// restart, fetch a fresh one.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    queue: QueueName,
    node_id: NodeId,
    stacktrace_size: usize,
    requests: mpsc::Sender<Request>,
    health: Arc<Health>,
}

impl CoordinatorHandle {
    pub(crate) fn new(
        config: &CoordinatorConfig,
        requests: mpsc::Sender<Request>,
        health: Arc<Health>,
    ) -> Self {
        Self {
            queue: config.queue.clone(),
            node_id: config.node_id.clone(),
            stacktrace_size: config.stacktrace_size,
            requests,
            health,
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> CoordinatorState {
        self.health.get()
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state(), CoordinatorState::Halted { .. })
    }

    /// Move up to `count` jobs (capped at 100) from the queue into this node's
    /// in-progress list. Returns them in the order they were taken.
    pub fn dequeue(&self, count: usize, timeout: Duration) -> Result<Vec<String>, CallError> {
        self.call(|reply| Request::Dequeue { count, reply }, timeout)?
            .map_err(CallError::Store)
    }

    /// Record a handler failure and send the job to the retry or dead set.
    ///
    /// Returns once the coordinator has accepted the failure; the submission
    /// itself happens afterwards. The job leaves the in-progress list as part
    /// of the submission, so it must not be acked as well.
    pub fn retry<S: AsRef<str>>(
        &self,
        job: &Job,
        failed_at: DateTime<Utc>,
        error: &(dyn Error + '_),
        stacktrace: &[S],
        timeout: Duration,
    ) -> Result<(), CallError> {
        // Rendered on the caller's thread; the error need not be `Send`.
        let report = FailureReport::new(failed_at, error, stacktrace, self.stacktrace_size);
        self.call(
            |reply| Request::Retry {
                job: Box::new(job.clone()),
                report,
                reply,
            },
            timeout,
        )
    }

    /// Remove a finished job from the in-progress list. Fire-and-forget.
    pub fn ack(&self, job: &Job) {
        let sent = self.requests.send(Request::Ack {
            jid: job.jid.clone(),
            original_json: job.original_json().to_string(),
        });
        if sent.is_err() {
            error!(
                queue = %self.queue,
                node_id = %self.node_id,
                jid = %job.jid,
                reason = %self.unavailable_reason(),
                "ack dropped: coordinator unavailable"
            );
        }
    }

    /// Remove an undecodable entry from the in-progress list. Fire-and-forget.
    pub fn malformed(&self, raw: impl Into<String>) {
        let sent = self.requests.send(Request::Malformed { raw: raw.into() });
        if let Err(mpsc::SendError(Request::Malformed { raw })) = sent {
            error!(
                queue = %self.queue,
                node_id = %self.node_id,
                payload = %raw,
                reason = %self.unavailable_reason(),
                "malformed removal dropped: coordinator unavailable"
            );
        }
    }

    /// Move one batch of this node's in-progress jobs back onto the queue.
    pub fn enqueue_inprogress(&self, timeout: Duration) -> Result<Drain, CallError> {
        self.call(|reply| Request::EnqueueInProgress { reply }, timeout)?
            .map_err(CallError::Store)
    }

    /// Ask the coordinator to stop after the requests already queued.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    fn call<T>(
        &self,
        request: impl FnOnce(mpsc::Sender<T>) -> Request,
        timeout: Duration,
    ) -> Result<T, CallError> {
        let (reply, response) = mpsc::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| self.unavailable())?;

        match response.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CallError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(self.unavailable()),
        }
    }

    fn unavailable(&self) -> CallError {
        CallError::Unavailable {
            queue: self.queue.to_string(),
            reason: self.unavailable_reason(),
        }
    }

    fn unavailable_reason(&self) -> String {
        match self.state() {
            CoordinatorState::Halted { reason } => reason,
            CoordinatorState::Stopped => "stopped".to_string(),
            other => format!("not serving requests ({other:?})"),
        }
    }
}

/// A started coordinator: its handle plus the thread running it.
#[derive(Debug)]
pub struct RunningCoordinator {
    handle: CoordinatorHandle,
    join: Option<thread::JoinHandle<Result<(), CoordinatorError>>>,
}

impl RunningCoordinator {
    pub(crate) fn new(
        handle: CoordinatorHandle,
        join: thread::JoinHandle<Result<(), CoordinatorError>>,
    ) -> Self {
        Self {
            handle,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.handle.state()
    }

    /// Whether the coordinator thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Wait for the thread to exit and return why it did.
    pub fn join(mut self) -> Result<(), CoordinatorError> {
        match self.join.take() {
            Some(join) => join.join().map_err(|_| CoordinatorError::Panicked)?,
            None => Ok(()),
        }
    }

    /// Request shutdown and wait for the thread to exit.
    pub fn shutdown(self) -> Result<(), CoordinatorError> {
        self.handle.shutdown();
        self.join()
    }
}
