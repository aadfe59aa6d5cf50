//! The coordinator thread: owns the store and serves requests one at a time.

use std::sync::{Arc, mpsc};

use tracing::{debug, error, info, warn};

use relq_core::keys::{inprogress_key, queue_key};
use relq_core::{FailureReport, FailureRoute, Job};

use super::{CoordinatorConfig, CoordinatorError, CoordinatorState, Drain, Health};
use crate::store::{MAX_DEQUEUE, Presence, QueueStore, RECOVERY_BATCH, StoreError, Transfer};

/// A request sent by a handle.
#[derive(Debug)]
pub(crate) enum Request {
    Dequeue {
        count: usize,
        reply: mpsc::Sender<Result<Vec<String>, StoreError>>,
    },
    Retry {
        job: Box<Job>,
        report: FailureReport,
        reply: mpsc::Sender<()>,
    },
    Ack {
        jid: String,
        original_json: String,
    },
    Malformed {
        raw: String,
    },
    EnqueueInProgress {
        reply: mpsc::Sender<Result<Drain, StoreError>>,
    },
    Shutdown,
}

pub(crate) struct QueueCoordinator<S: QueueStore> {
    config: CoordinatorConfig,
    store: S,
    health: Arc<Health>,
    queue_key: String,
    inprogress_key: String,
}

impl<S: QueueStore> QueueCoordinator<S> {
    pub(crate) fn new(config: CoordinatorConfig, store: S, health: Arc<Health>) -> Self {
        Self {
            queue_key: queue_key(&config.queue),
            inprogress_key: inprogress_key(&config.queue, &config.node_id),
            config,
            store,
            health,
        }
    }

    /// Serve requests until shutdown, until every handle is dropped, or until a
    /// fatal failure halts the coordinator.
    pub(crate) fn run(mut self, requests: mpsc::Receiver<Request>) -> Result<(), CoordinatorError> {
        while let Ok(request) = requests.recv() {
            let outcome = match request {
                Request::Dequeue { count, reply } => self.dequeue(count, reply),
                Request::Retry { job, report, reply } => self.retry(*job, report, reply),
                Request::Ack { jid, original_json } => {
                    self.ack(&jid, &original_json);
                    Ok(())
                }
                Request::Malformed { raw } => {
                    self.malformed(&raw);
                    Ok(())
                }
                Request::EnqueueInProgress { reply } => self.enqueue_inprogress(reply),
                Request::Shutdown => break,
            };

            if let Err(err) = outcome {
                self.mark_halted(&err);
                error!(
                    queue = %self.config.queue,
                    node_id = %self.config.node_id,
                    error = %err,
                    "queue coordinator halted"
                );
                self.discard_pending(&requests);
                return Err(err);
            }
        }

        info!(queue = %self.config.queue, "queue coordinator stopped");
        self.health.set(CoordinatorState::Stopped);
        Ok(())
    }

    /// Publish the halt before any reply goes out, so a caller holding an
    /// error reply already observes `Halted`.
    fn mark_halted(&self, err: &CoordinatorError) {
        self.health.set(CoordinatorState::Halted {
            reason: err.to_string(),
        });
    }

    fn dequeue(
        &mut self,
        count: usize,
        reply: mpsc::Sender<Result<Vec<String>, StoreError>>,
    ) -> Result<(), CoordinatorError> {
        let presence = self.config.track_node_id.then_some(Presence {
            node_id: &self.config.node_id,
            queue: &self.config.queue,
        });
        let transfer = Transfer {
            source: &self.queue_key,
            destination: &self.inprogress_key,
            count: count.min(MAX_DEQUEUE),
            presence,
        };

        match self.store.atomic_transfer(&transfer) {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    debug!(queue = %self.config.queue, count = jobs.len(), "jobs dequeued");
                }
                if reply.send(Ok(jobs)).is_err() {
                    // The caller timed out; the jobs stay in progress until
                    // recovered.
                    warn!(queue = %self.config.queue, "dequeue reply dropped; caller gone");
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                let halt = CoordinatorError::Dequeue(err.clone());
                self.mark_halted(&halt);
                let _ = reply.send(Err(err));
                Err(halt)
            }
            Err(err) => {
                warn!(queue = %self.config.queue, error = %err, "dequeue failed");
                let _ = reply.send(Err(err));
                Ok(())
            }
        }
    }

    fn retry(
        &mut self,
        mut job: Job,
        report: FailureReport,
        reply: mpsc::Sender<()>,
    ) -> Result<(), CoordinatorError> {
        let failed_at = report.failed_at;
        let route = job.record_failure(report, self.config.default_max_retry_count);

        // The caller is released before the submission is attempted.
        let _ = reply.send(());

        let release = (!job.original_json().is_empty())
            .then_some((self.inprogress_key.as_str(), job.original_json()));

        let (set, submitted) = match route {
            FailureRoute::Retry => {
                debug!(
                    queue = %self.config.queue,
                    jid = %job.jid,
                    retry_count = job.retry_count,
                    "scheduling retry"
                );
                (
                    "retry",
                    self.config.retry_set.add(&mut self.store, &job, failed_at, release),
                )
            }
            FailureRoute::Dead => {
                info!(
                    queue = %self.config.queue,
                    jid = %job.jid,
                    retry_count = job.retry_count,
                    "job exhausted its retries"
                );
                (
                    "dead",
                    self.config.dead_set.add(&mut self.store, &job, failed_at, release),
                )
            }
        };

        submitted.map_err(|source| CoordinatorError::Submission {
            jid: job.jid.clone(),
            set,
            source,
        })
    }

    fn ack(&mut self, jid: &str, original_json: &str) {
        match self.store.remove_last(&self.inprogress_key, original_json) {
            Ok(1) => debug!(queue = %self.config.queue, jid, "job acknowledged"),
            Ok(_) => error!(
                queue = %self.config.queue,
                jid,
                "failed to acknowledge job: not found in progress"
            ),
            Err(err) => error!(
                queue = %self.config.queue,
                jid,
                error = %err,
                "failed to acknowledge job"
            ),
        }
    }

    /// Log fire-and-forget requests still queued when the coordinator halts;
    /// their jobs stay in progress until recovered.
    fn discard_pending(&self, requests: &mpsc::Receiver<Request>) {
        while let Ok(request) = requests.try_recv() {
            match request {
                Request::Ack { jid, .. } => error!(
                    queue = %self.config.queue,
                    node_id = %self.config.node_id,
                    jid,
                    "ack dropped: coordinator halted"
                ),
                Request::Malformed { raw } => error!(
                    queue = %self.config.queue,
                    node_id = %self.config.node_id,
                    payload = raw,
                    "malformed removal dropped: coordinator halted"
                ),
                _ => {}
            }
        }
    }

    fn malformed(&mut self, raw: &str) {
        match self.store.remove_last(&self.inprogress_key, raw) {
            Ok(1) => debug!(queue = %self.config.queue, "malformed job removed"),
            Ok(_) => error!(
                queue = %self.config.queue,
                payload = raw,
                "failed to remove malformed job: not found in progress"
            ),
            Err(err) => error!(
                queue = %self.config.queue,
                payload = raw,
                error = %err,
                "failed to remove malformed job"
            ),
        }
    }

    fn enqueue_inprogress(
        &mut self,
        reply: mpsc::Sender<Result<Drain, StoreError>>,
    ) -> Result<(), CoordinatorError> {
        match self
            .store
            .drain_batch(&self.inprogress_key, &self.queue_key, RECOVERY_BATCH)
        {
            Ok(batch) => {
                let drain = if batch.remaining == 0 {
                    Drain::Done { moved: batch.moved }
                } else {
                    Drain::More {
                        moved: batch.moved,
                        remaining: batch.remaining,
                    }
                };
                info!(
                    queue = %self.config.queue,
                    node_id = %self.config.node_id,
                    moved = batch.moved,
                    remaining = batch.remaining,
                    "in-progress jobs returned to queue"
                );
                let _ = reply.send(Ok(drain));
                Ok(())
            }
            Err(err) => {
                let halt = CoordinatorError::Recovery(err.clone());
                self.mark_halted(&halt);
                let _ = reply.send(Err(err));
                Err(halt)
            }
        }
    }
}
