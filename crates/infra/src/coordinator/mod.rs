//! Per-queue job coordinator.
//!
//! One coordinator owns one store connection for one queue on one node. It
//! runs on its own thread and processes requests strictly in arrival order,
//! so no two store mutations it issues ever interleave. Workers talk to it
//! through a cloneable [`CoordinatorHandle`].
//!
//! ```text
//!   worker ──dequeue/retry/recover (reply)──▶ ┌─────────────┐
//!   worker ──ack/malformed (no reply)───────▶ │ coordinator │──▶ store
//!                                             └─────────────┘
//! ```

mod actor;
mod handle;

use std::sync::{Arc, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use relq_core::{DEFAULT_MAX_RETRY_COUNT, DEFAULT_STACKTRACE_SIZE, NodeId, QueueName};

use crate::sets::{DeadSet, RetrySet, SubmitError};
use crate::store::{QueueStore, StoreError};

use actor::QueueCoordinator;
pub use handle::{CoordinatorHandle, RunningCoordinator};

/// How long a synchronous call waits for its reply unless told otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Settings for one queue's coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue: QueueName,
    pub node_id: NodeId,
    /// Record node/queue presence together with every dequeue.
    pub track_node_id: bool,
    /// Frames kept from a failing job's stacktrace.
    pub stacktrace_size: usize,
    /// Retry budget for jobs without their own `max_retry_count`.
    pub default_max_retry_count: u32,
    pub retry_set: RetrySet,
    pub dead_set: DeadSet,
    /// Script registration attempts before `start` gives up.
    pub bootstrap_attempts: u32,
    /// Pause between failed registration attempts.
    pub bootstrap_backoff: Duration,
}

impl CoordinatorConfig {
    pub fn new(queue: QueueName, node_id: NodeId) -> Self {
        Self {
            queue,
            node_id,
            track_node_id: false,
            stacktrace_size: DEFAULT_STACKTRACE_SIZE,
            default_max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_set: RetrySet::default(),
            dead_set: DeadSet::default(),
            bootstrap_attempts: 3,
            bootstrap_backoff: Duration::from_millis(200),
        }
    }

    /// Same settings, different queue.
    pub fn for_queue(&self, queue: QueueName) -> Self {
        Self {
            queue,
            ..self.clone()
        }
    }

    pub fn with_track_node_id(mut self, track: bool) -> Self {
        self.track_node_id = track;
        self
    }

    pub fn with_stacktrace_size(mut self, size: usize) -> Self {
        self.stacktrace_size = size;
        self
    }

    pub fn with_default_max_retry_count(mut self, max: u32) -> Self {
        self.default_max_retry_count = max;
        self
    }

    pub fn with_retry_set(mut self, set: RetrySet) -> Self {
        self.retry_set = set;
        self
    }

    pub fn with_dead_set(mut self, set: DeadSet) -> Self {
        self.dead_set = set;
        self
    }

    pub fn with_bootstrap_attempts(mut self, attempts: u32) -> Self {
        self.bootstrap_attempts = attempts.max(1);
        self
    }

    pub fn with_bootstrap_backoff(mut self, backoff: Duration) -> Self {
        self.bootstrap_backoff = backoff;
        self
    }
}

/// Lifecycle of a coordinator.
///
/// `Connecting → Ready → (Halted | Stopped)`. Nothing leaves `Halted` or
/// `Stopped`; recovery means starting a fresh coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    #[default]
    Connecting,
    Ready,
    Halted { reason: String },
    Stopped,
}

impl CoordinatorState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Lifecycle state shared between a coordinator and its handles.
#[derive(Debug, Default)]
pub(crate) struct Health {
    state: RwLock<CoordinatorState>,
}

impl Health {
    pub(crate) fn get(&self) -> CoordinatorState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set(&self, next: CoordinatorState) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = next;
    }
}

/// Result of one recovery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The in-progress list is empty.
    Done { moved: usize },
    /// Entries remain; call again.
    More { moved: usize, remaining: usize },
}

impl Drain {
    pub fn moved(&self) -> usize {
        match self {
            Self::Done { moved } | Self::More { moved, .. } => *moved,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Failure of a call made through a [`CoordinatorHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// No reply in time. The request may still complete later.
    #[error("coordinator call timed out; outcome unknown")]
    Timeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The coordinator has halted or stopped.
    #[error("coordinator for queue {queue} is unavailable: {reason}")]
    Unavailable { queue: String, reason: String },
}

/// Why a coordinator failed to start or stopped running.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("could not open store: {0}")]
    Connect(#[source] StoreError),

    #[error("bootstrap failed after {attempts} attempt(s): {source}")]
    Bootstrap {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("dequeue failed: {0}")]
    Dequeue(#[source] StoreError),

    #[error("in-progress recovery failed: {0}")]
    Recovery(#[source] StoreError),

    #[error("failed to submit job {jid} to the {set} set: {source}")]
    Submission {
        jid: String,
        set: &'static str,
        #[source]
        source: SubmitError,
    },

    #[error("failed to spawn coordinator thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("coordinator thread panicked")]
    Panicked,
}

/// Entry point for starting coordinators.
pub struct Coordinator;

impl Coordinator {
    /// Register scripts on `store` and start serving requests for
    /// `config.queue`.
    ///
    /// Registration is retried up to `config.bootstrap_attempts` times; if it
    /// never succeeds no thread is started and the error is returned.
    pub fn start<S: QueueStore>(
        config: CoordinatorConfig,
        mut store: S,
    ) -> Result<RunningCoordinator, CoordinatorError> {
        let health = Arc::new(Health::default());
        bootstrap(&config, &mut store)?;
        health.set(CoordinatorState::Ready);

        let (tx, rx) = mpsc::channel();
        let handle = CoordinatorHandle::new(&config, tx, health.clone());
        let actor = QueueCoordinator::new(config, store, health);

        let join = thread::Builder::new()
            .name(format!("relq-{}", handle.queue()))
            .spawn(move || actor.run(rx))
            .map_err(CoordinatorError::Spawn)?;

        Ok(RunningCoordinator::new(handle, join))
    }
}

fn bootstrap<S: QueueStore>(config: &CoordinatorConfig, store: &mut S) -> Result<(), CoordinatorError> {
    let attempts = config.bootstrap_attempts.max(1);
    let mut attempt = 1;
    loop {
        match store.bootstrap() {
            Ok(()) => {
                info!(
                    queue = %config.queue,
                    node_id = %config.node_id,
                    attempt,
                    "queue coordinator ready"
                );
                return Ok(());
            }
            Err(source) if attempt >= attempts || source.is_fatal() => {
                return Err(CoordinatorError::Bootstrap { attempts: attempt, source });
            }
            Err(err) => {
                warn!(
                    queue = %config.queue,
                    attempt,
                    error = %err,
                    "script registration failed; retrying"
                );
                thread::sleep(config.bootstrap_backoff);
                attempt += 1;
            }
        }
    }
}
