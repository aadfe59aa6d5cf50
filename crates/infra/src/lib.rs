//! Infrastructure layer: store access, per-queue coordinators, config.
//!
//! - [`store`]: the [`store::QueueStore`] boundary plus in-memory and Redis
//!   backends
//! - [`coordinator`]: the single-owner coordinator and its handle
//! - [`supervisor`]: one coordinator per queue, restarted when halted
//! - [`sets`]: retry and dead sets
//! - [`config`]: settings loaded from the environment

pub mod config;
pub mod coordinator;
pub mod sets;
pub mod store;
pub mod supervisor;

pub use config::{ConfigError, NodeIdentity, RedisOptions, RelqConfig, ValidatedConfig};
pub use coordinator::{
    CallError, Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorHandle,
    CoordinatorState, DEFAULT_CALL_TIMEOUT, Drain, RunningCoordinator,
};
pub use sets::{DeadSet, RetrySet, SubmitError};
pub use store::{InMemoryStore, QueueStore, StoreError};
pub use supervisor::Supervisor;
