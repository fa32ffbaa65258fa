//! # MedQ Core
//!
//! Broker-backed background job dispatch for the MedQ clinical messaging
//! platform.
//!
//! ## Architecture
//!
//! - **Queue Registry**: process-wide table of named queues, built once at startup
//! - **Dispatcher**: single and atomic bulk enqueue with field-by-field option merging
//! - **Worker Runtime**: per-queue claim loops at bounded concurrency with
//!   retry/backoff and stalled-job reclaim
//! - **Event Observer**: fixed lifecycle hook table per queue for logging and metrics
//! - **Broker**: Redis-backed durable storage; an in-memory backend serves tests
//!
//! The HTTP layer, authentication, and the clinical domain live in the host
//! application; this crate only accepts payloads and runs registered
//! handlers.

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{DispatchError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BrokerConfig, Config, ReconnectPolicy, WorkerSettings};
    pub use crate::error::{DispatchError, ErrorCode, ErrorSeverity, Result};
    pub use crate::jobs::{
        default_definitions, Backoff, Broker, ConfirmationGateway, DispatchResult, Dispatcher,
        HandlerError, HandlerOutcome, InMemoryBroker, JobContext, JobId, JobInstance, JobOptions,
        JobState, LoggingGateway, QueueEvents, QueueHandle, QueueJob, QueueRegistry, RedisBroker,
        WorkerConfig, WorkerRuntime,
    };
}
