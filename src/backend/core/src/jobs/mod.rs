//! Background job dispatch for MedQ.
//!
//! This module provides the job-dispatch subsystem:
//!
//! - **Job Definitions**: named units of work with default delay/retry policy
//! - **Queue Registry**: the process-wide table of named queues, built once at startup
//! - **Dispatcher**: single and atomic bulk enqueue with option merging
//! - **Worker Runtime**: per-queue processing loops at bounded concurrency
//! - **Event Observer**: fixed lifecycle hooks for logging and metrics
//! - **Broker**: durable storage, claiming, and retry scheduling (Redis or in-memory)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Job Dispatch Subsystem                         │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌───────────┐  │
//! │  │  Dispatcher │───▶│   Broker    │───▶│   Worker    │───▶│  Handler  │  │
//! │  │ (add/bulk)  │    │ (durable)   │    │  Runtime    │    │ (QueueJob)│  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └───────────┘  │
//! │         │                  │                  │                  │       │
//! │         └──────────────────┴───────┬──────────┴──────────────────┘       │
//! │                                    ▼                                     │
//! │                  Queue Registry + Event Observer (per queue)             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use medq_core::jobs::{
//!     default_definitions, Dispatcher, LoggingGateway, QueueRegistry,
//!     RedisBroker, WorkerConfig, WorkerRuntime,
//! };
//!
//! let broker = Arc::new(RedisBroker::connect(&config.broker).await?);
//! let registry = Arc::new(QueueRegistry::register(
//!     broker,
//!     default_definitions(Arc::new(LoggingGateway)),
//! )?);
//!
//! // Enqueue from any request-handling context
//! let dispatcher = Dispatcher::new(registry.clone());
//! dispatcher.add("WebhookCancel", payload).await?;
//!
//! // Process in the worker process
//! let runtime = WorkerRuntime::start(registry, WorkerConfig::default());
//! ```

pub mod broker;
pub mod dispatcher;
pub mod handlers;
pub mod job;
pub mod observer;
pub mod registry;
pub mod worker;

pub use broker::{Broker, InMemoryBroker, QueueCounts, RedisBroker};
pub use dispatcher::{DispatchResult, Dispatcher};
pub use handlers::{
    default_definitions, ApiMessageJob, CancellationPayload, ConfirmationGateway,
    ConfirmationMessageJob, GatewayError, LoggingGateway, MessageEnvelope, WebhookCancelJob,
};
pub use job::{
    Backoff, HandlerError, HandlerOutcome, JobContext, JobId, JobInstance, JobOptions, JobState,
    QueueJob,
};
pub use observer::{CleanHook, FailureHook, JobHook, LogHook, QueueEvents};
pub use registry::{QueueHandle, QueueRegistry};
pub use worker::{WorkerConfig, WorkerRuntime};
