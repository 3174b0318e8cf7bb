#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Orca Queue
//!
//! Durable, delayed-delivery work queue driving a pipeline execution state
//! machine.
//!
//! ## Overview
//!
//! A pipeline execution is a DAG of stages; each stage expands into a linear
//! list of tasks plus synthetic before/after/parallel stages. Progress is made
//! exclusively through small immutable [`messaging::Message`]s on a
//! [`queue::Queue`]: a worker polls a message, the handler for its kind reads
//! the current execution state, mutates it and pushes follow-up messages. A
//! message is acknowledged only after its handler succeeds, so an unacked
//! message is redelivered after its ack timeout and every handler is written
//! to tolerate replays.
//!
//! ## Module Organization
//!
//! - [`models`] - executions, stages, tasks, phase assignment and derived state
//! - [`messaging`] - the message union and its addressing payloads
//! - [`queue`] - queue contract, in-memory and Postgres queues, traffic shaping, shovel
//! - [`repository`] - execution persistence
//! - [`pipeline`] - task graphs, stage builders and synthetic stage planning
//! - [`tasks`] - task implementations and their resolver
//! - [`exceptions`] - task failure classification
//! - [`handlers`] - one handler per message kind
//! - [`processor`] - the polling worker pool
//! - [`bootstrap`] - assembling a complete system
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging initialisation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orca_queue::bootstrap::OrcaQueueSystem;
//! use orca_queue::config::ConfigLoader;
//! use orca_queue::models::{Execution, Stage};
//!
//! # async fn example() -> orca_queue::Result<()> {
//! orca_queue::logging::init_structured_logging();
//! let config = ConfigLoader::new().load()?;
//! let system = OrcaQueueSystem::builder().with_config(config).build().await?;
//! system.start();
//!
//! let execution = Execution::pipeline("app")
//!     .with_stage(Stage::new("wait", "first", "1"))
//!     .with_stage(Stage::new("wait", "second", "2").with_requisites(["1"]));
//! system.submit(&execution).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                   # unit + integration tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # Postgres queue tests
//! ```

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod exceptions;
pub mod handlers;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod tasks;

pub use bootstrap::{OrcaQueueSystem, OrcaQueueSystemBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigLoader, QueueSystemConfig};
pub use constants::{status_groups, ExecutionStatus};
pub use error::{OrcaError, Result};
pub use handlers::{HandlerContext, HandlerError, MessageHandler};
pub use messaging::{ExecutionAddress, Message, MessageKind, StageAddress, TaskAddress};
pub use models::{Execution, ExecutionType, Stage};
pub use processor::QueueProcessor;
pub use queue::{InMemoryQueue, Queue, QueueError};
pub use repository::{ExecutionRepository, InMemoryExecutionRepository, RepositoryError};
