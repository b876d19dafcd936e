//! # Pipeline Runner
//!
//! Submits a genomics pipeline job to Google Cloud and supervises it through
//! worker preemptions.
//!
//! ## Architecture
//!
//! ```text
//! config + workflow ──► JobRequestBuilder ──► JobRequest
//!                                                │
//!                     ┌──────────────────────────▼───────────┐
//!                     │ Orchestrator                         │
//!                     │ ├── RetryBudget   (P first, then NP) │
//!                     │ ├── ExecutionClient (submit backoff) │
//!                     │ ├── Poller        (fixed interval)   │
//!                     │ └── FailureClassifier (fleet lookup) │
//!                     └──────────────────────────┬───────────┘
//!                                                │ Arc<dyn ExecutionBackend>
//!                                         GenomicsBackend (reqwest)
//! ```
//!
//! ## Retry Semantics
//!
//! 1. **Submit** with bounded, jittered exponential backoff on transport errors
//! 2. **Poll** until done, tolerating a few consecutive transient failures
//! 3. **Classify** a failed run: only a confirmed preemption of the assigned
//!    worker is retried, on the next mode the budget allows
//! 4. **Report** a single terminal outcome, mapped to an exit code by `main`
//!
//! See [`orchestrator`] for the state machine.

#![warn(clippy::all)]

pub mod budget;
pub mod classifier;
pub mod client;
pub mod config;
pub mod credentials;
pub mod genomics;
pub mod http;
pub mod inputs;
pub mod orchestrator;
pub mod poller;
pub mod report;
pub mod request;
pub mod shutdown;
pub mod workflow;

// ============================================================================
// Public exports - Orchestration
// ============================================================================

pub use budget::RetryBudget;
pub use classifier::{Classification, FailureClass, FailureClassifier};
pub use client::{ExecutionClient, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use poller::Poller;
pub use report::{Attempt, AttemptOutcome, FatalReason, RunOutcome, RunReport};
pub use shutdown::install_shutdown_handler;

// ============================================================================
// Public exports - Configuration and Google Cloud bindings
// ============================================================================

pub use config::{JobVars, PipelineKind, RunnerConfig};
pub use credentials::{MetadataServerToken, StaticToken};
pub use genomics::GenomicsBackend;
pub use inputs::{GcsObjectStore, InputExistenceChecker, RequiredInput};
pub use request::JobRequestBuilder;
pub use workflow::{InputParameter, WorkflowDescription};

pub use pipeline_core::{PipelineError, Result};
