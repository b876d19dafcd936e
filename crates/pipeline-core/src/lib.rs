//! Pipeline Core - Shared types and traits
//!
//! This crate defines the abstractions the pipeline runner is built on:
//! - `JobRequest` and `RemoteOperation` (the submitted job and its handle)
//! - `ExecutionBackend`, `CredentialProvider`, `ObjectStore` collaborator traits
//! - `PipelineError`, the error taxonomy shared by every layer

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
