//! # Reflow
//!
//! A persisted, content-addressed pipeline engine for resumable
//! refactoring workflows.
//!
//! Reflow memoizes arbitrary asynchronous steps by the hash of their
//! validated input, persists every intermediate result to disk, and
//! resumes interrupted runs by rediscovering those artifacts:
//!
//! - **Deterministic memoization**: the same step, given the same
//!   validated input under the same location, always addresses the same
//!   cache id — across calls and across process restarts
//! - **Schema-checked composition**: steps declare input and result
//!   shapes; data flowing between them is validated and normalized, and
//!   cached results are speculatively checked against the *next* step
//!   before being reused
//! - **Retry with cache isolation**: each retry attempt addresses a fresh
//!   id chain, so a failed attempt's artifacts are never replayed
//! - **Scoped garbage collection**: each nesting level cleans its own
//!   stale artifacts without touching live nested levels
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reflow::prelude::*;
//!
//! let pipeline = Pipeline::new(input_shape)
//!     .append(plan_step)?
//!     .append(edit_step)?
//!     .with_retry(RetryOptions::new(2));
//!
//! let session = RunSession::begin(".cache/refactor-run");
//! let result = pipeline.transform_with(input, &session.context()).await?;
//! pipeline.clean(&session.context()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cleanup;
pub mod element;
pub mod engine;
pub mod errors;
pub mod hashing;
pub mod pipeline;
pub mod schema;
pub mod state;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cleanup::CleanupReport;
    pub use crate::element::{
        CombineStrategy, Determinism, FnTransform, StepElement, Transform,
    };
    pub use crate::errors::{
        AbortError, ElementDefinitionError, PipelineError, StepValidationError, StoreError,
        ValidationOrigin,
    };
    pub use crate::hashing::{hash_value, short_hash};
    pub use crate::pipeline::{
        BackoffStrategy, JitterStrategy, Pipeline, RetryOptions, ATTEMPT_FIELD,
    };
    pub use crate::schema::{ObjectShape, SchemaError, Shape};
    pub use crate::state::{Budget, RunOptions, RunSession, StepContext};
}
