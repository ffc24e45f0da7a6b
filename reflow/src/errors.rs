//! Error types for the reflow engine.
//!
//! The taxonomy distinguishes aborts (never retried, never swallowed),
//! schema validation failures (naming the responsible step and which side
//! of it failed), storage conditions (with "not found" kept separate so the
//! engine can treat it as a cache miss), and opaque step failures.

use std::path::PathBuf;
use thiserror::Error;

use crate::schema::SchemaError;

/// The main error type for reflow operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An explicit, non-retryable abort.
    #[error("{0}")]
    Abort(#[from] AbortError),

    /// A value failed a step's declared shape.
    #[error("{0}")]
    Validation(#[from] StepValidationError),

    /// A pipeline or element was constructed incorrectly.
    #[error("{0}")]
    Definition(#[from] ElementDefinitionError),

    /// An artifact store failure.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A step transform failed; the error propagates unchanged.
    #[error("step '{step}' failed: {source}")]
    Step {
        /// The name of the failing step.
        step: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Wraps an opaque transform failure with the step's name.
    #[must_use]
    pub fn step_failure(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Step {
            step: step.into(),
            source,
        }
    }

    /// Returns true if this error is an explicit abort.
    ///
    /// Aborts propagate immediately and never consume a retry attempt.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }

    /// Returns true if this error is a store "not found" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

/// An explicit, non-retryable abort.
///
/// Raised for user cancellation, exhausted budgets, and fatal
/// misconfiguration. Retry logic must let it through untouched.
#[derive(Debug, Clone, Error)]
#[error("pipeline aborted: {reason}")]
pub struct AbortError {
    /// Why the run was aborted.
    pub reason: String,
}

impl AbortError {
    /// Creates a new abort with a reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Creates an abort for an exhausted budget.
    #[must_use]
    pub fn budget_exceeded(spent: f64, limit: f64) -> Self {
        Self::new(format!("budget exceeded: spent {spent:.2} of {limit:.2}"))
    }
}

/// Which value around a step failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOrigin {
    /// The initial pipeline input did not fit the first step.
    InitialInput,
    /// The merged output of a previous step did not fit this step.
    PriorOutput {
        /// The step whose output broke the composition.
        prior: String,
    },
    /// The step's own result did not fit its declared result shape.
    StepResult,
    /// The final merged value did not fit the pipeline's result shape.
    FinalResult,
}

/// Error raised when a value fails a step's declared shape.
///
/// Distinguishes a bad initial input from a broken composition between
/// steps, because those point at different bugs.
#[derive(Debug, Clone)]
pub struct StepValidationError {
    /// The step whose shape was violated.
    pub step: String,
    /// Which value failed.
    pub origin: ValidationOrigin,
    /// The underlying schema failure.
    pub source: SchemaError,
}

impl StepValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(step: impl Into<String>, origin: ValidationOrigin, source: SchemaError) -> Self {
        Self {
            step: step.into(),
            origin,
            source,
        }
    }
}

impl std::fmt::Display for StepValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            ValidationOrigin::InitialInput => write!(
                f,
                "initial input is invalid for step '{}': {}",
                self.step, self.source
            ),
            ValidationOrigin::PriorOutput { prior } => write!(
                f,
                "output of step '{}' is invalid as input for step '{}': {}",
                prior, self.step, self.source
            ),
            ValidationOrigin::StepResult => write!(
                f,
                "result of step '{}' does not match its declared shape: {}",
                self.step, self.source
            ),
            ValidationOrigin::FinalResult => write!(
                f,
                "final value after step '{}' does not match the pipeline result shape: {}",
                self.step, self.source
            ),
        }
    }
}

impl std::error::Error for StepValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Error raised when a pipeline or element is constructed incorrectly.
#[derive(Debug, Clone, Error)]
#[error("invalid element '{name}': {reason}")]
pub struct ElementDefinitionError {
    /// The offending element name.
    pub name: String,
    /// What was wrong with it.
    pub reason: String,
}

impl ElementDefinitionError {
    /// Creates a new definition error.
    #[must_use]
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No artifact exists at the path. The normal cache-miss path, not a
    /// fatal failure.
    #[error("no artifact at {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// An I/O failure other than "not found".
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact exists but could not be decoded.
    #[error("failed to decode artifact at {}: {source}", path.display())]
    Decode {
        /// The artifact path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The document could not be encoded for writing.
    #[error("failed to encode artifact for {}: {source}", path.display())]
    Encode {
        /// The artifact path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A document failed its shape check at the store boundary. The store
    /// never persists invalid state.
    #[error("refusing to use invalid {side} document: {source}")]
    InvalidDocument {
        /// Which document failed ("input" or "result").
        side: &'static str,
        /// The underlying schema failure.
        #[source]
        source: SchemaError,
    },
}

impl StoreError {
    /// Maps an I/O error to either `NotFound` or `Io`.
    #[must_use]
    pub fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Returns true for the "not found" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_not_retryable_class() {
        let err = PipelineError::from(AbortError::new("user cancelled"));
        assert!(err.is_abort());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_budget_abort_message() {
        let err = AbortError::budget_exceeded(12.5, 10.0);
        assert!(err.to_string().contains("budget exceeded"));
        assert!(err.to_string().contains("12.50"));
    }

    #[test]
    fn test_validation_error_names_initial_input() {
        let err = StepValidationError::new(
            "plan",
            ValidationOrigin::InitialInput,
            SchemaError::new("$", "expected object"),
        );
        let text = err.to_string();
        assert!(text.contains("initial input"));
        assert!(text.contains("'plan'"));
    }

    #[test]
    fn test_validation_error_names_prior_step() {
        let err = StepValidationError::new(
            "edit",
            ValidationOrigin::PriorOutput {
                prior: "plan".to_string(),
            },
            SchemaError::new("$.files", "expected array"),
        );
        let text = err.to_string();
        assert!(text.contains("output of step 'plan'"));
        assert!(text.contains("step 'edit'"));
    }

    #[test]
    fn test_store_not_found_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StoreError::from_io(PathBuf::from("a/b.yaml"), io);
        assert!(err.is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = StoreError::from_io(PathBuf::from("a/b.yaml"), io);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_step_failure_keeps_source_text() {
        let err = PipelineError::step_failure("lint", anyhow::anyhow!("exit status 2"));
        assert!(err.to_string().contains("'lint'"));
    }
}
