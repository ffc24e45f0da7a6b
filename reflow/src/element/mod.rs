//! Step elements: the unit of work in a pipeline.
//!
//! A [`StepElement`] bundles a name, the declared input and result shapes,
//! the transform itself, an optional combine strategy, and a determinism
//! classification. Elements are immutable once constructed; the pipeline
//! builder copies them rather than mutating.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::errors::{ElementDefinitionError, PipelineError};
use crate::hashing::short_hash;
use crate::schema::Shape;
use crate::state::StepContext;

/// Trait for step transforms.
///
/// Transforms receive the validated input and the step context (session
/// plus this level's persistence location), and return a
/// JSON-serializable result.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Executes the transform.
    async fn run(&self, input: Value, ctx: StepContext) -> Result<Value, PipelineError>;
}

/// A function-based transform.
pub struct FnTransform<F, Fut>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, PipelineError>> + Send,
{
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTransform<F, Fut>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, PipelineError>> + Send,
{
    /// Creates a new function-based transform.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Transform for FnTransform<F, Fut>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, PipelineError>> + Send,
{
    async fn run(&self, input: Value, ctx: StepContext) -> Result<Value, PipelineError> {
        (self.func)(input, ctx).await
    }
}

/// How a step's result folds into the value flowing to the next step.
#[derive(Clone, Default)]
pub enum CombineStrategy {
    /// Shallow merge of two objects; later keys win. Non-object results
    /// replace the running value.
    #[default]
    ShallowMerge,
    /// The result replaces the running value entirely.
    Replace,
    /// A caller-supplied reducer over `(prior, result)`.
    Custom(Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>),
}

impl CombineStrategy {
    /// Creates a custom strategy from a reducer.
    pub fn custom<F>(reducer: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(reducer))
    }

    /// Folds a result into the running value.
    #[must_use]
    pub fn apply(&self, prior: &Value, result: &Value) -> Value {
        match self {
            Self::ShallowMerge => shallow_merge(prior, result),
            Self::Replace => result.clone(),
            Self::Custom(reducer) => reducer(prior, result),
        }
    }
}

impl Debug for CombineStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShallowMerge => f.write_str("ShallowMerge"),
            Self::Replace => f.write_str("Replace"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Shallow merge of two values; object keys of `result` win.
#[must_use]
pub fn shallow_merge(prior: &Value, result: &Value) -> Value {
    match (prior, result) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, val) in b {
                merged.insert(key.clone(), val.clone());
            }
            Value::Object(merged)
        }
        _ => result.clone(),
    }
}

/// Determinism classification of a step.
///
/// Deterministic steps are cached by input hash alone. Non-deterministic
/// steps get a fresh id on every call within a run, so repeated calls
/// re-execute instead of reusing each other's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Determinism {
    /// Same input always produces the same result.
    #[default]
    Deterministic,
    /// Results vary per call (model sampling, wall-clock, randomness).
    NonDeterministic,
}

/// One named, shape-typed unit of work.
#[derive(Clone)]
pub struct StepElement {
    name: String,
    input_shape: Shape,
    result_shape: Shape,
    transform: Arc<dyn Transform>,
    combine: Option<CombineStrategy>,
    determinism: Determinism,
}

impl StepElement {
    /// Creates an element from an async function.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        input_shape: Shape,
        result_shape: Shape,
        transform: F,
    ) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, PipelineError>> + Send + 'static,
    {
        Self::from_transform(name, input_shape, result_shape, Arc::new(FnTransform::new(transform)))
    }

    /// Creates an element from a boxed transform.
    pub fn from_transform(
        name: impl Into<String>,
        input_shape: Shape,
        result_shape: Shape,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            name: name.into(),
            input_shape,
            result_shape,
            transform,
            combine: None,
            determinism: Determinism::Deterministic,
        }
    }

    /// Overrides how this element's result folds into the running value.
    #[must_use]
    pub fn with_combine(mut self, strategy: CombineStrategy) -> Self {
        self.combine = Some(strategy);
        self
    }

    /// Marks the element non-deterministic.
    #[must_use]
    pub fn non_deterministic(mut self) -> Self {
        self.determinism = Determinism::NonDeterministic;
        self
    }

    /// Returns the element name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared input shape.
    #[must_use]
    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }

    /// Returns the declared result shape.
    #[must_use]
    pub fn result_shape(&self) -> &Shape {
        &self.result_shape
    }

    /// Returns this element's combine strategy, if it declares one.
    #[must_use]
    pub fn combine(&self) -> Option<&CombineStrategy> {
        self.combine.as_ref()
    }

    /// Returns the determinism classification.
    #[must_use]
    pub fn determinism(&self) -> Determinism {
        self.determinism
    }

    /// Computes the unsalted element id for a validated input.
    #[must_use]
    pub fn base_id(&self, validated_input: &Value) -> String {
        format!("{}-{}", self.name, short_hash(validated_input))
    }

    /// Checks that the element name is usable as a file stem.
    ///
    /// # Errors
    ///
    /// Returns an [`ElementDefinitionError`] for empty or
    /// filesystem-unsafe names.
    pub fn validate(&self) -> Result<(), ElementDefinitionError> {
        if self.name.trim().is_empty() {
            return Err(ElementDefinitionError::new(
                self.name.clone(),
                "name cannot be empty or whitespace-only",
            ));
        }
        let safe = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe || self.name.starts_with('.') {
            return Err(ElementDefinitionError::new(
                self.name.clone(),
                "name must contain only alphanumerics, '-', '_' or '.' and not start with '.'",
            ));
        }
        Ok(())
    }

    /// Invokes the transform.
    pub(crate) async fn invoke(
        &self,
        input: Value,
        ctx: StepContext,
    ) -> Result<Value, PipelineError> {
        self.transform.run(input, ctx).await
    }

    /// Returns a copy with a widened input shape. Used by the retry layer
    /// to fold the attempt counter into every element's hashed input.
    #[must_use]
    pub(crate) fn with_input_shape(mut self, shape: Shape) -> Self {
        self.input_shape = shape;
        self
    }
}

impl Debug for StepElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepElement")
            .field("name", &self.name)
            .field("determinism", &self.determinism)
            .field("combine", &self.combine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunSession;
    use serde_json::json;

    fn value_shape() -> Shape {
        Shape::object().field("value", Shape::Integer).build()
    }

    fn add_one() -> StepElement {
        StepElement::new("add", value_shape(), value_shape(), |input, _ctx| async move {
            let value = input["value"].as_i64().unwrap_or(0);
            Ok(json!({ "value": value + 1 }))
        })
    }

    #[tokio::test]
    async fn test_element_invokes_transform() {
        let element = add_one();
        let ctx = RunSession::ephemeral().context();
        let result = element.invoke(json!({ "value": 1 }), ctx).await.unwrap();
        assert_eq!(result, json!({ "value": 2 }));
    }

    #[test]
    fn test_base_id_tracks_input() {
        let element = add_one();
        let a = element.base_id(&json!({ "value": 1 }));
        let b = element.base_id(&json!({ "value": 2 }));
        assert!(a.starts_with("add-"));
        assert_ne!(a, b);
        assert_eq!(a, element.base_id(&json!({ "value": 1 })));
    }

    #[test]
    fn test_name_validation() {
        assert!(add_one().validate().is_ok());

        let bad = StepElement::new("has space", Shape::Any, Shape::Any, |input, _ctx| async move {
            Ok(input)
        });
        assert!(bad.validate().is_err());

        let slash = StepElement::new("a/b", Shape::Any, Shape::Any, |input, _ctx| async move {
            Ok(input)
        });
        assert!(slash.validate().is_err());

        let empty = StepElement::new("  ", Shape::Any, Shape::Any, |input, _ctx| async move {
            Ok(input)
        });
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_shallow_merge_later_keys_win() {
        let merged = shallow_merge(&json!({ "a": 1, "b": 1 }), &json!({ "b": 2, "c": 3 }));
        assert_eq!(merged, json!({ "a": 1, "b": 2, "c": 3 }));
    }

    #[test]
    fn test_shallow_merge_non_object_replaces() {
        let merged = shallow_merge(&json!({ "a": 1 }), &json!(7));
        assert_eq!(merged, json!(7));
    }

    #[test]
    fn test_combine_strategies() {
        let prior = json!({ "a": 1 });
        let result = json!({ "b": 2 });

        assert_eq!(
            CombineStrategy::ShallowMerge.apply(&prior, &result),
            json!({ "a": 1, "b": 2 })
        );
        assert_eq!(CombineStrategy::Replace.apply(&prior, &result), result);

        let custom = CombineStrategy::custom(|prior, result| {
            json!({ "sum": prior["a"].as_i64().unwrap_or(0) + result["b"].as_i64().unwrap_or(0) })
        });
        assert_eq!(custom.apply(&prior, &result), json!({ "sum": 3 }));
    }

    #[test]
    fn test_determinism_default_and_override() {
        assert_eq!(add_one().determinism(), Determinism::Deterministic);
        assert_eq!(
            add_one().non_deterministic().determinism(),
            Determinism::NonDeterministic
        );
    }
}
