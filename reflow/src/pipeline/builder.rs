//! The immutable, fluent pipeline builder.
//!
//! `append`, `combine_last`, `combine_all` and `with_retry` each return a
//! new pipeline value referencing copied element arrays; a previously
//! returned pipeline is never mutated, so intermediate pipelines can be
//! kept and extended in several directions safely.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::retry::{RetryOptions, ATTEMPT_FIELD};
use crate::cleanup::{self, CleanupReport};
use crate::element::{CombineStrategy, StepElement, Transform};
use crate::engine;
use crate::errors::{ElementDefinitionError, PipelineError};
use crate::schema::Shape;
use crate::state::{RunSession, StepContext};

/// An ordered, schema-checked chain of step elements.
#[derive(Debug, Clone)]
pub struct Pipeline {
    input_shape: Shape,
    result_shape: Shape,
    elements: Arc<Vec<StepElement>>,
    combine_all: CombineStrategy,
    retry: Option<RetryOptions>,
}

impl Pipeline {
    /// Creates an empty pipeline over the given input shape.
    #[must_use]
    pub fn new(input_shape: Shape) -> Self {
        Self {
            result_shape: input_shape.clone(),
            input_shape,
            elements: Arc::new(Vec::new()),
            combine_all: CombineStrategy::default(),
            retry: None,
        }
    }

    /// Appends an element, returning a new pipeline.
    ///
    /// The pipeline's result shape widens to the merge of the current
    /// result shape and the element's result shape (or the element's own
    /// shape when it replaces the running value).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid or duplicate element name.
    pub fn append(&self, element: StepElement) -> Result<Self, ElementDefinitionError> {
        element.validate()?;
        if self.elements.iter().any(|existing| existing.name() == element.name()) {
            return Err(ElementDefinitionError::new(
                element.name(),
                "an element with this name already exists in the pipeline",
            ));
        }

        let result_shape = match element.combine() {
            Some(CombineStrategy::Replace) => element.result_shape().clone(),
            _ => self.result_shape.merge(element.result_shape()),
        };

        let mut elements = (*self.elements).clone();
        elements.push(element);

        Ok(Self {
            input_shape: self.input_shape.clone(),
            result_shape,
            elements: Arc::new(elements),
            combine_all: self.combine_all.clone(),
            retry: self.retry.clone(),
        })
    }

    /// Replaces how the most recently appended element's result folds
    /// into the running value, and declares the externally visible result
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns an error when the pipeline has no elements yet.
    pub fn combine_last(
        &self,
        strategy: CombineStrategy,
        result_shape: Shape,
    ) -> Result<Self, ElementDefinitionError> {
        let mut elements = (*self.elements).clone();
        let last = elements.pop().ok_or_else(|| {
            ElementDefinitionError::new(
                "(empty pipeline)",
                "combine_last requires at least one appended element",
            )
        })?;
        elements.push(last.with_combine(strategy));

        Ok(Self {
            input_shape: self.input_shape.clone(),
            result_shape,
            elements: Arc::new(elements),
            combine_all: self.combine_all.clone(),
            retry: self.retry.clone(),
        })
    }

    /// Replaces the default fold used by every element that does not
    /// declare its own combine strategy.
    #[must_use]
    pub fn combine_all(&self, strategy: CombineStrategy) -> Self {
        Self {
            input_shape: self.input_shape.clone(),
            result_shape: self.result_shape.clone(),
            elements: Arc::clone(&self.elements),
            combine_all: strategy,
            retry: self.retry.clone(),
        }
    }

    /// Wraps the pipeline with bounded retry.
    ///
    /// Widens the input shape of the pipeline and of every element with
    /// an optional `attempt` field. The attempt number is injected from
    /// the second attempt onward, so it reaches every element's validated
    /// (and therefore hashed) input: each attempt addresses a fresh cache
    /// id chain and can never replay a stale failing entry.
    #[must_use]
    pub fn with_retry(&self, options: RetryOptions) -> Self {
        let elements: Vec<StepElement> = self
            .elements
            .iter()
            .map(|element| {
                let widened = element
                    .input_shape()
                    .clone()
                    .with_optional_field(ATTEMPT_FIELD, Shape::Integer);
                element.clone().with_input_shape(widened)
            })
            .collect();

        Self {
            input_shape: self
                .input_shape
                .clone()
                .with_optional_field(ATTEMPT_FIELD, Shape::Integer),
            result_shape: self.result_shape.clone(),
            elements: Arc::new(elements),
            combine_all: self.combine_all.clone(),
            retry: Some(options),
        }
    }

    /// Returns the pipeline's input shape.
    #[must_use]
    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }

    /// Returns the pipeline's result shape.
    #[must_use]
    pub fn result_shape(&self) -> &Shape {
        &self.result_shape
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if no elements have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns the element names in order.
    #[must_use]
    pub fn element_names(&self) -> Vec<String> {
        self.elements
            .iter()
            .map(|element| element.name().to_string())
            .collect()
    }

    /// Runs the pipeline in-memory, without persistence.
    ///
    /// # Errors
    ///
    /// Propagates validation, abort, store and step failures.
    pub async fn transform(&self, input: Value) -> Result<Value, PipelineError> {
        self.transform_with(input, &RunSession::ephemeral().context()).await
    }

    /// Runs the pipeline inside an existing run context.
    ///
    /// Nested sub-pipeline calls receive the parent's context so the
    /// whole call tree shares one session and one run log.
    ///
    /// # Errors
    ///
    /// Propagates validation, abort, store and step failures.
    pub async fn transform_with(
        &self,
        input: Value,
        ctx: &StepContext,
    ) -> Result<Value, PipelineError> {
        match &self.retry {
            None => self.execute_once(input, ctx).await,
            Some(options) => self.execute_with_retry(input, ctx, options).await,
        }
    }

    /// Wraps the whole pipeline as a single step element, nesting its
    /// artifacts under the parent step's element id.
    #[must_use]
    pub fn as_element(&self, name: impl Into<String>) -> StepElement {
        StepElement::from_transform(
            name,
            self.input_shape.clone(),
            self.result_shape.clone(),
            Arc::new(self.clone()),
        )
    }

    /// Deletes stale artifacts at this context's level: entries matching
    /// this pipeline's `<name>-*` patterns that were not referenced in
    /// the run log.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clean(&self, ctx: &StepContext) -> Result<CleanupReport, PipelineError> {
        cleanup::clean(&self.element_names(), ctx).await
    }

    async fn execute_once(&self, input: Value, ctx: &StepContext) -> Result<Value, PipelineError> {
        engine::execute(
            &self.elements,
            &self.result_shape,
            &self.combine_all,
            input,
            ctx,
        )
        .await
    }

    async fn execute_with_retry(
        &self,
        input: Value,
        ctx: &StepContext,
        options: &RetryOptions,
    ) -> Result<Value, PipelineError> {
        let max_attempts = options.max_attempts.max(1);
        let mut attempt: usize = 1;

        loop {
            ctx.session().ensure_active().map_err(PipelineError::from)?;

            let current = if attempt > 1 {
                inject_attempt(&input, attempt)
            } else {
                input.clone()
            };

            match self.execute_once(current, ctx).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "pipeline attempt failed"
                    );
                    if attempt >= max_attempts || !options.should_retry(&err, attempt) {
                        return Err(err);
                    }
                    let delay = options.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Transform for Pipeline {
    async fn run(&self, input: Value, ctx: StepContext) -> Result<Value, PipelineError> {
        self.transform_with(input, &ctx).await
    }
}

/// Adds the attempt counter to an object input; non-object inputs pass
/// through unchanged.
fn inject_attempt(input: &Value, attempt: usize) -> Value {
    match input {
        Value::Object(map) => {
            let mut widened = map.clone();
            widened.insert(ATTEMPT_FIELD.to_string(), Value::from(attempt as u64));
            Value::Object(widened)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_element, multiply_element, value_shape, InvocationCounter};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_builder_is_immutable() {
        let counter = InvocationCounter::new();
        let base = Pipeline::new(value_shape());
        let extended = base.append(add_element(&counter)).unwrap();

        assert!(base.is_empty());
        assert_eq!(extended.len(), 1);

        // Extending the same base twice yields independent pipelines.
        let other = base.append(multiply_element(&counter, 2)).unwrap();
        assert_eq!(extended.element_names(), vec!["add"]);
        assert_eq!(other.element_names(), vec!["multiply"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let counter = InvocationCounter::new();
        let pipeline = Pipeline::new(value_shape())
            .append(add_element(&counter))
            .unwrap();
        let err = pipeline.append(add_element(&counter)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_combine_last_requires_elements() {
        let pipeline = Pipeline::new(value_shape());
        assert!(pipeline
            .combine_last(CombineStrategy::Replace, Shape::Any)
            .is_err());
    }

    #[tokio::test]
    async fn test_transform_runs_chain() {
        let counter = InvocationCounter::new();
        let pipeline = Pipeline::new(value_shape())
            .append(add_element(&counter))
            .unwrap()
            .append(multiply_element(&counter, 2))
            .unwrap();

        let result = pipeline.transform(json!({ "value": 0 })).await.unwrap();
        assert_eq!(result, json!({ "value": 2 }));
    }

    #[tokio::test]
    async fn test_empty_pipeline_validates_and_returns_input() {
        let pipeline = Pipeline::new(value_shape());
        let result = pipeline
            .transform(json!({ "value": 5, "stray": true }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "value": 5 }));
    }

    #[tokio::test]
    async fn test_combine_last_replaces_fold_and_shape() {
        let counter = InvocationCounter::new();
        let pipeline = Pipeline::new(value_shape())
            .append(add_element(&counter))
            .unwrap()
            .combine_last(
                CombineStrategy::custom(|prior, result| {
                    json!({
                        "before": prior["value"],
                        "after": result["value"],
                    })
                }),
                Shape::object()
                    .field("before", Shape::Integer)
                    .field("after", Shape::Integer)
                    .build(),
            )
            .unwrap();

        let result = pipeline.transform(json!({ "value": 1 })).await.unwrap();
        assert_eq!(result, json!({ "before": 1, "after": 2 }));
    }

    #[tokio::test]
    async fn test_combine_all_changes_default_fold() {
        let counter = InvocationCounter::new();
        let pipeline = Pipeline::new(value_shape())
            .append(add_element(&counter))
            .unwrap()
            .combine_all(CombineStrategy::Replace);

        // Replace drops the original input keys instead of merging.
        let result = pipeline.transform(json!({ "value": 4 })).await.unwrap();
        assert_eq!(result, json!({ "value": 5 }));
    }

    #[tokio::test]
    async fn test_sub_pipeline_as_element() {
        let counter = InvocationCounter::new();
        let inner = Pipeline::new(value_shape())
            .append(add_element(&counter))
            .unwrap();
        let outer = Pipeline::new(value_shape())
            .append(inner.as_element("inner"))
            .unwrap()
            .append(multiply_element(&counter, 3))
            .unwrap();

        let result = outer.transform(json!({ "value": 1 })).await.unwrap();
        assert_eq!(result, json!({ "value": 6 }));
        assert_eq!(counter.count("add"), 1);
    }

    #[tokio::test]
    async fn test_composition_matches_manual_fold() {
        let counter = InvocationCounter::new();
        let a = add_element(&counter);
        let b = multiply_element(&counter, 2);

        let pipeline = Pipeline::new(value_shape())
            .append(a)
            .unwrap()
            .append(b)
            .unwrap();
        let composed = pipeline.transform(json!({ "value": 3 })).await.unwrap();

        // B.transform(combine(x, A.transform(x))) under the shallow-merge
        // rule, computed by hand.
        let manual_counter = InvocationCounter::new();
        let a_alone = Pipeline::new(value_shape())
            .append(add_element(&manual_counter))
            .unwrap();
        let a_result = a_alone.transform(json!({ "value": 3 })).await.unwrap();
        let folded = crate::element::shallow_merge(&json!({ "value": 3 }), &a_result);
        let b_alone = Pipeline::new(value_shape())
            .append(multiply_element(&manual_counter, 2))
            .unwrap();
        let manual = b_alone.transform(folded).await.unwrap();

        assert_eq!(composed, manual);
    }

    #[tokio::test]
    async fn test_retry_reruns_recoverable_failures() {
        let counter = InvocationCounter::new();
        let flaky = crate::testing::failing_until_attempt("flaky", &counter, 2);
        let pipeline = Pipeline::new(value_shape())
            .append(flaky)
            .unwrap()
            .with_retry(RetryOptions::new(3));

        let result = pipeline.transform(json!({ "value": 1 })).await.unwrap();
        assert_eq!(result["value"], json!(1));
        assert_eq!(counter.count("flaky"), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let counter = InvocationCounter::new();
        let failing = crate::testing::failing_until_attempt("doomed", &counter, 99);
        let pipeline = Pipeline::new(value_shape())
            .append(failing)
            .unwrap()
            .with_retry(RetryOptions::new(2));

        let err = pipeline.transform(json!({ "value": 1 })).await.unwrap_err();
        assert!(matches!(err, PipelineError::Step { .. }));
        assert_eq!(counter.count("doomed"), 2);
    }

    #[tokio::test]
    async fn test_abort_is_never_retried() {
        let counter = InvocationCounter::new();
        let aborting = crate::testing::aborting_element("fatal", &counter);
        let pipeline = Pipeline::new(value_shape())
            .append(aborting)
            .unwrap()
            .with_retry(RetryOptions::new(5));

        let err = pipeline.transform(json!({ "value": 1 })).await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(counter.count("fatal"), 1);
    }

    #[tokio::test]
    async fn test_should_retry_predicate_stops_early() {
        let counter = InvocationCounter::new();
        let failing = crate::testing::failing_until_attempt("doomed", &counter, 99);
        let pipeline = Pipeline::new(value_shape())
            .append(failing)
            .unwrap()
            .with_retry(RetryOptions::new(5).with_should_retry(|_error, attempt| attempt < 2));

        let err = pipeline.transform(json!({ "value": 1 })).await.unwrap_err();
        assert!(matches!(err, PipelineError::Step { .. }));
        assert_eq!(counter.count("doomed"), 2);
    }

    #[tokio::test]
    async fn test_attempt_visible_only_past_first_attempt() {
        let counter = InvocationCounter::new();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = std::sync::Arc::clone(&seen);
        let witness = StepElement::new(
            "witness",
            value_shape(),
            value_shape(),
            move |input, _ctx| {
                let seen = std::sync::Arc::clone(&seen_clone);
                async move {
                    seen.lock().push(input.get(ATTEMPT_FIELD).cloned());
                    Ok(input)
                }
            },
        );
        let pipeline = Pipeline::new(value_shape())
            .append(witness)
            .unwrap()
            .append(crate::testing::failing_until_attempt("flaky", &counter, 2))
            .unwrap()
            .with_retry(RetryOptions::new(3));

        pipeline.transform(json!({ "value": 1 })).await.unwrap();

        let observed = seen.lock().clone();
        assert_eq!(observed, vec![None, Some(json!(2))]);
    }
}
