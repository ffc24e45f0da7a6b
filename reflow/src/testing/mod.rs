//! Test fixtures for pipeline testing.
//!
//! Small arithmetic elements with invocation counting, used by the
//! crate's own tests to assert how often transforms actually run.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::element::StepElement;
use crate::errors::{AbortError, PipelineError};
use crate::schema::Shape;

/// Counts transform invocations per element name.
#[derive(Debug, Clone, Default)]
pub struct InvocationCounter {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl InvocationCounter {
    /// Creates a new counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an invocation and returns the new count for that name.
    pub fn record(&self, name: &str) -> usize {
        let mut counts = self.counts.lock();
        let entry = counts.entry(name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Returns how often the named element ran.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    /// Returns the total number of invocations across all names.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

/// The `{ value: integer }` shape most fixtures work over.
#[must_use]
pub fn value_shape() -> Shape {
    Shape::object().field("value", Shape::Integer).build()
}

/// An element named `add` computing `{ value: value + 1 }`.
#[must_use]
pub fn add_element(counter: &InvocationCounter) -> StepElement {
    let counter = counter.clone();
    StepElement::new("add", value_shape(), value_shape(), move |input, _ctx| {
        let counter = counter.clone();
        async move {
            counter.record("add");
            let value = input["value"].as_i64().unwrap_or(0);
            Ok(json!({ "value": value + 1 }))
        }
    })
}

/// An element named `multiply` computing `{ value: value * factor }`.
#[must_use]
pub fn multiply_element(counter: &InvocationCounter, factor: i64) -> StepElement {
    let counter = counter.clone();
    StepElement::new("multiply", value_shape(), value_shape(), move |input, _ctx| {
        let counter = counter.clone();
        async move {
            counter.record("multiply");
            let value = input["value"].as_i64().unwrap_or(0);
            Ok(json!({ "value": value * factor }))
        }
    })
}

/// An element that fails with a recoverable error until its nth
/// invocation, then passes its input through.
#[must_use]
pub fn failing_until_attempt(
    name: &str,
    counter: &InvocationCounter,
    succeeds_on_call: usize,
) -> StepElement {
    let counter = counter.clone();
    let owned = name.to_string();
    StepElement::new(name, value_shape(), value_shape(), move |input, _ctx| {
        let counter = counter.clone();
        let name = owned.clone();
        async move {
            let call = counter.record(&name);
            if call < succeeds_on_call {
                Err(PipelineError::step_failure(
                    &name,
                    anyhow::anyhow!("transient failure on call {call}"),
                ))
            } else {
                Ok(input)
            }
        }
    })
}

/// An element that raises an abort on every invocation.
#[must_use]
pub fn aborting_element(name: &str, counter: &InvocationCounter) -> StepElement {
    let counter = counter.clone();
    let owned = name.to_string();
    StepElement::new(name, value_shape(), value_shape(), move |_input, _ctx| {
        let counter = counter.clone();
        let name = owned.clone();
        async move {
            counter.record(&name);
            Err(AbortError::new(format!("aborted inside step '{name}'")).into())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_tracks_per_name() {
        let counter = InvocationCounter::new();
        assert_eq!(counter.record("a"), 1);
        assert_eq!(counter.record("a"), 2);
        assert_eq!(counter.record("b"), 1);
        assert_eq!(counter.count("a"), 2);
        assert_eq!(counter.total(), 3);
        assert_eq!(counter.count("missing"), 0);
    }

    #[tokio::test]
    async fn test_arithmetic_fixtures() {
        let counter = InvocationCounter::new();
        let ctx = crate::state::RunSession::ephemeral().context();

        let add = add_element(&counter);
        let result = add.invoke(json!({ "value": 2 }), ctx.clone()).await.unwrap();
        assert_eq!(result, json!({ "value": 3 }));

        let multiply = multiply_element(&counter, 4);
        let result = multiply.invoke(json!({ "value": 2 }), ctx).await.unwrap();
        assert_eq!(result, json!({ "value": 8 }));
        assert_eq!(counter.total(), 2);
    }
}
