//! The execution engine: an ordered walk over step elements with
//! content-addressed caching.
//!
//! For each element the engine validates the running value, derives the
//! element id from the name and the hash of the validated input, tries the
//! in-memory memo and then the artifact store, speculatively checks any
//! candidate against the next step before accepting it, and otherwise
//! invokes the transform, persists the result and folds it into the
//! running value.

use serde_json::Value;
use std::path::PathBuf;

use crate::element::{CombineStrategy, Determinism, StepElement};
use crate::errors::{PipelineError, StepValidationError, StoreError, ValidationOrigin};
use crate::schema::Shape;
use crate::state::StepContext;
use crate::store;

/// Executes elements in order, returning the final merged value validated
/// against `result_shape`.
pub(crate) async fn execute(
    elements: &[StepElement],
    result_shape: &Shape,
    combine_all: &CombineStrategy,
    initial_input: Value,
    ctx: &StepContext,
) -> Result<Value, PipelineError> {
    let mut running = initial_input;

    for (index, element) in elements.iter().enumerate() {
        ctx.session().ensure_active()?;

        let validated = element.input_shape().parse(&running).map_err(|source| {
            let origin = if index == 0 {
                ValidationOrigin::InitialInput
            } else {
                ValidationOrigin::PriorOutput {
                    prior: elements[index - 1].name().to_string(),
                }
            };
            StepValidationError::new(element.name(), origin, source)
        })?;

        let element_id = derive_element_id(element, &validated, ctx);
        let full_id = ctx.qualified_id(&element_id);
        let combine = element.combine().unwrap_or(combine_all);

        let candidate = lookup_candidate(element, &element_id, &full_id, ctx).await?;

        if let Some((value, path)) = candidate {
            let merged = combine.apply(&running, &value);
            let compatibility = if index + 1 < elements.len() {
                elements[index + 1].input_shape().check(&merged)
            } else {
                result_shape.check(&merged)
            };
            match compatibility {
                Ok(()) => {
                    tracing::debug!(step = element.name(), id = %element_id, "cache hit");
                    if let Some(path) = path {
                        ctx.session().record_reference(path);
                    }
                    ctx.session().record_result(full_id, value);
                    running = merged;
                    continue;
                }
                Err(reason) => {
                    tracing::debug!(
                        step = element.name(),
                        id = %element_id,
                        %reason,
                        "cached result incompatible with the next step, recomputing"
                    );
                }
            }
        } else {
            tracing::debug!(step = element.name(), id = %element_id, "cache miss");
        }

        let child = ctx.child(&element_id);
        let result = element.invoke(validated.clone(), child).await?;
        let result = element.result_shape().parse(&result).map_err(|source| {
            StepValidationError::new(element.name(), ValidationOrigin::StepResult, source)
        })?;

        if let Some(location) = ctx.location() {
            if ctx.session().options().save_result {
                let path = store::artifact_path(location, &element_id);
                let saved_input = if ctx.session().options().save_input {
                    Some(&validated)
                } else {
                    None
                };
                store::save_artifact(
                    &path,
                    saved_input,
                    element.input_shape(),
                    &result,
                    element.result_shape(),
                )
                .await?;
                ctx.session().record_reference(path);
            }
        }

        ctx.session().record_result(full_id, result.clone());
        running = combine.apply(&running, &result);
    }

    result_shape.parse(&running).map_err(|source| {
        let step = elements
            .last()
            .map_or_else(String::new, |element| element.name().to_string());
        StepValidationError::new(step, ValidationOrigin::FinalResult, source).into()
    })
}

/// Derives the element id; non-deterministic elements fold a per-run
/// invocation counter into the id so every call gets a fresh one.
fn derive_element_id(element: &StepElement, validated: &Value, ctx: &StepContext) -> String {
    let base_id = element.base_id(validated);
    match element.determinism() {
        Determinism::Deterministic => base_id,
        Determinism::NonDeterministic => {
            let nonce = ctx.session().next_invocation(&ctx.qualified_id(&base_id));
            format!("{base_id}-{nonce}")
        }
    }
}

/// Looks for a reusable result: the in-memory memo first, then the
/// artifact store. Unusable persisted documents are treated as misses.
async fn lookup_candidate(
    element: &StepElement,
    element_id: &str,
    full_id: &str,
    ctx: &StepContext,
) -> Result<Option<(Value, Option<PathBuf>)>, PipelineError> {
    if let Some(value) = ctx.session().cached_result(full_id) {
        return Ok(Some((value, None)));
    }

    let Some(location) = ctx.location() else {
        return Ok(None);
    };
    if !ctx.session().cache_enabled_for(element.name()) {
        return Ok(None);
    }

    let Some(path) = store::find_artifact(location, element_id).await? else {
        return Ok(None);
    };
    match store::load_artifact(&path, element.result_shape()).await {
        Ok(value) => Ok(Some((value, Some(path)))),
        Err(err @ (StoreError::InvalidDocument { .. } | StoreError::NotFound { .. })) => {
            tracing::debug!(
                step = element.name(),
                id = %element_id,
                error = %err,
                "persisted result unusable, recomputing"
            );
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}
