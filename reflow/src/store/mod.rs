//! On-disk artifact store.
//!
//! Each step result is persisted as a YAML document at
//! `<location>/<element id>.yaml`, either as a `{ input, result }` envelope
//! or (in the older format still accepted on load) as a bare result
//! document. Artifacts are written once per distinct id and never mutated
//! in place; a changed input produces a new id, not an overwrite.
//!
//! Writes are atomic (temp file then rename) and create parent directories
//! as needed. A missing file surfaces as [`StoreError::NotFound`] so the
//! engine can treat it as a cache miss rather than a fatal failure.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::errors::StoreError;
use crate::schema::Shape;

/// File extension of persisted artifacts.
pub const ARTIFACT_EXT: &str = "yaml";

/// The persisted document: a result, optionally alongside the input that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    result: Value,
}

/// Returns the artifact path for an element id under a location.
#[must_use]
pub fn artifact_path(location: &Path, element_id: &str) -> PathBuf {
    location.join(format!("{element_id}.{ARTIFACT_EXT}"))
}

/// Persists a result (and optionally its input) to `path`.
///
/// Both documents are validated against their shapes before anything is
/// serialized; invalid state is never persisted.
///
/// # Errors
///
/// Returns [`StoreError::InvalidDocument`] if a document fails its shape,
/// or an I/O / encoding error from the write itself.
pub async fn save_artifact(
    path: &Path,
    input: Option<&Value>,
    input_shape: &Shape,
    result: &Value,
    result_shape: &Shape,
) -> Result<(), StoreError> {
    let input = input
        .map(|value| {
            input_shape
                .parse(value)
                .map_err(|source| StoreError::InvalidDocument {
                    side: "input",
                    source,
                })
        })
        .transpose()?;
    let result = result_shape
        .parse(result)
        .map_err(|source| StoreError::InvalidDocument {
            side: "result",
            source,
        })?;

    let document = Envelope { input, result };
    let text = serde_yaml::to_string(&document).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::from_io(parent.to_path_buf(), source))?;
    }

    // Write to a sibling temp file first so a crash never leaves a
    // half-written artifact at the final path.
    let tmp = path.with_extension(format!("{ARTIFACT_EXT}.tmp"));
    fs::write(&tmp, text.as_bytes())
        .await
        .map_err(|source| StoreError::from_io(tmp.clone(), source))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::from_io(path.to_path_buf(), source))?;

    tracing::debug!(path = %path.display(), "persisted artifact");
    Ok(())
}

/// Loads a persisted result from `path` and validates it against `shape`.
///
/// Accepts either the `{ input, result }` envelope or the older bare
/// result document.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when no artifact exists, a decode
/// error for unreadable documents, or [`StoreError::InvalidDocument`]
/// when the stored result no longer fits the shape.
pub async fn load_artifact(path: &Path, shape: &Shape) -> Result<Value, StoreError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| StoreError::from_io(path.to_path_buf(), source))?;

    let document: Value = serde_yaml::from_str(&text).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    let result = extract_result(document);
    shape
        .check(&result)
        .map_err(|source| StoreError::InvalidDocument {
            side: "result",
            source,
        })?;
    Ok(result)
}

/// Unwraps the `{ input, result }` envelope; any other document is the
/// older bare result format.
fn extract_result(document: Value) -> Value {
    match document {
        Value::Object(map)
            if map.contains_key("result")
                && map.keys().all(|key| key == "result" || key == "input") =>
        {
            map.into_iter()
                .find(|(key, _)| key == "result")
                .map(|(_, value)| value)
                .unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Finds the artifact for an element id under a directory.
///
/// Matches the exact `<element id>.yaml` first, then any file whose stem
/// carries a disambiguating suffix (`<element id>-*.yaml`), as produced by
/// non-deterministic steps. Candidates are tried in sorted order.
///
/// # Errors
///
/// Returns an I/O error for anything other than a missing directory.
pub async fn find_artifact(dir: &Path, element_id: &str) -> Result<Option<PathBuf>, StoreError> {
    let exact = artifact_path(dir, element_id);
    match fs::metadata(&exact).await {
        Ok(meta) if meta.is_file() => return Ok(Some(exact)),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(StoreError::from_io(exact, err)),
    }

    let prefix = format!("{element_id}-");
    let suffix = format!(".{ARTIFACT_EXT}");
    let mut candidates = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::from_io(dir.to_path_buf(), err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| StoreError::from_io(dir.to_path_buf(), source))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            candidates.push(entry.path());
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Lists direct children of `dir` whose file names match any of the
/// patterns, excluding paths on the ignore list.
///
/// # Errors
///
/// Returns an I/O error for anything other than a missing directory
/// (which yields an empty listing).
pub async fn list_matching(
    dir: &Path,
    patterns: &[Pattern],
    ignore: &[PathBuf],
) -> Result<Vec<PathBuf>, StoreError> {
    let mut matched = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(matched),
        Err(err) => return Err(StoreError::from_io(dir.to_path_buf(), err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| StoreError::from_io(dir.to_path_buf(), source))?
    {
        let path = entry.path();
        if ignore.contains(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if patterns.iter().any(|pattern| pattern.matches(&name)) {
            matched.push(path);
        }
    }

    matched.sort();
    Ok(matched)
}

/// Removes a file or an entire directory tree.
///
/// # Errors
///
/// Returns an I/O error; a concurrently vanished entry is not an error.
pub async fn remove_entry(path: &Path) -> Result<(), StoreError> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StoreError::from_io(path.to_path_buf(), err)),
    };
    let outcome = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::from_io(path.to_path_buf(), err)),
    }
}
