//! Garbage collection of stale cached artifacts.
//!
//! After a run completes, artifacts under the persistence location that
//! match the pipeline's `<name>-*` patterns but were not referenced in the
//! run log are abandoned branches (earlier inputs, failed attempts) and
//! can be deleted. Cleanup is scoped per nesting level: a parent's pass
//! touches only its own direct children, and sub-directories referenced by
//! the run log are left for their own level's pass. Skipping a level
//! leaves that level's artifacts in place.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use glob::Pattern;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::fs;

use crate::errors::PipelineError;
use crate::state::StepContext;
use crate::store;

/// What a cleanup pass kept and removed.
#[derive(Debug, Clone)]
pub struct CleanupReport {
    /// The level that was cleaned, if the context had one.
    pub location: Option<PathBuf>,
    /// Entries deleted as stale.
    pub removed: Vec<PathBuf>,
    /// Matching entries kept because the run log references them.
    pub kept: Vec<PathBuf>,
    /// When the pass finished.
    pub finished_at: DateTime<Utc>,
}

/// Deletes stale artifacts at the context's level.
///
/// # Errors
///
/// Propagates store failures from listing or deletion.
pub async fn clean(
    element_names: &[String],
    ctx: &StepContext,
) -> Result<CleanupReport, PipelineError> {
    let Some(location) = ctx.location() else {
        return Ok(CleanupReport {
            location: None,
            removed: Vec::new(),
            kept: Vec::new(),
            finished_at: Utc::now(),
        });
    };

    let patterns: Vec<Pattern> = element_names
        .iter()
        .filter_map(|name| match Pattern::new(&format!("{name}-*")) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!(step = name, error = %err, "skipping unpatternable step name");
                None
            }
        })
        .collect();

    let log = ctx.session().log();
    let referenced: HashSet<&PathBuf> = log.iter().collect();

    let matched = store::list_matching(location, &patterns, &[]).await?;
    let mut kept = Vec::new();
    let mut stale = Vec::new();

    for path in matched {
        if referenced.contains(&path) {
            kept.push(path);
            continue;
        }
        let is_dir = fs::metadata(&path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if is_dir && log.iter().any(|entry| entry.starts_with(&path)) {
            // A live sub-pipeline level; its own clean pass owns it.
            kept.push(path);
            continue;
        }
        stale.push(path);
    }

    try_join_all(stale.iter().map(|path| store::remove_entry(path))).await?;

    tracing::info!(
        location = %location.display(),
        removed = stale.len(),
        kept = kept.len(),
        "cleaned stale artifacts"
    );

    Ok(CleanupReport {
        location: Some(location.to_path_buf()),
        removed: stale,
        kept,
        finished_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunSession;
    use tempfile::tempdir;

    async fn touch(path: &PathBuf) {
        tokio::fs::write(path, "result: 1\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_removes_unreferenced_matching_artifacts() {
        let dir = tempdir().unwrap();
        let fresh = dir.path().join("add-1111.yaml");
        let stale = dir.path().join("add-2222.yaml");
        touch(&fresh).await;
        touch(&stale).await;

        let session = RunSession::begin(dir.path());
        session.record_reference(&fresh);

        let report = clean(&["add".to_string()], &session.context())
            .await
            .unwrap();

        assert_eq!(report.removed, vec![stale.clone()]);
        assert_eq!(report.kept, vec![fresh.clone()]);
        assert!(tokio::fs::metadata(&fresh).await.is_ok());
        assert!(tokio::fs::metadata(&stale).await.is_err());
    }

    #[tokio::test]
    async fn test_ignores_files_outside_patterns() {
        let dir = tempdir().unwrap();
        let unrelated = dir.path().join("notes.txt");
        let other_step = dir.path().join("edit-9999.yaml");
        touch(&unrelated).await;
        touch(&other_step).await;

        let session = RunSession::begin(dir.path());
        let report = clean(&["add".to_string()], &session.context())
            .await
            .unwrap();

        assert!(report.removed.is_empty());
        assert!(tokio::fs::metadata(&unrelated).await.is_ok());
        assert!(tokio::fs::metadata(&other_step).await.is_ok());
    }

    #[tokio::test]
    async fn test_keeps_live_nested_levels() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("plan-1111");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        let inner = nested.join("edit-2222.yaml");
        touch(&inner).await;

        let session = RunSession::begin(dir.path());
        // Only the nested artifact is in the log; the directory itself is
        // live because a logged path sits under it.
        session.record_reference(&inner);

        let report = clean(&["plan".to_string()], &session.context())
            .await
            .unwrap();

        assert!(report.removed.is_empty());
        assert_eq!(report.kept, vec![nested.clone()]);
        assert!(tokio::fs::metadata(&inner).await.is_ok());
    }

    #[tokio::test]
    async fn test_removes_abandoned_nested_levels() {
        let dir = tempdir().unwrap();
        let abandoned = dir.path().join("plan-9999");
        tokio::fs::create_dir_all(&abandoned).await.unwrap();
        touch(&abandoned.join("edit-0000.yaml")).await;

        let session = RunSession::begin(dir.path());
        let report = clean(&["plan".to_string()], &session.context())
            .await
            .unwrap();

        assert_eq!(report.removed, vec![abandoned.clone()]);
        assert!(tokio::fs::metadata(&abandoned).await.is_err());
    }

    #[tokio::test]
    async fn test_no_location_is_a_no_op() {
        let session = RunSession::ephemeral();
        let report = clean(&["add".to_string()], &session.context())
            .await
            .unwrap();
        assert!(report.location.is_none());
        assert!(report.removed.is_empty());
    }
}
