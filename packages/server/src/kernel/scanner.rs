//! Content scanner.
//!
//! Walks each enabled content source for media files, resolves the sibling
//! metadata file (same basename, configured extension), and submits new
//! tasks to the store. Deduplication is enforced by the store's natural key
//! `(project_id, media_path)`, never here. The scanner is the only mutator
//! of source counters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::common::paths::{normalize_media_path, resolve_media_path};
use crate::kernel::deps::EngineDeps;
use crate::kernel::projects::ContentSource;
use crate::kernel::tasks::task::NewTask;

/// Counters for one scan pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScanReport {
    /// Media candidates found on disk.
    pub discovered: usize,
    /// New tasks created.
    pub created: usize,
    /// Candidates already represented by a task.
    pub skipped_existing: usize,
    /// Candidates with missing or malformed metadata.
    pub invalid: usize,
}

impl ScanReport {
    fn absorb(&mut self, other: ScanReport) {
        self.discovered += other.discovered;
        self.created += other.created;
        self.skipped_existing += other.skipped_existing;
        self.invalid += other.invalid;
    }
}

pub struct Scanner {
    deps: Arc<EngineDeps>,
}

impl Scanner {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }

    /// Scan every enabled source of one project.
    pub async fn scan_project(
        &self,
        project_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<ScanReport> {
        let sources = ContentSource::find_by_project(project_id, &self.deps.pool).await?;
        let mut report = ScanReport::default();
        for source in sources.iter().filter(|s| s.enabled) {
            report.absorb(self.scan_source(source, now).await?);
        }
        Ok(report)
    }

    /// Scan every enabled source across all projects.
    pub async fn scan_all(&self, now: DateTime<Utc>) -> CoreResult<ScanReport> {
        let sources = ContentSource::find_enabled(&self.deps.pool).await?;
        let mut report = ScanReport::default();
        for source in &sources {
            report.absorb(self.scan_source(source, now).await?);
        }
        Ok(report)
    }

    /// Scan one source directory and ingest unseen items.
    pub async fn scan_source(
        &self,
        source: &ContentSource,
        now: DateTime<Utc>,
    ) -> CoreResult<ScanReport> {
        let root = self.deps.config.media.root.clone();
        let dir = resolve_media_path(&root, &source.path);
        if !dir.is_dir() {
            warn!(source_id = %source.id, dir = %dir.display(), "source directory missing, skipping");
            return Ok(ScanReport::default());
        }

        let extensions = self.deps.config.scanner.media_extensions.clone();
        let files = tokio::task::spawn_blocking(move || collect_media_files(&dir, &extensions))
            .await
            .map_err(|e| CoreError::Invariant(format!("scan walk panicked: {e}")))??;

        let mut report = ScanReport {
            discovered: files.len(),
            ..Default::default()
        };

        let metadata_ext = &self.deps.config.scanner.metadata_extension;
        let mut batch = Vec::new();
        for file in files {
            let metadata_path = file.with_extension(metadata_ext);
            let content_data = match read_metadata(&metadata_path).await {
                Ok(value) => value,
                Err(reason) => {
                    debug!(media = %file.display(), %reason, "skipping candidate");
                    report.invalid += 1;
                    continue;
                }
            };

            let media_path = match normalize_media_path(&root, &file) {
                Ok(path) => path,
                Err(e) => {
                    warn!(media = %file.display(), error = %e, "cannot canonicalize, skipping");
                    report.invalid += 1;
                    continue;
                }
            };

            let priority = content_data
                .get("priority")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;

            batch.push(NewTask {
                project_id: source.project_id,
                source_id: Some(source.id),
                media_path,
                content_data,
                scheduled_at: now,
                priority,
            });
        }

        let created = self.deps.store.create_tasks(&batch).await?;
        report.created = created.created;
        report.skipped_existing = created.skipped;

        let used_items = self.deps.store.count_tasks_for_source(source.id).await?;
        source
            .record_scan(report.discovered as i32, used_items as i32, now, &self.deps.pool)
            .await?;

        info!(
            source_id = %source.id,
            discovered = report.discovered,
            created = report.created,
            skipped = report.skipped_existing,
            invalid = report.invalid,
            "source scanned"
        );
        Ok(report)
    }
}

/// Recursively collect files whose extension is in `extensions`
/// (case-insensitive), sorted for deterministic ingest order.
fn collect_media_files(dir: &Path, extensions: &[String]) -> CoreResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| {
            CoreError::InvalidInput(format!("cannot read {}: {e}", current.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                CoreError::InvalidInput(format!("cannot read {}: {e}", current.display()))
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if has_extension(&path, extensions) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| extensions.iter().any(|allowed| *allowed == e))
}

/// Read and validate the sibling metadata file. The snapshot must be a JSON
/// object; anything else is a diagnostic, not an error.
async fn read_metadata(path: &Path) -> Result<serde_json::Value, String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("metadata unreadable: {e}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("metadata malformed: {e}"))?;
    if !value.is_object() {
        return Err("metadata is not a JSON object".to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions() -> Vec<String> {
        vec!["mp4".into(), "jpg".into()]
    }

    #[test]
    fn collects_matching_files_recursively_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a.JPG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(nested.join("c.mp4"), b"x").unwrap();

        let files = collect_media_files(dir.path(), &extensions()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| {
                f.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.mp4", "nested/c.mp4"]);
    }

    #[tokio::test]
    async fn metadata_must_be_a_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m1.json");

        std::fs::write(&path, br#"{"title": "ok"}"#).unwrap();
        assert!(read_metadata(&path).await.is_ok());

        std::fs::write(&path, b"[1, 2, 3]").unwrap();
        assert!(read_metadata(&path).await.is_err());

        std::fs::write(&path, b"{not json").unwrap();
        assert!(read_metadata(&path).await.is_err());

        assert!(read_metadata(&dir.path().join("absent.json")).await.is_err());
    }
}
