//! Media-path canonicalization.
//!
//! Stored `media_path` values are always relative to the configured media
//! root and use `/` separators, so a database produced on one operating
//! system stays usable on another. Absolute paths under the root are
//! rewritten root-relative at ingest; absolute paths outside the root are
//! rejected.

use std::path::{Component, Path, PathBuf};

use crate::common::error::{CoreError, CoreResult};

/// Canonicalize a candidate media path for storage.
///
/// Accepts either a path relative to `root` or an absolute path under
/// `root`. Rejects traversal components and absolute paths that escape the
/// root.
pub fn normalize_media_path(root: &Path, candidate: &Path) -> CoreResult<String> {
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(root).map_err(|_| {
            CoreError::InvalidInput(format!(
                "media path {} is outside the media root",
                candidate.display()
            ))
        })?
    } else {
        candidate
    };

    let mut segments: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => segments.push(s.to_string()),
                None => {
                    return Err(CoreError::InvalidInput(format!(
                        "media path {} is not valid UTF-8",
                        relative.display()
                    )))
                }
            },
            Component::CurDir => {}
            _ => {
                return Err(CoreError::InvalidInput(format!(
                    "media path {} contains traversal components",
                    relative.display()
                )))
            }
        }
    }

    if segments.is_empty() {
        return Err(CoreError::InvalidInput("media path is empty".into()));
    }

    Ok(segments.join("/"))
}

/// Resolve a stored media path back to a filesystem path under `root`.
pub fn resolve_media_path(root: &Path, stored: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in stored.split('/') {
        path.push(segment);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_passes_through() {
        let root = Path::new("/srv/media");
        let normalized = normalize_media_path(root, Path::new("project-a/clips/m1.mp4")).unwrap();
        assert_eq!(normalized, "project-a/clips/m1.mp4");
    }

    #[test]
    fn absolute_path_under_root_becomes_relative() {
        let root = Path::new("/srv/media");
        let normalized =
            normalize_media_path(root, Path::new("/srv/media/project-a/m1.mp4")).unwrap();
        assert_eq!(normalized, "project-a/m1.mp4");
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let root = Path::new("/srv/media");
        let result = normalize_media_path(root, Path::new("/etc/passwd"));
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn traversal_is_rejected() {
        let root = Path::new("/srv/media");
        let result = normalize_media_path(root, Path::new("a/../../b.mp4"));
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn resolve_round_trips() {
        let root = Path::new("/srv/media");
        let stored = "project-a/clips/m1.mp4";
        let resolved = resolve_media_path(root, stored);
        assert_eq!(resolved, Path::new("/srv/media/project-a/clips/m1.mp4"));
        assert_eq!(normalize_media_path(root, &resolved).unwrap(), stored);
    }
}
