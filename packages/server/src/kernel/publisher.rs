//! Publishing adapters.
//!
//! The worker publishes through the [`Publisher`] trait; `ChirpPublisher`
//! wraps the `chirp` client crate and is the only place platform errors are
//! translated into the engine's adapter taxonomy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::error::AdapterError;

/// Media classification used to pick the upload path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mp4" | "mov" | "avi" | "webm") => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

/// A media file resolved through the media root, ready to upload.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: PathBuf,
    pub kind: MediaKind,
}

impl MediaFile {
    pub fn new(path: PathBuf) -> Self {
        let kind = MediaKind::from_path(&path);
        Self { path, kind }
    }
}

/// Result of a successful publication.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub post_id: String,
    pub duration_seconds: f64,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, caption: &str, media: &MediaFile)
        -> Result<PublishReceipt, AdapterError>;
}

/// Publisher backed by the chirp platform client.
pub struct ChirpPublisher {
    client: chirp::ChirpClient,
}

impl ChirpPublisher {
    pub fn new(client: chirp::ChirpClient) -> Self {
        Self { client }
    }
}

fn map_chirp_error(error: chirp::ChirpError) -> AdapterError {
    match error {
        chirp::ChirpError::RateLimited { reset_after_secs } => AdapterError::Quota {
            cooldown: Duration::from_secs(reset_after_secs),
        },
        e if e.is_transient() => AdapterError::Transient(e.to_string()),
        e => AdapterError::Permanent(e.to_string()),
    }
}

#[async_trait]
impl Publisher for ChirpPublisher {
    async fn publish(
        &self,
        caption: &str,
        media: &MediaFile,
    ) -> Result<PublishReceipt, AdapterError> {
        let started = std::time::Instant::now();

        let bytes = tokio::fs::read(&media.path).await.map_err(|e| {
            AdapterError::Permanent(format!("media {} unreadable: {e}", media.path.display()))
        })?;

        let kind = match media.kind {
            MediaKind::Image => chirp::MediaKind::Image,
            MediaKind::Video => chirp::MediaKind::Video,
        };

        let media_id = self
            .client
            .upload_media(bytes, kind)
            .await
            .map_err(map_chirp_error)?;

        let post = self
            .client
            .create_post(caption, &[media_id])
            .await
            .map_err(map_chirp_error)?;

        Ok(PublishReceipt {
            post_id: post.post_id,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

/// Placeholder for contexts that never publish (scan, status). Calling it
/// is a permanent failure rather than a panic.
pub struct UnconfiguredPublisher;

#[async_trait]
impl Publisher for UnconfiguredPublisher {
    async fn publish(
        &self,
        _caption: &str,
        _media: &MediaFile,
    ) -> Result<PublishReceipt, AdapterError> {
        Err(AdapterError::Permanent(
            "no publisher configured for this invocation".into(),
        ))
    }
}
