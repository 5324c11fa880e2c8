//! HTTP client for the chirp publishing API.
//!
//! Media is uploaded first (chunked for video), then a post referencing the
//! uploaded media is created. Rate-limit responses are surfaced with the
//! advised cooldown so callers can back off instead of hammering the API.

pub mod models;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use std::time::Instant;

use crate::models::{CreatePostRequest, MediaInitResponse, PostData, PostResponse};

/// Video uploads are appended in segments of this size.
const UPLOAD_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Fallback cooldown when a 429 arrives without a usable reset header.
const DEFAULT_RATE_LIMIT_COOLDOWN_SECS: u64 = 900;

/// Client errors, categorized so callers can decide retry behavior.
#[derive(Debug, thiserror::Error)]
pub enum ChirpError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The API rejected the request with a retryable server error.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The API rejected the request permanently (auth, validation).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Rate limited; retry no sooner than `reset_after_secs`.
    #[error("rate limited, reset in {reset_after_secs}s")]
    RateLimited { reset_after_secs: u64 },

    /// Response body did not parse as expected.
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl ChirpError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChirpError::Network(_) | ChirpError::Server { .. })
    }
}

/// Kind of media being uploaded; video goes through the chunked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// MIME type reported to the upload endpoint.
    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChirpOptions {
    /// Base URL for the posting API, e.g. `https://api.chirp.example/2`.
    pub api_base: String,
    /// Base URL for the media upload API.
    pub upload_base: String,
    /// Bearer token; the sole credential this crate holds.
    pub bearer_token: String,
}

/// A created post, along with how long the round trip took.
#[derive(Debug, Clone)]
pub struct PublishedPost {
    pub post_id: String,
    pub duration_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ChirpClient {
    options: ChirpOptions,
    http: Client,
}

impl ChirpClient {
    pub fn new(options: ChirpOptions) -> Self {
        Self {
            options,
            http: Client::new(),
        }
    }

    /// Upload media and return the platform media id.
    ///
    /// Images go up in a single multipart request; video is uploaded in
    /// INIT/APPEND/FINALIZE segments of [`UPLOAD_CHUNK_BYTES`].
    pub async fn upload_media(&self, bytes: Vec<u8>, kind: MediaKind) -> Result<String, ChirpError> {
        match kind {
            MediaKind::Image => self.upload_simple(bytes, kind).await,
            MediaKind::Video => self.upload_chunked(bytes, kind).await,
        }
    }

    /// Create a post with the given text and previously uploaded media.
    pub async fn create_post(
        &self,
        text: &str,
        media_ids: &[String],
    ) -> Result<PublishedPost, ChirpError> {
        let url = format!("{}/posts", self.options.api_base);
        let request = CreatePostRequest {
            text: text.to_string(),
            media_ids: if media_ids.is_empty() {
                None
            } else {
                Some(media_ids.to_vec())
            },
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.options.bearer_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChirpError::Network(e.to_string()))?;

        let response = check_status(response).await?;
        let body: PostResponse = response
            .json()
            .await
            .map_err(|e| ChirpError::Parse(e.to_string()))?;

        let PostData { id } = body.data;
        tracing::debug!(post_id = %id, "post created");

        Ok(PublishedPost {
            post_id: id,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    async fn upload_simple(&self, bytes: Vec<u8>, kind: MediaKind) -> Result<String, ChirpError> {
        let url = format!("{}/media/upload", self.options.upload_base);
        let part = Part::bytes(bytes)
            .file_name("media")
            .mime_str(kind.mime_type())
            .map_err(|e| ChirpError::Parse(e.to_string()))?;
        let form = Form::new().part("media", part);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.options.bearer_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChirpError::Network(e.to_string()))?;

        let response = check_status(response).await?;
        let body: MediaInitResponse = response
            .json()
            .await
            .map_err(|e| ChirpError::Parse(e.to_string()))?;

        Ok(body.media_id_string)
    }

    async fn upload_chunked(&self, bytes: Vec<u8>, kind: MediaKind) -> Result<String, ChirpError> {
        let url = format!("{}/media/upload", self.options.upload_base);

        // INIT
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.options.bearer_token)
            .form(&[
                ("command", "INIT".to_string()),
                ("total_bytes", bytes.len().to_string()),
                ("media_type", kind.mime_type().to_string()),
            ])
            .send()
            .await
            .map_err(|e| ChirpError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        let init: MediaInitResponse = response
            .json()
            .await
            .map_err(|e| ChirpError::Parse(e.to_string()))?;
        let media_id = init.media_id_string;

        // APPEND, one segment per chunk
        for (segment_index, chunk) in bytes.chunks(UPLOAD_CHUNK_BYTES).enumerate() {
            let part = Part::bytes(chunk.to_vec()).file_name("media");
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", segment_index.to_string())
                .part("media", part);

            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.options.bearer_token)
                .multipart(form)
                .send()
                .await
                .map_err(|e| ChirpError::Network(e.to_string()))?;
            check_status(response).await?;
            tracing::trace!(media_id = %media_id, segment_index, "segment appended");
        }

        // FINALIZE
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.options.bearer_token)
            .form(&[("command", "FINALIZE"), ("media_id", media_id.as_str())])
            .send()
            .await
            .map_err(|e| ChirpError::Network(e.to_string()))?;
        check_status(response).await?;

        Ok(media_id)
    }
}

/// Map a non-success response onto the error taxonomy.
async fn check_status(response: Response) -> Result<Response, ChirpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset_after_secs = rate_limit_reset_secs(&response);
        return Err(ChirpError::RateLimited { reset_after_secs });
    }

    let code = status.as_u16();
    let message = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(ChirpError::Server {
            status: code,
            message,
        })
    } else {
        Err(ChirpError::Rejected {
            status: code,
            message,
        })
    }
}

/// Seconds until the rate-limit window resets, from `x-rate-limit-reset`
/// (epoch seconds). Falls back to a conservative default when absent.
fn rate_limit_reset_secs(response: &Response) -> u64 {
    let reset_epoch = response
        .headers()
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match reset_epoch {
        Some(epoch) => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            epoch.saturating_sub(now).max(1)
        }
        None => DEFAULT_RATE_LIMIT_COOLDOWN_SECS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChirpError::Network("reset by peer".into()).is_transient());
        assert!(ChirpError::Server {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!ChirpError::Rejected {
            status: 401,
            message: "bad token".into()
        }
        .is_transient());
        assert!(!ChirpError::RateLimited {
            reset_after_secs: 60
        }
        .is_transient());
    }

    #[test]
    fn media_kind_mime_types() {
        assert_eq!(MediaKind::Image.mime_type(), "image/jpeg");
        assert_eq!(MediaKind::Video.mime_type(), "video/mp4");
    }
}
