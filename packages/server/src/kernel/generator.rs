//! Caption generation adapters.
//!
//! The worker talks to a [`CaptionGenerator`] trait object; the concrete
//! adapter is chosen at startup from configuration. `OpenAiGenerator`
//! memoizes per process keyed by a hash of its inputs, so a retried attempt
//! inside one run reuses the previous caption instead of re-billing.
//! Captions may drift across process restarts; that is the documented
//! trade-off.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::error::AdapterError;
use crate::config::GeneratorConfig;

/// Inputs for one caption.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub content_data: serde_json::Value,
    pub language: String,
    pub style_hints: Vec<String>,
    pub char_limit: usize,
}

#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    async fn generate(&self, request: &CaptionRequest) -> Result<String, AdapterError>;
}

/// Truncate to a character budget without splitting a code point.
pub fn truncate_caption(caption: &str, char_limit: usize) -> String {
    caption.trim().chars().take(char_limit).collect()
}

/// Pull a pre-authored caption out of the metadata snapshot.
fn metadata_caption(content_data: &serde_json::Value) -> Option<&str> {
    for key in ["caption", "text", "title"] {
        if let Some(value) = content_data.get(key).and_then(|v| v.as_str()) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Echoes the caption already present in the metadata. Used when AI
/// enhancement is disabled.
pub struct PassthroughGenerator;

#[async_trait]
impl CaptionGenerator for PassthroughGenerator {
    async fn generate(&self, request: &CaptionRequest) -> Result<String, AdapterError> {
        match metadata_caption(&request.content_data) {
            Some(caption) => Ok(truncate_caption(caption, request.char_limit)),
            None => Err(AdapterError::Permanent(
                "metadata has no caption, text or title field".into(),
            )),
        }
    }
}

// OpenAI wire types, kept to the fields this adapter touches.

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

pub struct OpenAiGenerator {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    cache: Mutex<HashMap<String, String>>,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: config.model.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn cache_key(&self, request: &CaptionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.content_data.to_string().as_bytes());
        hasher.update(request.language.as_bytes());
        hasher.update(request.style_hints.join("\n").as_bytes());
        hasher.update(self.model.as_bytes());
        hasher.update(request.char_limit.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    fn build_prompt(request: &CaptionRequest) -> String {
        let mut parts = Vec::new();
        if let Some(title) = request.content_data.get("title").and_then(|v| v.as_str()) {
            parts.push(format!("Title: {title}"));
        }
        if let Some(description) = request
            .content_data
            .get("description")
            .and_then(|v| v.as_str())
        {
            parts.push(format!("Description: {description}"));
        }
        if let Some(tags) = request.content_data.get("tags").and_then(|v| v.as_array()) {
            let tags: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
            if !tags.is_empty() {
                parts.push(format!("Tags: {}", tags.join(", ")));
            }
        }
        if parts.is_empty() {
            parts.push(format!("Metadata: {}", request.content_data));
        }
        parts.join("\n")
    }
}

#[async_trait]
impl CaptionGenerator for OpenAiGenerator {
    async fn generate(&self, request: &CaptionRequest) -> Result<String, AdapterError> {
        let key = self.cache_key(request);
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return Ok(cached.clone());
            }
        }

        let mut system = format!(
            "You write social media captions in language {:?}. \
             Respond with the caption only, at most {} characters.",
            request.language, request.char_limit
        );
        for hint in &request.style_hints {
            system.push_str("\nStyle: ");
            system.push_str(hint);
        }

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_prompt(request),
                },
            ],
            max_tokens: 200,
            temperature: 0.7,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AdapterError::Transient(format!("generator request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let cooldown = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(AdapterError::Quota {
                cooldown: Duration::from_secs(cooldown),
            });
        }
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!(
                "generator returned {status}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::Permanent(format!(
                "generator rejected request ({status}): {detail}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Transient(format!("generator response unreadable: {e}")))?;

        let caption = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AdapterError::Permanent("generator returned no caption".into()))?;
        let caption = truncate_caption(&caption, request.char_limit);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, caption.clone());
        }
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(content_data: serde_json::Value) -> CaptionRequest {
        CaptionRequest {
            content_data,
            language: "en".into(),
            style_hints: vec![],
            char_limit: 280,
        }
    }

    #[tokio::test]
    async fn passthrough_prefers_caption_field() {
        let generator = PassthroughGenerator;
        let caption = generator
            .generate(&request(json!({"caption": "from caption", "title": "from title"})))
            .await
            .unwrap();
        assert_eq!(caption, "from caption");
    }

    #[tokio::test]
    async fn passthrough_falls_back_to_title() {
        let generator = PassthroughGenerator;
        let caption = generator
            .generate(&request(json!({"title": "a sunny day"})))
            .await
            .unwrap();
        assert_eq!(caption, "a sunny day");
    }

    #[tokio::test]
    async fn passthrough_rejects_captionless_metadata() {
        let generator = PassthroughGenerator;
        let result = generator.generate(&request(json!({"duration": 12}))).await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_caption("héllo wörld", 5), "héllo");
        assert_eq!(truncate_caption("  short  ", 280), "short");
    }

    #[test]
    fn cache_key_is_stable_for_equal_inputs() {
        let generator = OpenAiGenerator::new(&GeneratorConfig::default(), "k".into());
        let a = generator.cache_key(&request(json!({"title": "x"})));
        let b = generator.cache_key(&request(json!({"title": "x"})));
        let c = generator.cache_key(&request(json!({"title": "y"})));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn prompt_collects_known_fields() {
        let prompt = OpenAiGenerator::build_prompt(&request(json!({
            "title": "Lake at dawn",
            "description": "Fog over the water",
            "tags": ["nature", "morning"],
        })));
        assert!(prompt.contains("Title: Lake at dawn"));
        assert!(prompt.contains("Description: Fog over the water"));
        assert!(prompt.contains("Tags: nature, morning"));
    }
}
