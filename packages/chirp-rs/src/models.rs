//! Wire types for the chirp API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct CreatePostRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PostResponse {
    pub data: PostData,
}

#[derive(Debug, Deserialize)]
pub struct PostData {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaInitResponse {
    pub media_id_string: String,
}
