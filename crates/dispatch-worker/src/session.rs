//! `Session` is read-only, created by an out-of-scope init-session
//! collaborator and referenced by every job; this crate only deserializes
//! it from the durable store's `session:<sessionId>` key.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionAuth {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    pub auth: SessionAuth,
}
