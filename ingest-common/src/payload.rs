use serde::{Deserialize, Serialize};

use crate::channel::Payload;

/// A crawled page as published by the crawler. The `url` identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContent {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
}

impl RawContent {
    pub fn from_payload(payload: Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }

    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_value(self)
    }
}
