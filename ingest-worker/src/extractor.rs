use std::time;

use async_trait::async_trait;
use ingest_common::payload::RawContent;
use ingest_common::pool::ApiKey;
use reqwest::header;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ExtractError;
use crate::parser::{ExtractedPosting, Extractor};

/// Calls the `generateContent` endpoint of a Gemini-style generative language API, asking for a
/// JSON answer that follows the `ExtractedPosting` schema.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpExtractor {
    pub fn new(
        endpoint: &str,
        model: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Crawl Ingest Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
        })
    }

    fn url(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .find(|text| !text.trim().is_empty())
    }
}

fn prompt(raw: &RawContent) -> String {
    format!(
        "The following text was crawled from a web page. Decide whether it is a job posting. \
         If it is, extract the posting title, the hiring company, the job description, the \
         employment type, the required experience, the application start and end dates as \
         YYYY-MM-DD and the work location as written. Leave out anything the text does not state.\n\n{}",
        raw.text
    )
}

fn response_schema() -> Value {
    let text = json!({ "type": "STRING", "nullable": true });
    json!({
        "type": "OBJECT",
        "properties": {
            "is_recruit_info": { "type": "BOOLEAN" },
            "title": text,
            "company_name": text,
            "job_description": text,
            "job_type": text,
            "require_experience": text,
            "apply_start_date": text,
            "apply_end_date": text,
            "region_text": text,
        },
        "required": ["is_recruit_info"],
    })
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        key: &ApiKey,
        raw: &RawContent,
    ) -> Result<ExtractedPosting, ExtractError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt(raw) }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema(),
            },
        });

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &key.key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .json::<GenerateContentResponse>()
            .await?
            .into_text()
            .ok_or(ExtractError::EmptyResponse)?;

        Ok(serde_json::from_str(&text)?)
    }
}
