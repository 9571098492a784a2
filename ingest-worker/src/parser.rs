//! # Parser
//!
//! Turns raw crawled content into a structured posting by calling an external extraction
//! service. Every attempt borrows one credential from a shared `ResourcePool`, which caps the
//! number of concurrent calls made against the service.
use std::time;

use async_trait::async_trait;
use chrono::NaiveDate;
use ingest_common::payload::RawContent;
use ingest_common::pool::{ApiKey, ResourcePool};
use ingest_common::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ExtractError, ParseError};

pub const DEFAULT_JOB_TYPE: &str = "무관";
pub const DEFAULT_REQUIRE_EXPERIENCE: &str = "경력무관";

/// The posting as returned by the extraction service, before any clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPosting {
    #[serde(default)]
    pub is_recruit_info: bool,
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub job_description: Option<String>,
    pub job_type: Option<String>,
    pub require_experience: Option<String>,
    pub apply_start_date: Option<String>,
    pub apply_end_date: Option<String>,
    pub region_text: Option<String>,
}

/// A structured posting, ready for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedPosting {
    pub is_recruit_info: bool,
    pub title: String,
    pub company_name: Option<String>,
    pub job_description: Option<String>,
    pub job_type: String,
    pub require_experience: String,
    pub apply_start_date: Option<NaiveDate>,
    pub apply_end_date: Option<NaiveDate>,
    pub region_text: Option<String>,
}

/// One call to the extraction service with one credential.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, key: &ApiKey, raw: &RawContent) -> Result<ExtractedPosting, ExtractError>;
}

/// The parse capability consumed by the pipeline.
#[async_trait]
pub trait Parse: Send + Sync {
    /// Parse `raw`, making at most `policy.max_attempts` attempts.
    async fn parse(&self, raw: &RawContent, policy: &RetryPolicy) -> Result<ParsedPosting, ParseError>;
}

/// A `Parse` implementation running an `Extractor` with credentials borrowed from a pool.
pub struct PooledParser<E> {
    extractor: E,
    keys: ResourcePool<ApiKey>,
    request_timeout: time::Duration,
    key_cooldown: time::Duration,
}

impl<E: Extractor> PooledParser<E> {
    pub fn new(
        extractor: E,
        keys: ResourcePool<ApiKey>,
        request_timeout: time::Duration,
        key_cooldown: time::Duration,
    ) -> Self {
        Self {
            extractor,
            keys,
            request_timeout,
            key_cooldown,
        }
    }

    async fn attempt(&self, raw: &RawContent) -> Result<ExtractedPosting, ExtractError> {
        let key = self.keys.checkout().await;
        debug!(key = %key.id, url = %raw.url, "extraction request started");

        let result = match tokio::time::timeout(
            self.request_timeout,
            self.extractor.extract(&key, raw),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout(self.request_timeout)),
        };

        match result {
            Ok(_) => key.release(),
            Err(_) => {
                key.release_after(self.key_cooldown);
            }
        }
        result
    }
}

#[async_trait]
impl<E: Extractor> Parse for PooledParser<E> {
    async fn parse(&self, raw: &RawContent, policy: &RetryPolicy) -> Result<ParsedPosting, ParseError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics::counter!("ingest_parse_attempts_total").increment(1);

            let error = match self.attempt(raw).await {
                Ok(extracted) => return Ok(post_process(extracted, raw)),
                Err(error) => error,
            };

            if !policy.has_attempts_left(attempt) {
                metrics::counter!("ingest_parse_exhausted_total").increment(1);
                error!(
                    url = %raw.url,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "extraction failed, attempts exhausted: {}",
                    error
                );
                return Err(ParseError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let interval = policy.retry_interval(attempt);
            warn!(
                url = %raw.url,
                attempt,
                max_attempts = policy.max_attempts,
                "extraction failed, will be retried in {:?}: {}",
                interval,
                error
            );
            tokio::time::sleep(interval).await;
        }
    }
}

/// Fill in defaults and drop values that cannot be trusted.
pub fn post_process(extracted: ExtractedPosting, raw: &RawContent) -> ParsedPosting {
    ParsedPosting {
        is_recruit_info: extracted.is_recruit_info,
        title: non_blank(extracted.title).unwrap_or_else(|| raw.title.clone()),
        company_name: non_blank(extracted.company_name),
        job_description: non_blank(extracted.job_description),
        job_type: non_blank(extracted.job_type).unwrap_or_else(|| DEFAULT_JOB_TYPE.to_owned()),
        require_experience: non_blank(extracted.require_experience)
            .unwrap_or_else(|| DEFAULT_REQUIRE_EXPERIENCE.to_owned()),
        apply_start_date: extracted.apply_start_date.as_deref().and_then(parse_date),
        apply_end_date: extracted.apply_end_date.as_deref().and_then(parse_date),
        region_text: non_blank(extracted.region_text),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Parse a date written by the extraction service. Dates outside 2000-2100 are considered
/// hallucinated.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    // Timestamps such as 2025-03-30T23:59:00Z only contribute their date.
    let date_part = value.get(..10).unwrap_or(value);

    let date = ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())?;

    let earliest = NaiveDate::from_ymd_opt(2000, 1, 1)?;
    let latest = NaiveDate::from_ymd_opt(2100, 12, 31)?;
    (earliest..=latest).contains(&date).then_some(date)
}
