//! # Repository
//!
//! Persistence of accepted postings. Writes are upserts keyed on the posting url, so processing
//! the same message twice leaves a single row behind.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ingest_common::payload::RawContent;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::PersistError;
use crate::parser::ParsedPosting;

/// A job posting as stored: the raw content merged with what was parsed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecruitInfo {
    pub url: String,
    pub title: String,
    pub company_name: String,
    pub job_description: String,
    pub job_type: String,
    pub require_experience: String,
    pub apply_start_date: Option<NaiveDate>,
    pub apply_end_date: Option<NaiveDate>,
    pub region_text: Option<String>,
    pub raw_text: String,
    pub domain: Option<String>,
    pub favicon: Option<String>,
    pub content_hash: String,
    pub job_valid_type: i16,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecruitInfo {
    pub fn new(posting: ParsedPosting, raw: RawContent, now: DateTime<Utc>) -> Self {
        Self {
            content_hash: content_hash(&raw.text),
            url: raw.url,
            title: posting.title,
            company_name: posting.company_name.unwrap_or_default(),
            job_description: posting.job_description.unwrap_or_default(),
            job_type: posting.job_type,
            require_experience: posting.require_experience,
            apply_start_date: posting.apply_start_date,
            apply_end_date: posting.apply_end_date,
            region_text: posting.region_text,
            raw_text: raw.text,
            domain: raw.domain,
            favicon: raw.favicon,
            job_valid_type: 0,
            is_public: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Hex encoded SHA-256 of the crawled text.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn connect(&self) -> Result<(), PersistError>;

    /// Insert `info`, or update the row already stored for its url.
    async fn persist(&self, info: &RecruitInfo) -> Result<(), PersistError>;
}

/// Stores postings in the `recruit_info` table.
pub struct PgRecruitInfoRepository {
    url: String,
    max_connections: u32,
    pool: OnceCell<PgPool>,
}

impl PgRecruitInfoRepository {
    pub fn new(url: &str, max_connections: u32) -> Self {
        Self {
            url: url.to_owned(),
            max_connections,
            pool: OnceCell::new(),
        }
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            url: String::new(),
            max_connections: 0,
            pool: OnceCell::new_with(Some(pool)),
        }
    }
}

#[async_trait]
impl Repository for PgRecruitInfoRepository {
    async fn connect(&self) -> Result<(), PersistError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect(&self.url)
                    .await
                    .map_err(|error| PersistError::ConnectionError { error })?;
                info!("recruit info repository connected");
                Ok::<_, PersistError>(pool)
            })
            .await?;

        Ok(())
    }

    async fn persist(&self, info: &RecruitInfo) -> Result<(), PersistError> {
        let pool = self.pool.get().ok_or(PersistError::NotConnected)?;

        let base_query = r#"
INSERT INTO recruit_info
    (url, title, company_name, job_description, job_type, require_experience,
     apply_start_date, apply_end_date, region_text, raw_text, domain, favicon,
     content_hash, job_valid_type, is_public, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
ON CONFLICT (url) DO UPDATE SET
    title = EXCLUDED.title,
    company_name = EXCLUDED.company_name,
    job_description = EXCLUDED.job_description,
    job_type = EXCLUDED.job_type,
    require_experience = EXCLUDED.require_experience,
    apply_start_date = EXCLUDED.apply_start_date,
    apply_end_date = EXCLUDED.apply_end_date,
    region_text = EXCLUDED.region_text,
    raw_text = EXCLUDED.raw_text,
    domain = EXCLUDED.domain,
    favicon = EXCLUDED.favicon,
    content_hash = EXCLUDED.content_hash,
    updated_at = EXCLUDED.updated_at
        "#;

        let result = sqlx::query(base_query)
            .bind(&info.url)
            .bind(&info.title)
            .bind(&info.company_name)
            .bind(&info.job_description)
            .bind(&info.job_type)
            .bind(&info.require_experience)
            .bind(info.apply_start_date)
            .bind(info.apply_end_date)
            .bind(&info.region_text)
            .bind(&info.raw_text)
            .bind(&info.domain)
            .bind(&info.favicon)
            .bind(&info.content_hash)
            .bind(info.job_valid_type)
            .bind(info.is_public)
            .bind(info.created_at)
            .bind(info.updated_at)
            .execute(pool)
            .await
            .map_err(|error| PersistError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        debug!(url = %info.url, rows = result.rows_affected(), "recruit info persisted");
        Ok(())
    }
}

/// Keeps postings in a map keyed on url. Backs the in-memory mode and tests.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    rows: Arc<Mutex<HashMap<String, RecruitInfo>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<RecruitInfo> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn connect(&self) -> Result<(), PersistError> {
        Ok(())
    }

    async fn persist(&self, info: &RecruitInfo) -> Result<(), PersistError> {
        let mut rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut info = info.clone();
        if let Some(existing) = rows.get(&info.url) {
            info.created_at = existing.created_at;
        }
        rows.insert(info.url.clone(), info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn recruit_info(text: &str, now: DateTime<Utc>) -> RecruitInfo {
        let raw = RawContent {
            url: "https://careers.example.com/jobs/1".to_owned(),
            title: "Backend Engineer".to_owned(),
            text: text.to_owned(),
            domain: Some("careers.example.com".to_owned()),
            favicon: None,
        };
        let posting = ParsedPosting {
            is_recruit_info: true,
            title: "Backend Engineer".to_owned(),
            company_name: Some("Example".to_owned()),
            job_description: Some("Build services".to_owned()),
            job_type: "정규직".to_owned(),
            require_experience: "경력무관".to_owned(),
            apply_start_date: None,
            apply_end_date: NaiveDate::from_ymd_opt(2025, 3, 30),
            region_text: Some("Seoul".to_owned()),
        };
        RecruitInfo::new(posting, raw, now)
    }

    #[test]
    fn test_new_recruit_info_is_public_and_valid() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let info = recruit_info("We are hiring", now);

        assert_eq!(info.job_valid_type, 0);
        assert!(info.is_public);
        assert_eq!(info.created_at, now);
        assert_eq!(info.updated_at, now);
        assert_eq!(info.raw_text, "We are hiring");
        assert_eq!(info.content_hash, content_hash("We are hiring"));
        assert_eq!(info.content_hash.len(), 64);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[tokio::test]
    async fn test_memory_repository_upserts_on_url() {
        let repository = MemoryRepository::new();
        let first = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap();

        repository.persist(&recruit_info("v1", first)).await.unwrap();
        repository.persist(&recruit_info("v2", second)).await.unwrap();

        assert_eq!(repository.len(), 1);
        let stored = repository.get("https://careers.example.com/jobs/1").unwrap();
        assert_eq!(stored.raw_text, "v2");
        assert_eq!(stored.created_at, first);
        assert_eq!(stored.updated_at, second);
    }

    #[tokio::test]
    async fn test_pg_repository_requires_connect() {
        let repository = PgRecruitInfoRepository::new("postgres://localhost/ingest", 1);

        assert!(matches!(
            repository.persist(&recruit_info("v1", Utc::now())).await,
            Err(PersistError::NotConnected)
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres at DATABASE_URL"]
    async fn test_pg_repository_upserts_on_url(db: PgPool) {
        let repository = PgRecruitInfoRepository::new_from_pool(db.clone());
        let first = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap();

        repository.connect().await.unwrap();
        repository.persist(&recruit_info("v1", first)).await.unwrap();
        repository.persist(&recruit_info("v2", second)).await.unwrap();

        let (count, raw_text, created_at): (i64, String, DateTime<Utc>) = sqlx::query_as(
            "SELECT COUNT(*) OVER (), raw_text, created_at FROM recruit_info WHERE url = $1",
        )
        .bind("https://careers.example.com/jobs/1")
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(raw_text, "v2");
        assert_eq!(created_at, first);
    }
}
