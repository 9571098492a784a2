//! # Pipeline
//!
//! Wires a `Consumer` to parse, validate and persist every message it delivers.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use chrono::Utc;
use ingest_common::channel::{
    message_handler, Consumer, ConsumerTag, MessageChannel, MessageHandler, Payload,
};
use ingest_common::payload::RawContent;
use ingest_common::retry::{RedeliveryPolicy, RetryPolicy};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::parser::Parse;
use crate::repository::{RecruitInfo, Repository};
use crate::validate::{RecruitInfoValidator, Validator};

/// What happened to a message that was processed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Persisted,
    Rejected,
}

/// Parse, validate and persist a single message. Any error leaves the message unacknowledged.
pub async fn process_message(
    payload: Payload,
    parser: &dyn Parse,
    validator: &dyn Validator,
    repository: &dyn Repository,
    retry_policy: &RetryPolicy,
) -> Result<Processed, PipelineError> {
    let start = time::Instant::now();
    let raw = RawContent::from_payload(payload)?;

    let posting = parser.parse(&raw, retry_policy).await?;

    let processed = if validator.is_acceptable(&posting) {
        let info = RecruitInfo::new(posting, raw, Utc::now());
        repository.persist(&info).await?;
        info!(url = %info.url, "recruit info persisted");
        Processed::Persisted
    } else {
        debug!(url = %raw.url, "content is not a usable job posting, skipped");
        Processed::Rejected
    };

    metrics::histogram!("ingest_message_processing_duration_seconds")
        .record(start.elapsed().as_secs_f64());
    Ok(processed)
}

/// Consumes raw content and turns it into persisted job postings.
pub struct JobPipeline {
    consumer: Arc<dyn Consumer>,
    parser: Arc<dyn Parse>,
    validator: Arc<dyn Validator>,
    repository: Arc<dyn Repository>,
    retry_policy: RetryPolicy,
    redelivery: RedeliveryPolicy,
    message_timeout: time::Duration,
    running: AtomicBool,
    tag: Mutex<Option<ConsumerTag>>,
}

impl JobPipeline {
    pub fn new(
        consumer: Arc<dyn Consumer>,
        parser: Arc<dyn Parse>,
        repository: Arc<dyn Repository>,
        retry_policy: RetryPolicy,
        message_timeout: time::Duration,
    ) -> Self {
        Self {
            consumer,
            parser,
            validator: Arc::new(RecruitInfoValidator),
            repository,
            retry_policy,
            redelivery: RedeliveryPolicy::unbounded(),
            message_timeout,
            running: AtomicBool::new(false),
            tag: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// The redelivery bound the consumer was built with, used to report the worst case.
    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    fn handler(&self) -> MessageHandler {
        let parser = self.parser.clone();
        let validator = self.validator.clone();
        let repository = self.repository.clone();
        let retry_policy = self.retry_policy.clone();

        message_handler(move |payload| {
            let parser = parser.clone();
            let validator = validator.clone();
            let repository = repository.clone();
            let retry_policy = retry_policy.clone();

            async move {
                process_message(
                    payload,
                    parser.as_ref(),
                    validator.as_ref(),
                    repository.as_ref(),
                    &retry_policy,
                )
                .await?;
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    /// Connect the consumer and the repository, then start handling messages.
    /// The pipeline only reports running once every step succeeded.
    pub async fn start(&self) -> Result<ConsumerTag, PipelineError> {
        if let Some(tag) = self.consumer_tag() {
            warn!(%tag, "pipeline is already running");
            return Ok(tag);
        }

        self.consumer.connect().await?;
        self.repository.connect().await?;

        let tag = self
            .consumer
            .handle_live_message(self.handler(), self.message_timeout)
            .await?;

        *self.tag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tag.clone());
        self.running.store(true, Ordering::SeqCst);

        match self.redelivery.worst_case_attempts(&self.retry_policy) {
            Some(attempts) => info!(
                queue = self.consumer.queue(),
                %tag,
                worst_case_attempts = attempts,
                "pipeline started"
            ),
            None => info!(
                queue = self.consumer.queue(),
                %tag,
                max_parse_attempts = self.retry_policy.max_attempts,
                "pipeline started, failing messages are redelivered without bound"
            ),
        }

        Ok(tag)
    }

    /// Stop consuming. The message in flight, if any, is allowed to finish.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let result = self.consumer.stop().await;

        self.tag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.running.store(false, Ordering::SeqCst);
        info!(queue = self.consumer.queue(), "pipeline stopped");

        result.map_err(PipelineError::from)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.tag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use ingest_common::memory::{InMemoryConsumer, InMemoryMessenger, InMemoryQueue};
    use serde_json::json;

    use super::*;
    use crate::error::{ExtractError, ParseError, PersistError};
    use crate::parser::ParsedPosting;
    use crate::repository::MemoryRepository;

    /// Fails the configured number of times per url, then succeeds. Urls containing "about" are
    /// not job postings.
    #[derive(Default)]
    struct ScriptedParser {
        failures: Mutex<HashMap<String, usize>>,
        calls: AtomicUsize,
    }

    impl ScriptedParser {
        fn failing(url: &str, times: usize) -> Self {
            let parser = Self::default();
            parser.failures.lock().unwrap().insert(url.to_owned(), times);
            parser
        }
    }

    #[async_trait]
    impl Parse for ScriptedParser {
        async fn parse(&self, raw: &RawContent, policy: &RetryPolicy) -> Result<ParsedPosting, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(left) = self.failures.lock().unwrap().get_mut(&raw.url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ParseError::Exhausted {
                        attempts: policy.max_attempts,
                        source: ExtractError::EmptyResponse,
                    });
                }
            }

            Ok(ParsedPosting {
                is_recruit_info: !raw.url.contains("about"),
                title: raw.title.clone(),
                company_name: Some("Example".to_owned()),
                job_description: Some(raw.text.clone()),
                job_type: "정규직".to_owned(),
                require_experience: "경력무관".to_owned(),
                apply_start_date: None,
                apply_end_date: None,
                region_text: None,
            })
        }
    }

    struct UnreachableRepository;

    #[async_trait]
    impl Repository for UnreachableRepository {
        async fn connect(&self) -> Result<(), PersistError> {
            Err(PersistError::NotConnected)
        }

        async fn persist(&self, _info: &RecruitInfo) -> Result<(), PersistError> {
            Err(PersistError::NotConnected)
        }
    }

    fn raw_content(url: &str) -> Payload {
        json!({
            "url": url,
            "title": "Backend Engineer",
            "text": "Example is hiring a backend engineer.",
        })
    }

    async fn publish(queue: &InMemoryQueue, payloads: &[Payload]) {
        let producer = InMemoryMessenger::new(queue);
        producer.connect().await.unwrap();
        for payload in payloads {
            producer.publish(payload).await.unwrap();
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(time::Duration::from_millis(100)).await;
        }
        panic!("condition was not met in time");
    }

    fn pipeline(
        queue: &InMemoryQueue,
        parser: Arc<dyn Parse>,
        repository: Arc<dyn Repository>,
        redelivery: RedeliveryPolicy,
    ) -> JobPipeline {
        let consumer = InMemoryConsumer::new(queue, time::Duration::from_millis(100))
            .with_redelivery(redelivery);

        JobPipeline::new(
            Arc::new(consumer),
            parser,
            repository,
            RetryPolicy::build(3, time::Duration::from_secs(2)).provide(),
            time::Duration::from_secs(300),
        )
        .with_redelivery(redelivery)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_persists_only_accepted_postings() {
        let queue = InMemoryQueue::new("raw-content");
        let repository = MemoryRepository::new();
        publish(
            &queue,
            &[
                raw_content("https://careers.example.com/jobs/1"),
                raw_content("https://careers.example.com/about"),
            ],
        )
        .await;

        let pipeline = pipeline(
            &queue,
            Arc::new(ScriptedParser::default()),
            Arc::new(repository.clone()),
            RedeliveryPolicy::unbounded(),
        );
        assert!(!pipeline.is_running());

        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());

        wait_until(|| queue.is_empty()).await;
        assert_eq!(repository.len(), 1);
        assert!(repository.get("https://careers.example.com/jobs/1").is_some());

        pipeline.stop().await.unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.consumer_tag(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_is_redelivered_until_persisted() {
        let queue = InMemoryQueue::new("raw-content");
        let repository = MemoryRepository::new();
        let parser = Arc::new(ScriptedParser::failing("https://careers.example.com/jobs/1", 2));
        publish(&queue, &[raw_content("https://careers.example.com/jobs/1")]).await;

        let pipeline = pipeline(
            &queue,
            parser.clone(),
            Arc::new(repository.clone()),
            RedeliveryPolicy::unbounded(),
        );
        pipeline.start().await.unwrap();

        wait_until(|| !repository.is_empty()).await;
        assert_eq!(parser.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());

        pipeline.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_is_dead_lettered() {
        let queue = InMemoryQueue::new("raw-content");
        let repository = MemoryRepository::new();
        let invalid = json!({ "url": "https://careers.example.com/jobs/1" });
        publish(&queue, &[invalid.clone()]).await;

        let pipeline = pipeline(
            &queue,
            Arc::new(ScriptedParser::default()),
            Arc::new(repository.clone()),
            RedeliveryPolicy::bounded(2),
        );
        pipeline.start().await.unwrap();

        wait_until(|| !queue.dead_letters().is_empty()).await;
        assert_eq!(queue.dead_letters(), vec![invalid]);
        assert!(queue.is_empty());
        assert!(repository.is_empty());

        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_repository_is_unreachable() {
        let queue = InMemoryQueue::new("raw-content");
        let pipeline = pipeline(
            &queue,
            Arc::new(ScriptedParser::default()),
            Arc::new(UnreachableRepository),
            RedeliveryPolicy::unbounded(),
        );

        let result = pipeline.start().await;

        assert!(matches!(result, Err(PipelineError::Persist(_))));
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.consumer_tag(), None);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_no_op() {
        let queue = InMemoryQueue::new("raw-content");
        let pipeline = pipeline(
            &queue,
            Arc::new(ScriptedParser::default()),
            Arc::new(MemoryRepository::new()),
            RedeliveryPolicy::unbounded(),
        );

        pipeline.stop().await.unwrap();
        pipeline.stop().await.unwrap();

        assert!(!pipeline.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_subscription() {
        let queue = InMemoryQueue::new("raw-content");
        let pipeline = pipeline(
            &queue,
            Arc::new(ScriptedParser::default()),
            Arc::new(MemoryRepository::new()),
            RedeliveryPolicy::unbounded(),
        );

        let first = pipeline.start().await.unwrap();
        let second = pipeline.start().await.unwrap();

        assert_eq!(first, second);
        assert!(pipeline.is_running());
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_message_rejects_invalid_payload() {
        let result = process_message(
            json!({ "title": "no url" }),
            &ScriptedParser::default(),
            &RecruitInfoValidator,
            &MemoryRepository::new(),
            &RetryPolicy::default(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Payload(_))));
    }
}
