use std::time;

use ingest_common::broker::BrokerError;
use ingest_common::channel::ChannelError;
use thiserror::Error;

/// Enumeration of errors for a single extraction attempt.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extraction request timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("extraction request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("extraction service responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("extraction service returned no content")]
    EmptyResponse,
    #[error("failed to decode extracted posting: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Enumeration of errors for parsing raw content into a posting, across all attempts.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("parsing failed after {attempts} attempts, last error: {source}")]
    Exhausted { attempts: u32, source: ExtractError },
}

/// Enumeration of errors for operations with a `Repository`.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("repository is not connected, call connect() first")]
    NotConnected,
}

/// Enumeration of errors related to running the pipeline and processing its messages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline channel error: {0}")]
    Connection(#[from] ChannelError),
    #[error("message payload is not valid raw content: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Enumeration of errors related to initialization of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("no extraction api keys configured")]
    NoApiKeys,
    #[error("failed to build extraction client: {0}")]
    ClientError(#[from] reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    BrokerError(#[from] BrokerError),
    #[error(transparent)]
    ChannelError(#[from] ChannelError),
    #[error(transparent)]
    PersistError(#[from] PersistError),
    #[error(transparent)]
    PipelineError(#[from] PipelineError),
}
