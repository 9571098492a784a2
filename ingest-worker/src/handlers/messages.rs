use axum::{extract::State, http::StatusCode, Json};
use ingest_common::channel::ChannelError;
use ingest_common::payload::RawContent;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::app::AppState;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MessagePostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn post_message(
    State(state): State<AppState>,
    Json(raw): Json<RawContent>,
) -> Result<Json<MessagePostResponse>, (StatusCode, Json<MessagePostResponse>)> {
    debug!(url = %raw.url, "received raw content");

    let payload = raw
        .to_payload()
        .map_err(|error| failure(StatusCode::INTERNAL_SERVER_ERROR, error))?;

    state
        .producer
        .publish(&payload)
        .await
        .map_err(|error| match error {
            ChannelError::NotConnected(_) | ChannelError::Closed(_) => {
                failure(StatusCode::SERVICE_UNAVAILABLE, error)
            }
            ChannelError::Broker(_) => failure(StatusCode::INTERNAL_SERVER_ERROR, error),
        })?;

    let labels = [("queue", state.producer.queue().to_owned())];
    metrics::counter!("ingest_messages_published_total", &labels).increment(1);

    Ok(Json(MessagePostResponse { error: None }))
}

fn failure<E: std::fmt::Display>(
    status: StatusCode,
    error: E,
) -> (StatusCode, Json<MessagePostResponse>) {
    error!("failed to publish raw content: {}", error);

    (
        status,
        Json(MessagePostResponse {
            error: Some(error.to_string()),
        }),
    )
}
