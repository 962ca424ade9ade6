//! HTTP delivery handler
//!
//! `POST /deliver?from=<sender>&to0=<rcpt>&to1=...` with the raw message as
//! the request body. Each recipient is status-checked like RCPT TO, then the
//! accepted ones are delivered in one transaction.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    Json,
};
use postbox_core::lmtp::ReplyContext;
use postbox_core::{Address, Envelope, Reply};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::state::AppState;

/// Highest number of `to{i}` parameters read from one request
pub const MAX_RECIPIENTS: usize = 100;

pub const REPLY_HEADER_PREFIX: &str = "x-postbox-reply-";
pub const DELIVERED_HEADER: &str = "x-postbox-delivered";
pub const PROCESSED_HEADER: &str = "x-postbox-processed";

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "validation_error".to_string(),
            message: message.to_string(),
        }),
    )
}

/// Parse a bare address with the same grammar as MAIL FROM / RCPT TO
fn path(value: &str, delimiter: Option<char>) -> Option<Address> {
    let address = Address::parse(&format!("<{}>", value.trim()), &[], delimiter);
    address.is_valid().then_some(address)
}

/// Recipients from `to{i}` with their `folder{i}`/`flags{i}`/`tags{i}`
/// overrides. Reading stops at the first missing index.
fn recipients(
    params: &HashMap<String, String>,
    delimiter: Option<char>,
) -> Result<Vec<Address>, ApiError> {
    let mut out = Vec::new();
    for i in 0..MAX_RECIPIENTS {
        let Some(to) = params.get(&format!("to{}", i)) else {
            break;
        };
        let mut address = match path(to, delimiter) {
            Some(address) if !address.is_null() => address,
            _ => return Err(bad_request(&format!("Invalid recipient parameter 'to{}'", i))),
        };

        let folder = params.get(&format!("folder{}", i)).cloned();
        let flags = params.get(&format!("flags{}", i)).cloned();
        let tags = params.get(&format!("tags{}", i));
        if folder.is_some() || flags.is_some() || tags.is_some() {
            let tags = tags
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            address.set_filter_override(folder, flags, tags);
        }
        out.push(address);
    }
    Ok(out)
}

/// Deliver a posted message
///
/// POST /deliver
pub async fn deliver(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<(StatusCode, HeaderMap), ApiError> {
    let Some(from) = params.get("from") else {
        return Err(bad_request("Missing sender parameter 'from'"));
    };
    if !params.contains_key("to0") {
        return Err(bad_request("Missing recipient parameter 'to0'"));
    }
    // An empty sender is the null path
    let Some(sender) = path(from, None) else {
        return Err(bad_request("Invalid sender parameter 'from'"));
    };

    let config = state.coordinator.config().get();
    let ctx = ReplyContext {
        hostname: config.server.hostname.clone(),
        idle_timeout_secs: config.lmtp.idle_timeout_secs,
    };

    let mut envelope = Envelope::new();
    envelope.set_sender(sender, Some(body.len() as u64), None);

    let mut addresses = recipients(&params, config.lmtp.recipient_delimiter)?;
    let mut replies: Vec<Option<Reply>> = vec![None; addresses.len()];
    let mut accepted = Vec::new();
    for (i, mut address) in addresses.drain(..).enumerate() {
        let status = state.coordinator.status(&mut address).await;
        if status.success() {
            if envelope.add_recipient(address).is_ok() {
                accepted.push(i);
            }
        } else {
            replies[i] = Some(status);
        }
    }

    if !accepted.is_empty() {
        let delivered = state
            .coordinator
            .deliver(&mut envelope, body.to_vec())
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP delivery failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "internal_error".to_string(),
                        message: "Failed to stage message".to_string(),
                    }),
                )
            })?;
        for (&i, reply) in accepted.iter().zip(delivered) {
            replies[i] = Some(reply);
        }
    }

    let mut headers = HeaderMap::new();
    let mut successes = 0;
    for (i, reply) in replies.iter().enumerate() {
        let reply = reply.unwrap_or(Reply::TEMPORARY_FAILURE);
        if reply.success() {
            successes += 1;
        }
        let name = HeaderName::try_from(format!("{}{}", REPLY_HEADER_PREFIX, i));
        let value = HeaderValue::from_str(&reply.text(&ctx));
        match (name, value) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(index = i, "Failed to encode reply header"),
        }
    }
    headers.insert(DELIVERED_HEADER, HeaderValue::from(successes));
    headers.insert(PROCESSED_HEADER, HeaderValue::from(replies.len()));

    info!(
        sender = %from,
        recipients = replies.len(),
        delivered = successes,
        "HTTP delivery processed"
    );
    Ok((StatusCode::OK, headers))
}
