//! Webhook notification receiver.
//!
//! The provider pushes change notifications as POSTs with the metadata in
//! `X-Goog-*` headers. Delivery is fire-and-forget: the provider only wants
//! a prompt 2xx, so the handler validates, consults the dedup watermark and
//! hands admitted work to the reconciliation pipeline without waiting on it.
//! Processing failures are retried internally, never by making the provider
//! resend.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use livesync_core::{LiveSyncError, NotificationEvent, ResourceState};
use tracing::{debug, info, warn};

use crate::state::AppState;

const CHANNEL_ID_HEADER: &str = "X-Goog-Channel-ID";
const RESOURCE_ID_HEADER: &str = "X-Goog-Resource-ID";
const RESOURCE_STATE_HEADER: &str = "X-Goog-Resource-State";
const MESSAGE_NUMBER_HEADER: &str = "X-Goog-Message-Number";
const RESOURCE_URI_HEADER: &str = "X-Goog-Resource-URI";
const CHANNEL_TOKEN_HEADER: &str = "X-Goog-Channel-Token";

pub fn router(state: AppState) -> Router {
    // axum answers 405 itself for non-POST methods on the route.
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

fn required<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, LiveSyncError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LiveSyncError::Validation(format!("missing header {name}")))
}

fn parse_notification(headers: &HeaderMap) -> Result<NotificationEvent, LiveSyncError> {
    let channel_id = required(headers, CHANNEL_ID_HEADER)?;
    let resource_id = required(headers, RESOURCE_ID_HEADER)?;
    let state_raw = required(headers, RESOURCE_STATE_HEADER)?;
    let message_raw = required(headers, MESSAGE_NUMBER_HEADER)?;
    let resource_uri = required(headers, RESOURCE_URI_HEADER)?;

    let resource_state = ResourceState::parse(state_raw).ok_or_else(|| {
        LiveSyncError::Validation(format!("unknown resource state '{state_raw}'"))
    })?;
    let message_number: u64 = message_raw.parse().map_err(|_| {
        LiveSyncError::Validation(format!("bad message number '{message_raw}'"))
    })?;

    Ok(NotificationEvent {
        channel_id: channel_id.to_string(),
        resource_id: resource_id.to_string(),
        resource_state,
        message_number,
        resource_uri: resource_uri.to_string(),
    })
}

/// POST /webhook - provider push notifications.
///
/// Responds 2xx for every well-formed request, including unknown channels
/// and duplicates: the provider cannot fix those by resending, and a non-2xx
/// would only cause a retry storm. Malformed requests get a 400 and are not
/// retried internally either, since the provider considers them delivered.
async fn handle_webhook(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let notification = match parse_notification(&headers) {
        Ok(notification) => notification,
        Err(err) => {
            warn!("rejected notification: {err}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let channel = match state.store.get(&notification.channel_id) {
        Ok(channel) => channel,
        Err(_) => {
            // Not necessarily a provider bug: pushes keep arriving during the
            // post-deletion grace window. Acknowledge so it stops resending.
            warn!(
                channel = %notification.channel_id,
                "notification for unknown channel, acknowledging anyway"
            );
            return StatusCode::OK;
        }
    };

    if let Some(expected) = &channel.verification_token {
        let presented = headers
            .get(CHANNEL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(
                channel = %channel.id,
                "verification token mismatch, ignoring notification"
            );
            return StatusCode::OK;
        }
    }

    if notification.resource_state == ResourceState::Sync {
        // Handshake sent once after channel creation: acknowledge only.
        info!(channel = %channel.id, "sync handshake received");
        return StatusCode::OK;
    }

    // Admission and trigger are not one atomic step: two concurrent
    // deliveries of the same number can both pass admit and both trigger.
    // The pipeline coalesces them into one idempotent run, and the
    // forward-only commit keeps the watermark from moving backwards.
    if !state
        .watermarks
        .admit(&notification.channel_id, notification.message_number)
    {
        debug!(
            channel = %channel.id,
            message_number = notification.message_number,
            "duplicate or stale message, ignoring"
        );
        return StatusCode::OK;
    }

    debug!(
        channel = %channel.id,
        resource = %notification.resource_id,
        state = ?notification.resource_state,
        message_number = notification.message_number,
        uri = %notification.resource_uri,
        "notification admitted"
    );

    // Hand off and acknowledge immediately; reconciliation latency must
    // never delay the response.
    state
        .reconciler
        .trigger(&notification.channel_id, notification.message_number);
    StatusCode::OK
}
