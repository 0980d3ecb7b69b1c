//! Google Calendar push API client.
//!
//! Implements the provider seam over the events `watch` / `channels/stop` /
//! incremental `events?syncToken=` surface. Status classes map onto the
//! retry taxonomy: transport errors and 5xx are transient, 410 Gone on a
//! listing is the stale-token signal, remaining 4xx are permanent.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use livesync_core::{
    CalendarProvider, ChangeRecord, ChangeSet, ProviderError, ResourceSelector, WatchRegistration,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

#[derive(Deserialize)]
struct WatchResponse {
    #[serde(rename = "resourceId")]
    resource_id: String,
    /// Milliseconds since the epoch, as a string.
    expiration: Option<String>,
}

#[derive(Deserialize)]
struct EventsPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

impl GoogleCalendarClient {
    pub fn new(base_url: String, bearer_token: Option<String>) -> Self {
        GoogleCalendarClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = response.map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::GONE {
            Err(ProviderError::TokenInvalid)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ProviderError::Transient(format!("{status}: {body}")))
        } else {
            Err(ProviderError::Permanent(format!("{status}: {body}")))
        }
    }

    fn parse_expiration(expiration: Option<&str>) -> Result<DateTime<Utc>, ProviderError> {
        let millis: i64 = expiration
            .and_then(|e| e.parse().ok())
            .ok_or_else(|| ProviderError::Permanent("watch response missing expiration".into()))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| ProviderError::Permanent("watch expiration out of range".into()))
    }

    fn records_from(items: Vec<serde_json::Value>, records: &mut Vec<ChangeRecord>) {
        for item in items {
            let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
                warn!("change record without id, skipping");
                continue;
            };
            // Cancelled events are the provider's deletion marker.
            let deleted = item.get("status").and_then(|v| v.as_str()) == Some("cancelled");
            records.push(ChangeRecord {
                event_id: id.to_string(),
                deleted,
                data: item,
            });
        }
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn register_watch(
        &self,
        selector: &ResourceSelector,
        channel_id: &str,
        callback_address: &str,
        verification_token: Option<&str>,
    ) -> Result<WatchRegistration, ProviderError> {
        let url = format!(
            "{}/calendars/{}/events/watch",
            self.base_url,
            selector.as_str()
        );
        let mut body = json!({
            "id": channel_id,
            "type": "web_hook",
            "address": callback_address,
        });
        if let Some(token) = verification_token {
            body["token"] = json!(token);
        }

        let response = self
            .check(self.request(self.http.post(&url)).json(&body).send().await)
            .await?;
        let watch: WatchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad watch response: {e}")))?;

        Ok(WatchRegistration {
            resource_id: watch.resource_id,
            expires_at: Self::parse_expiration(watch.expiration.as_deref())?,
        })
    }

    async fn stop_watch(&self, channel_id: &str, resource_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/channels/stop", self.base_url);
        let body = json!({ "id": channel_id, "resourceId": resource_id });
        self.check(self.request(self.http.post(&url)).json(&body).send().await)
            .await?;
        Ok(())
    }

    async fn list_changes(
        &self,
        resource_id: &str,
        sync_token: Option<&str>,
    ) -> Result<ChangeSet, ProviderError> {
        let url = format!("{}/calendars/{}/events", self.base_url, resource_id);
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> = Vec::new();
            if let Some(token) = sync_token {
                query.push(("syncToken", token));
            } else {
                // Full listing: deletions matter even without a cursor so
                // resync can reconcile them away.
                query.push(("showDeleted", "true"));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.as_str()));
            }

            let response = self
                .check(self.request(self.http.get(&url)).query(&query).send().await)
                .await?;
            let page: EventsPage = response
                .json()
                .await
                .map_err(|e| ProviderError::Transient(format!("bad events page: {e}")))?;

            Self::records_from(page.items, &mut records);

            if let Some(next) = page.next_sync_token {
                return Ok(ChangeSet {
                    records,
                    next_sync_token: next,
                });
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    return Err(ProviderError::Transient(
                        "listing ended without a sync token".into(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expiration_millis() {
        let at = GoogleCalendarClient::parse_expiration(Some("1735689600000")).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_expiration_missing() {
        let err = GoogleCalendarClient::parse_expiration(None).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[test]
    fn test_cancelled_status_is_deletion() {
        let mut records = Vec::new();
        GoogleCalendarClient::records_from(
            vec![
                json!({ "id": "a", "status": "confirmed" }),
                json!({ "id": "b", "status": "cancelled" }),
                json!({ "status": "confirmed" }),
            ],
            &mut records,
        );
        assert_eq!(records.len(), 2);
        assert!(!records[0].deleted);
        assert!(records[1].deleted);
    }
}
