//! Upstream station API poller.
//!
//! Pulls cursor-paginated raw readings (`{"results": [...], "next_cursor": ..}`)
//! and feeds them to the engine as one batch per poll. Each poll resumes from
//! the page where the previous one stopped, unless that batch left readings
//! worth retrying.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::engine::AlertEngine;
use crate::models::RawReading;

// ---

/// One parsed page of the upstream response.
#[derive(Debug, Default, PartialEq)]
pub struct Page {
    // ---
    pub readings: Vec<RawReading>,
    pub skipped: usize,
    pub next_cursor: Option<String>,
}

/// Extract readings and the next cursor from a page body.
///
/// Items that do not deserialize are skipped and counted. Items without a
/// `reading_key` are keyed by their `observed_at`, so a page fetched twice
/// never stores a reading twice.
pub fn parse_page(body: &serde_json::Value) -> Page {
    // ---
    let mut page = Page::default();

    if let Some(items) = body.get("results").and_then(|d| d.as_array()) {
        for (i, item) in items.iter().enumerate() {
            match serde_json::from_value::<RawReading>(item.clone()) {
                Ok(mut reading) => {
                    if reading.reading_key.is_none() {
                        reading.reading_key = Some(reading.observed_at.to_rfc3339());
                    }
                    page.readings.push(reading);
                }
                Err(e) => {
                    page.skipped += 1;
                    tracing::debug!("Failed to parse item {}: {} - Raw item: {}", i, e, item);
                }
            }
        }
    } else {
        tracing::debug!("Response missing 'results' field or not an array");
    }

    page.next_cursor = body
        .get("next_cursor")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(String::from);
    page
}

/// Readings of one poll and the cursor the following poll starts from.
#[derive(Debug, Default, PartialEq)]
pub struct Fetched {
    // ---
    pub readings: Vec<RawReading>,
    pub resume_cursor: Option<String>,
}

pub struct StationApiSource {
    // ---
    client: reqwest::Client,
    base_url: String,
    max_pages: u32,
    /// Cursor of the page the next poll starts from.
    resume_cursor: Mutex<Option<String>>,
}

impl StationApiSource {
    // ---
    pub fn new(base_url: impl Into<String>, max_pages: u32) -> Self {
        // ---
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            max_pages,
            resume_cursor: Mutex::new(None),
        }
    }

    /// Fetch pages from the resume cursor on, bounded by `max_pages`.
    ///
    /// The returned cursor points at the last page fetched when the upstream
    /// had no next page, since it may still append to it.
    pub async fn fetch(&self) -> Result<Fetched> {
        // ---
        let mut all_data = Vec::new();
        let mut cursor = self.resume_from();
        let mut page_count = 0;

        loop {
            if page_count >= self.max_pages {
                tracing::debug!(
                    "Hit page limit of {}, stopping pagination. Fetched {} records so far.",
                    self.max_pages,
                    all_data.len()
                );
                break;
            }
            page_count += 1;

            let mut request = self.client.get(&self.base_url);
            if let Some(ref cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }

            tracing::debug!("Fetching page {} from: {}", page_count, self.base_url);
            let body: serde_json::Value = request.send().await?.error_for_status()?.json().await?;

            let page = parse_page(&body);
            tracing::debug!(
                "Page {} parsed {} readings, skipped {}",
                page_count,
                page.readings.len(),
                page.skipped
            );
            all_data.extend(page.readings);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(
            "Finished fetching {} total records from {} pages",
            all_data.len(),
            page_count
        );
        Ok(Fetched {
            readings: all_data,
            resume_cursor: cursor,
        })
    }

    pub fn advance_to(&self, cursor: Option<String>) {
        // ---
        *self
            .resume_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cursor;
    }

    pub fn resume_from(&self) -> Option<String> {
        // ---
        self.resume_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll every `interval` until `shutdown` fires.
    pub async fn run(
        self,
        engine: Arc<AlertEngine>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        // ---
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Station API poller stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let fetched = match self.fetch().await {
                Ok(fetched) => fetched,
                Err(e) => {
                    tracing::error!("Failed to fetch station readings: {}", e);
                    continue;
                }
            };
            if fetched.readings.is_empty() {
                self.advance_to(fetched.resume_cursor);
                continue;
            }

            let result = engine
                .ingest_batch_with_cancel(fetched.readings, shutdown.child_token())
                .await;
            let retryable = result.retryable().count();
            if result.rejected_count() > 0 {
                tracing::warn!(
                    batch_id = %result.batch_id,
                    rejected = result.rejected_count(),
                    retryable,
                    "Poll batch had rejections"
                );
            }
            if retryable == 0 {
                self.advance_to(fetched.resume_cursor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    type SeenCursors = Arc<Mutex<Vec<Option<String>>>>;

    /// Two-page upstream: no cursor -> page 1, `cursor=p2` -> last page.
    async fn upstream(
        State(seen): State<SeenCursors>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        // ---
        let cursor = query.get("cursor").cloned();
        seen.lock().unwrap().push(cursor.clone());
        match cursor.as_deref() {
            None => Json(json!({
                "results": [
                    {"parameter_id": 100, "raw_value": 1.0, "observed_at": "2025-03-26T18:45:00Z"}
                ],
                "next_cursor": "p2"
            })),
            Some(_) => Json(json!({
                "results": [
                    {"parameter_id": 100, "raw_value": 2.0, "observed_at": "2025-03-26T18:46:00Z"}
                ],
                "next_cursor": null
            })),
        }
    }

    async fn spawn_upstream() -> (String, SeenCursors) {
        // ---
        let seen = SeenCursors::default();
        let app = Router::new()
            .route("/readings", get(upstream))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/readings"), seen)
    }

    #[test]
    fn test_parse_page_with_cursor() {
        // ---
        let body = json!({
            "results": [
                {"parameter_id": 100, "raw_value": 21.5, "observed_at": "2025-03-26T18:45:00Z", "reading_key": "a"},
                {"parameter_id": 101, "raw_value": 40.0, "observed_at": "2025-03-26T18:46:00Z"}
            ],
            "next_cursor": "abc"
        });

        let page = parse_page(&body);
        assert_eq!(page.readings.len(), 2);
        assert_eq!(page.readings[0].reading_key.as_deref(), Some("a"));
        assert_eq!(
            page.readings[1].reading_key.as_deref(),
            Some("2025-03-26T18:46:00+00:00")
        );
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert_eq!(page.skipped, 0);
    }

    #[test]
    fn test_parse_page_skips_bad_items() {
        // ---
        let body = json!({
            "results": [
                {"parameter_id": "x", "raw_value": 1.0},
                {"parameter_id": 100, "raw_value": 1.0, "observed_at": "2025-03-26T18:45:00Z"}
            ],
            "next_cursor": null
        });

        let page = parse_page(&body);
        assert_eq!(page.readings.len(), 1);
        assert_eq!(page.skipped, 1);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_parse_page_without_results() {
        // ---
        let page = parse_page(&json!({"error": "maintenance", "next_cursor": ""}));
        assert_eq!(page, Page::default());
    }

    #[tokio::test]
    async fn test_fetch_resumes_from_last_page() {
        // ---
        let (url, seen) = spawn_upstream().await;
        let source = StationApiSource::new(url, 10);

        let first = source.fetch().await.unwrap();
        assert_eq!(first.readings.len(), 2);
        assert_eq!(first.resume_cursor.as_deref(), Some("p2"));

        // Not advanced yet: the next fetch starts over
        assert_eq!(source.resume_from(), None);
        source.advance_to(first.resume_cursor);

        let second = source.fetch().await.unwrap();
        assert_eq!(second.readings.len(), 1);
        assert_eq!(second.readings[0].raw_value, 2.0);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("p2".to_string()), Some("p2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_page_limit_resumes_at_next_page() {
        // ---
        let (url, seen) = spawn_upstream().await;
        let source = StationApiSource::new(url, 1);

        let first = source.fetch().await.unwrap();
        assert_eq!(first.readings.len(), 1);
        assert_eq!(first.resume_cursor.as_deref(), Some("p2"));

        source.advance_to(first.resume_cursor);
        assert_eq!(source.fetch().await.unwrap().readings[0].raw_value, 2.0);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
