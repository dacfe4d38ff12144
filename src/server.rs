//! Feed scheduler and orchestrator.
//!
//! [`FeedServer`] owns the persistent schedule and drives everything around
//! it: registration, timer-driven refresh, conditional fetches, backoff on
//! failure, and item upsert with change notifications. All state lives in
//! the injected [`Store`]; the server itself holds only the timer, the
//! listener, and an in-flight guard, so independent servers can coexist
//! (one per test, or several processes sharing one store).
//!
//! Failure policy follows the store schema: no error here is fatal. A write
//! that fails is logged and abandoned; the next scheduled pass retries the
//! whole feed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::diff::{diff, Descriptor, Diff};
use crate::feed::fetcher::{self, FetchOutcome, FetchedFeed};
use crate::store::{
    feed_delay_key, feed_items_key, feed_key, feed_url_key, item_feeds_key, item_key, BatchOp,
    FeedId, Store, StoreError, NEXT_ID_KEY, SCHEDULE_KEY,
};

/// Default polling cadence of the refresh timer.
const DEFAULT_REFRESH_SECS: u64 = 60;

/// Policy floor for rescheduling after a successful fetch.
const MIN_EXPIRY_MS: i64 = 5 * 60 * 1000;

/// First backoff delay after a failure; consecutive failures double it.
const BASE_BACKOFF_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The store held something that does not parse as a feed id.
    #[error("malformed feed id: {0}")]
    BadFeedId(String),
}

/// Persistent per-feed metadata, stored as JSON at `feed:<id>`.
///
/// A healthy record carries no backoff information; the current delay lives
/// under its own key and is zeroed by every successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub channel: Map<String, Value>,
    /// Last successful fetch (epoch ms, 0 = never).
    #[serde(default)]
    pub last_read: i64,
    /// Next allowed re-fetch (epoch ms).
    #[serde(default)]
    pub expires: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl FeedRecord {
    /// Minimal record seeded when a feed fails before its first success, so
    /// the scheduled retry still knows the URL.
    fn stub(url: &str) -> Self {
        Self {
            url: url.to_string(),
            version: None,
            channel: Map::new(),
            last_read: 0,
            expires: 0,
            etag: None,
        }
    }
}

/// Notification fired on every item creation or update.
#[derive(Debug, Clone)]
pub struct ItemEvent {
    pub item: Map<String, Value>,
    /// Every feed currently containing the item, read at notification time.
    pub feed_ids: Vec<FeedId>,
    pub is_new: bool,
    /// Change descriptor for updates; `None` for new items.
    pub diff: Option<Descriptor>,
}

type ItemListener = Arc<dyn Fn(ItemEvent) + Send + Sync>;

/// The orchestrator. Construction arms the refresh timer; [`stop`] disarms
/// it. Dropping the server stops the timer as well.
///
/// [`stop`]: FeedServer::stop
pub struct FeedServer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    interval_secs: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<ItemListener>>,
    /// Feed ids with a fetch outstanding. Suppresses overlapping fetches for
    /// the same feed when a registration races the scheduled refresh.
    in_flight: Mutex<HashSet<FeedId>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl FeedServer {
    /// Create a server over `store` and arm the refresh timer. Must be
    /// called within a tokio runtime.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_client(store, reqwest::Client::new())
    }

    /// Like [`new`](FeedServer::new) with a caller-configured HTTP client
    /// (timeouts, user agent).
    pub fn with_client(store: Arc<dyn Store>, client: reqwest::Client) -> Self {
        let server = Self {
            inner: Arc::new(Inner {
                store,
                client,
                interval_secs: AtomicU64::new(DEFAULT_REFRESH_SECS),
                timer: Mutex::new(None),
                listener: Mutex::new(None),
                in_flight: Mutex::new(HashSet::new()),
            }),
        };
        server.start();
        server
    }

    /// Idempotently map `url` to a feed id, then trigger a conditional
    /// refresh check in the background.
    pub async fn register(&self, url: &str) -> Result<FeedId, ServerError> {
        let url_key = feed_url_key(url);
        let id = match self.inner.store.get(&url_key).await? {
            Some(existing) => existing
                .parse::<FeedId>()
                .map_err(|_| ServerError::BadFeedId(existing))?,
            None => {
                let id = self.inner.store.incr(NEXT_ID_KEY).await? as FeedId;
                self.inner.store.set(&url_key, &id.to_string()).await?;
                tracing::info!(feed_id = id, url = %url, "registered feed");
                id
            }
        };

        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        tokio::spawn(async move {
            inner.maybe_update_feed(id, &url).await;
        });
        Ok(id)
    }

    /// Current metadata for a feed, if it has ever been fetched or seeded.
    pub async fn feed_info(&self, id: FeedId) -> Result<Option<FeedRecord>, ServerError> {
        self.inner.feed_record(id).await
    }

    /// Install the single global item listener, replacing any previous one.
    pub fn on_item<F>(&self, listener: F)
    where
        F: Fn(ItemEvent) + Send + Sync + 'static,
    {
        *self.inner.listener.lock().expect("listener lock poisoned") = Some(Arc::new(listener));
    }

    /// Polling cadence in seconds.
    pub fn refresh_interval(&self) -> u64 {
        self.inner.interval_secs.load(Ordering::Relaxed)
    }

    /// Change the polling cadence. Shrinking it restarts the timer so the
    /// shorter interval applies immediately; growing it takes effect on the
    /// next natural tick.
    pub fn set_refresh_interval(&self, secs: u64) {
        let secs = secs.max(1);
        let previous = self.inner.interval_secs.swap(secs, Ordering::Relaxed);
        if secs < previous {
            self.stop();
            self.start();
        }
    }

    /// Arm the refresh timer, replacing a running one.
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock().expect("timer lock poisoned");
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            loop {
                let secs = inner.interval_secs.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                inner.refresh_due().await;
            }
        }));
    }

    /// Cancel the pending refresh timer. Idempotent; in-flight fetches are
    /// not affected.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    async fn feed_record(&self, id: FeedId) -> Result<Option<FeedRecord>, ServerError> {
        match self.store.get(&feed_key(id)).await? {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    /// Fetch `id` unless its record says it has not expired yet.
    async fn maybe_update_feed(self: Arc<Self>, id: FeedId, url: &str) {
        let record = match self.feed_record(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(feed_id = id, error = %e, "could not read feed record");
                return;
            }
        };

        match record {
            Some(record) if record.expires > now_ms() => {
                tracing::debug!(feed_id = id, expires = record.expires, "feed not due yet");
            }
            Some(record) => self.read_feed(id, url, record.etag).await,
            None => self.read_feed(id, url, None).await,
        }
    }

    /// Kick off every feed whose scheduled time has elapsed. Each fetch runs
    /// independently; the timer never waits on them.
    async fn refresh_due(self: &Arc<Self>) {
        let now = now_ms();
        let due = match self.store.zrangebyscore(SCHEDULE_KEY, 0, now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "could not query schedule");
                return;
            }
        };
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "refreshing due feeds");
        }

        for member in due {
            let Ok(id) = member.parse::<FeedId>() else {
                tracing::warn!(member = %member, "ignoring malformed schedule entry");
                continue;
            };
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.refresh_feed(id).await;
            });
        }
    }

    async fn refresh_feed(self: Arc<Self>, id: FeedId) {
        match self.feed_record(id).await {
            Ok(Some(record)) => {
                let url = record.url.clone();
                self.read_feed(id, &url, record.etag).await;
            }
            Ok(None) => tracing::warn!(feed_id = id, "scheduled feed has no record"),
            Err(e) => tracing::warn!(feed_id = id, error = %e, "could not read feed record"),
        }
    }

    /// One fetch attempt: success persists and upserts, failure backs off.
    async fn read_feed(self: Arc<Self>, id: FeedId, url: &str, etag: Option<String>) {
        if !self.begin_fetch(id) {
            tracing::debug!(feed_id = id, "fetch already in flight, skipping");
            return;
        }
        tracing::debug!(feed_id = id, url = %url, "fetching feed");

        match fetcher::fetch(&self.client, url, etag.as_deref()).await {
            Ok(FetchOutcome::Fresh(feed)) => {
                if let Err(e) = self.update_feed(id, url, *feed).await {
                    tracing::warn!(feed_id = id, error = %e, "feed update abandoned");
                }
            }
            Ok(FetchOutcome::Failed(status)) => {
                tracing::warn!(feed_id = id, url = %url, status, "feed fetch failed");
                self.delay_feed(id, url).await;
            }
            Err(e) => {
                tracing::warn!(feed_id = id, url = %url, error = %e, "feed fetch failed");
                self.delay_feed(id, url).await;
            }
        }

        self.end_fetch(id);
    }

    /// Persist a fresh fetch: feed record, schedule slot at the clamped
    /// expiry, and backoff reset land as one unit, then items are upserted.
    async fn update_feed(
        &self,
        id: FeedId,
        url: &str,
        feed: FetchedFeed,
    ) -> Result<(), ServerError> {
        let FetchedFeed {
            version,
            channel,
            items,
            last_read,
            expires,
            etag,
        } = feed;

        let expires = expires.max(now_ms() + MIN_EXPIRY_MS);
        let record = FeedRecord {
            url: url.to_string(),
            version,
            channel,
            last_read,
            expires,
            etag,
        };

        self.store
            .batch(vec![
                BatchOp::Set {
                    key: feed_key(id),
                    value: serde_json::to_string(&record)?,
                },
                BatchOp::Zadd {
                    key: SCHEDULE_KEY.to_string(),
                    score: expires,
                    member: id.to_string(),
                },
                BatchOp::Set {
                    key: feed_delay_key(id),
                    value: "0".to_string(),
                },
            ])
            .await?;
        tracing::info!(feed_id = id, items = items.len(), expires, "feed updated");

        for item in items {
            self.update_item(item, id).await;
        }
        Ok(())
    }

    /// Reschedule after a failure: double the recorded delay (or start at
    /// the 5-minute base) and write delay + schedule slot atomically.
    async fn delay_feed(&self, id: FeedId, url: &str) {
        if let Err(e) = self.try_delay_feed(id, url).await {
            tracing::warn!(feed_id = id, error = %e, "backoff update abandoned");
        }
    }

    async fn try_delay_feed(&self, id: FeedId, url: &str) -> Result<(), ServerError> {
        let delay_key = feed_delay_key(id);
        let previous = self
            .store
            .get(&delay_key)
            .await?
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|delay| *delay > 0);
        let delay = previous.map(|d| d * 2).unwrap_or(BASE_BACKOFF_MS);
        let next = now_ms() + delay;

        let mut ops = vec![
            BatchOp::Set {
                key: delay_key,
                value: delay.to_string(),
            },
            BatchOp::Zadd {
                key: SCHEDULE_KEY.to_string(),
                score: next,
                member: id.to_string(),
            },
        ];
        // A feed that has never succeeded has no record yet; seed one so the
        // scheduled retry knows the URL.
        if self.feed_record(id).await?.is_none() {
            ops.push(BatchOp::Set {
                key: feed_key(id),
                value: serde_json::to_string(&FeedRecord::stub(url))?,
            });
        }

        self.store.batch(ops).await?;
        tracing::info!(feed_id = id, delay_ms = delay, "rescheduled with backoff");
        Ok(())
    }

    /// Upsert one parsed item for `feed_id`, firing the listener when the
    /// item is new or changed.
    async fn update_item(&self, item: Map<String, Value>, feed_id: FeedId) {
        let Some(guid) = item.get("guid").and_then(Value::as_str).map(String::from) else {
            tracing::warn!(
                feed_id,
                title = item.get("title").and_then(serde_json::Value::as_str).unwrap_or(""),
                "item without guid skipped"
            );
            return;
        };
        if let Err(e) = self.upsert_item(&guid, item, feed_id).await {
            tracing::warn!(feed_id, guid = %guid, error = %e, "item upsert abandoned");
        }
    }

    async fn upsert_item(
        &self,
        guid: &str,
        item: Map<String, Value>,
        feed_id: FeedId,
    ) -> Result<(), ServerError> {
        let item_key = item_key(guid);
        let date = item.get("date").and_then(Value::as_i64).unwrap_or_else(now_ms);

        // Membership first, then read-and-replace the canonical record.
        self.store
            .sadd(&item_feeds_key(guid), &feed_id.to_string())
            .await?;
        let new_value = Value::Object(item);
        let old = self
            .store
            .getset(&item_key, &serde_json::to_string(&new_value)?)
            .await?;

        match old {
            None => {
                self.store
                    .zadd(&feed_items_key(feed_id), date, &item_key)
                    .await?;
                tracing::info!(guid = %guid, feed_id, "new item");
                self.notify(guid, new_value, true, None).await;
            }
            Some(old_json) => {
                let old_value: Value = serde_json::from_str(&old_json).unwrap_or_else(|e| {
                    tracing::warn!(guid = %guid, error = %e, "stored item was unreadable");
                    Value::Null
                });
                match diff(&old_value, &new_value) {
                    Diff::Equal => {}
                    changed => {
                        self.store
                            .zadd(&feed_items_key(feed_id), date, &item_key)
                            .await?;
                        tracing::info!(guid = %guid, feed_id, "item updated");
                        self.notify(guid, new_value, false, changed.into_descriptor())
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn notify(&self, guid: &str, item: Value, is_new: bool, descriptor: Option<Descriptor>) {
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .clone();
        let Some(listener) = listener else {
            return;
        };

        // Resolved at notification time so the event sees every feed sharing
        // the item, not just the one that triggered this upsert.
        let feed_ids = match self.store.smembers(&item_feeds_key(guid)).await {
            Ok(members) => {
                let mut ids: Vec<FeedId> = members.iter().filter_map(|m| m.parse().ok()).collect();
                ids.sort_unstable();
                ids
            }
            Err(e) => {
                tracing::warn!(guid = %guid, error = %e, "could not resolve item feed membership");
                Vec::new()
            }
        };

        let Value::Object(item) = item else {
            return;
        };
        listener(ItemEvent {
            item,
            feed_ids,
            is_new,
            diff: descriptor,
        });
    }

    fn begin_fetch(&self, id: FeedId) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(id)
    }

    fn end_fetch(&self, id: FeedId) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&id);
    }
}
