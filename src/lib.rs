//! syndic — an RSS feed ingester.
//!
//! Polls registered feeds on individually tracked schedules, parses
//! responses into channel/item records, detects new or changed items, and
//! persists everything to a shared key-value store while notifying a
//! listener. Front-ends consume the [`FeedServer`] surface: `register`,
//! `feed_info`, `on_item`, `refresh_interval`, `stop`.

pub mod config;
pub mod diff;
pub mod feed;
pub mod server;
pub mod store;

pub use config::{Config, ConfigError};
pub use diff::{diff, Descriptor, Diff};
pub use feed::{FetchError, FetchedFeed, ParseError, ParsedFeed};
pub use server::{FeedRecord, FeedServer, ItemEvent, ServerError};
pub use store::{FeedId, MemoryStore, RedisStore, Store, StoreError};
