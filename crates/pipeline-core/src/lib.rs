//! Shared core for the blog crawling pipeline.
//!
//! This crate defines the contracts shared by every worker kind: the queue
//! broker adapter, the rate-limited remote API client, and the import-task /
//! lease wire formats.
//!
//! # API notes
//! `pipeline-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`chrono::DateTime<Utc>`, `serde_json::Value`)
//! as part of the pipeline contract.

pub mod broker;
pub mod task;
pub mod tumblr;

pub use broker::{Broker, BrokerKeys, MemoryBroker, RedisBroker};
pub use task::{ImportTask, Lease, Outcome};
pub use tumblr::{ApiEnvelope, ApiMeta, TumblrApi, TumblrClient};
