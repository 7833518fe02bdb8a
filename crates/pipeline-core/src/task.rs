use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of fetch work: a single paginated request against one blog.
///
/// Tasks are JSON-encoded members of the import queue. `last_crawl` carries a
/// stringified epoch (or `"0"` for never-crawled blogs); it is the threshold
/// below which fetched posts are considered already archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub name: String,
    pub offset: u64,
    pub last_crawl: String,
}

impl ImportTask {
    pub fn new(name: impl Into<String>, offset: u64, last_crawl: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            offset,
            last_crawl: last_crawl
                .map(|t| t.timestamp().to_string())
                .unwrap_or_else(|| "0".to_string()),
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("encode import task")
    }

    /// Decode a queue payload. Returns `None` for anything a fetcher cannot
    /// act on: invalid JSON, or a `last_crawl` that does not parse as an
    /// epoch. Such payloads are dropped; tasks are re-derivable from the
    /// catalogue.
    pub fn decode(raw: &str) -> Option<Self> {
        let task: Self = serde_json::from_str(raw).ok()?;
        task.last_crawl_epoch()?;
        Some(task)
    }

    pub fn last_crawl_epoch(&self) -> Option<f64> {
        self.last_crawl.parse::<f64>().ok()
    }
}

/// A task popped from the import queue together with the broker-side epoch at
/// which the pop happened. The composite `"<epoch>;<payload>"` entry lives in
/// the working set until the task completes or the reaper reclaims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub epoch: i64,
    pub payload: String,
}

impl Lease {
    pub fn entry(&self) -> String {
        format!("{};{}", self.epoch, self.payload)
    }

    /// Split a working-set entry back into `(epoch, payload)`. The payload may
    /// itself contain `';'`, so only the first separator counts.
    pub fn split_entry(entry: &str) -> Option<(i64, &str)> {
        let (epoch, payload) = entry.split_once(';')?;
        Some((epoch.parse::<i64>().ok()?, payload))
    }
}

/// Result of processing one leased task.
///
/// The worker loop dispatches on this: `Completed` and `Abandoned` release the
/// lease (only `Completed` counts toward work stats), `Retry` sleeps and
/// re-processes in-line while the lease is still held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { fetched: u64, staged: u64 },
    Abandoned,
    Retry,
}
