//! Parser worker: drains the staging queues into the catalogue.

use crate::{is_retryable, BatchSummary, Ingest, StagingKind};
use anyhow::Context;
use pipeline_core::{Broker, BrokerKeys};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Records popped and submitted per batch.
    pub batch_size: usize,
    /// Sleep when both staging queues are empty.
    pub poll_interval: Duration,
    /// Sleep between replays of a batch that failed retryably.
    pub retry_delay: Duration,
    /// Replays before a retryable failure is escalated.
    pub max_retries: u32,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

pub struct Parser {
    cfg: ParserConfig,
    broker: Arc<dyn Broker>,
    keys: BrokerKeys,
    ingest: Ingest,
}

impl Parser {
    pub fn new(cfg: ParserConfig, broker: Arc<dyn Broker>, keys: BrokerKeys, ingest: Ingest) -> Self {
        Self {
            cfg,
            broker,
            keys,
            ingest,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let blog_count = self
                .broker
                .scard(&self.keys.blogs_staging())
                .await
                .context("read blogs staging depth")?;
            let post_count = self
                .broker
                .scard(&self.keys.posts_staging())
                .await
                .context("read posts staging depth")?;

            if blog_count + post_count == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            tracing::info!(
                event = "parser.depths",
                posts = post_count,
                blogs = blog_count,
                "staging queues non-empty"
            );

            if blog_count > 0 {
                self.drain(StagingKind::Blogs).await?;
            }
            if post_count > 0 {
                self.drain(StagingKind::Posts).await?;
            }
        }
    }

    /// Drain one staging queue to empty, batch by batch.
    pub async fn drain(&self, kind: StagingKind) -> anyhow::Result<u64> {
        let key = kind.queue_key(&self.keys);
        let start = Instant::now();
        let mut total = 0u64;

        loop {
            let batch = self
                .broker
                .spop(&key, self.cfg.batch_size)
                .await
                .with_context(|| format!("pop staging batch from {key}"))?;
            if batch.is_empty() {
                break;
            }

            let batch_start = Instant::now();
            let summary = match self.submit(kind, &batch).await {
                Ok(summary) => summary,
                Err(err) => {
                    // The batch is already popped; put it back so a restart
                    // can retry it instead of losing the records.
                    for raw in &batch {
                        let _ = self.broker.sadd(&key, raw).await;
                    }
                    return Err(err);
                }
            };
            total += summary.submitted as u64;

            tracing::info!(
                event = "parser.batch",
                kind = kind.as_str(),
                submitted = summary.submitted,
                discarded = summary.discarded,
                fast_path = summary.fast_path,
                elapsed_ms = batch_start.elapsed().as_millis() as u64,
                "batch committed"
            );
        }

        tracing::info!(
            event = "parser.drain",
            kind = kind.as_str(),
            total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "staging queue drained"
        );
        Ok(total)
    }

    async fn submit(&self, kind: StagingKind, batch: &[String]) -> anyhow::Result<BatchSummary> {
        let mut attempt = 0;
        loop {
            match self.ingest.ingest_batch(kind, batch).await {
                Ok(summary) => return Ok(summary),
                Err(err) if is_retryable(&err) && attempt < self.cfg.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        event = "parser.batch.retry",
                        kind = kind.as_str(),
                        attempt,
                        error = %err,
                        "retryable relational error; re-running batch"
                    );
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
