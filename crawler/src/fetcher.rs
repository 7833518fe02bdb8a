//! Fetcher worker: leases import tasks, calls the remote API, and stages raw
//! posts for the parser.

use crate::config::{Config, Role};
use crate::constants::{
    BACKPRESSURE_DELAY, BAD_COUNTER_PINNED, FETCHER_RETRY_DELAY, IDLE_DELAY,
};
use crate::supervisor;
use anyhow::Context;
use pipeline_core::{
    Broker, BrokerKeys, ImportTask, Outcome, RedisBroker, TumblrApi, TumblrClient,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub worker_name: String,
    pub stage_high_water: u64,
    pub bad_threshold: u32,
    pub idle_delay: Duration,
    pub retry_delay: Duration,
    pub backpressure_delay: Duration,
}

impl FetcherConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_name: cfg.worker_name.clone(),
            stage_high_water: cfg.stage_high_water,
            bad_threshold: cfg.bad_threshold,
            idle_delay: IDLE_DELAY,
            retry_delay: FETCHER_RETRY_DELAY,
            backpressure_delay: BACKPRESSURE_DELAY,
        }
    }
}

pub struct Fetcher {
    broker: Arc<dyn Broker>,
    api: Arc<dyn TumblrApi>,
    keys: BrokerKeys,
    cfg: FetcherConfig,
    /// Stale-response counts per blog. Process-local and advisory; duplicate
    /// counting across workers only delays the done threshold.
    bad: HashMap<String, u32>,
}

impl Fetcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        api: Arc<dyn TumblrApi>,
        keys: BrokerKeys,
        cfg: FetcherConfig,
    ) -> Self {
        Self {
            broker,
            api,
            keys,
            cfg,
            bad: HashMap::new(),
        }
    }

    /// One loop iteration: lease a task (or idle), process it to a terminal
    /// outcome, release or keep the lease accordingly.
    ///
    /// Errors from this method are broker failures and fatal to the worker;
    /// failures while processing a task are logged and leave the lease for
    /// the reaper, matching at-least-once delivery.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        let import = self.keys.import();
        if self
            .broker
            .scard(&import)
            .await
            .context("read import queue depth")?
            == 0
        {
            tokio::time::sleep(self.cfg.idle_delay).await;
            return Ok(());
        }

        let working = self.keys.import_working();
        let Some(lease) = self
            .broker
            .lease_pop(&import, &working)
            .await
            .context("lease-pop import task")?
        else {
            return Ok(());
        };
        let entry = lease.entry();

        let Some(task) = ImportTask::decode(&lease.payload) else {
            tracing::warn!(
                event = "fetcher.task.malformed",
                payload = %lease.payload,
                "dropping undecodable task payload"
            );
            self.broker
                .srem(&working, &entry)
                .await
                .context("drop malformed task lease")?;
            return Ok(());
        };

        loop {
            match self.process(&task).await {
                Ok(Outcome::Retry) => {
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
                Ok(Outcome::Completed { fetched, staged: _ }) => {
                    self.broker
                        .srem(&working, &entry)
                        .await
                        .context("release completed task lease")?;
                    if fetched > 0 {
                        // Best-effort accounting, never read back for
                        // correctness.
                        if let Err(err) = self
                            .broker
                            .hincrby(&self.keys.work_stats(), &self.cfg.worker_name, fetched as i64)
                            .await
                        {
                            tracing::debug!(
                                event = "fetcher.stats.error",
                                error = %err,
                                "work stats update failed"
                            );
                        }
                    }
                    return Ok(());
                }
                Ok(Outcome::Abandoned) => {
                    self.broker
                        .srem(&working, &entry)
                        .await
                        .context("drop abandoned task lease")?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        event = "fetcher.task.error",
                        blog = %task.name,
                        offset = task.offset,
                        error = %format!("{err:#}"),
                        "task failed; leaving lease for the reaper"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Process one leased task against the remote API.
    async fn process(&mut self, task: &ImportTask) -> anyhow::Result<Outcome> {
        let name = task.name.as_str();

        let bad = self.bad.get(name).copied().unwrap_or(0);
        if bad >= self.cfg.bad_threshold {
            if bad != BAD_COUNTER_PINNED {
                tracing::info!(
                    event = "fetcher.blog.done",
                    blog = name,
                    "all posts crawled (probably)"
                );
                self.bad.insert(name.to_string(), BAD_COUNTER_PINNED);
            }
            return Ok(Outcome::Completed {
                fetched: 0,
                staged: 0,
            });
        }

        // Backpressure from the parser stage: hold the API call while the
        // staging queue is over its high water.
        let posts_key = self.keys.posts_staging();
        loop {
            let depth = self
                .broker
                .scard(&posts_key)
                .await
                .context("read posts staging depth")?;
            if depth <= self.cfg.stage_high_water {
                break;
            }
            tracing::warn!(
                event = "fetcher.backpressure",
                depth,
                "posts staging over high water"
            );
            tokio::time::sleep(self.cfg.backpressure_delay).await;
        }

        let response = self
            .api
            .posts(name, task.offset)
            .await
            .context("fetch posts page")?;

        match response.status() {
            Some(404) => {
                tracing::warn!(
                    event = "fetcher.blog.gone",
                    blog = name,
                    offset = task.offset,
                    "blog returned 404; abandoning task"
                );
                *self.bad.entry(name.to_string()).or_insert(0) += 1;
                return Ok(Outcome::Abandoned);
            }
            Some(status @ (429 | 502 | 503)) => {
                tracing::warn!(
                    event = "fetcher.remote.transient",
                    blog = name,
                    offset = task.offset,
                    status,
                    "transient remote status; retrying in-line"
                );
                return Ok(Outcome::Retry);
            }
            _ => {}
        }

        let Some(posts) = response.posts() else {
            tracing::warn!(
                event = "fetcher.posts.missing",
                blog = name,
                offset = task.offset,
                "response carries no posts array; retrying in-line"
            );
            return Ok(Outcome::Retry);
        };

        let threshold = task.last_crawl_epoch().unwrap_or(0.0);
        let mut staged = 0u64;
        let mut stale = 0u32;
        for post in posts {
            let posted = post.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            // Equal timestamps are admitted; only strictly older posts were
            // covered by the previous crawl.
            if posted >= threshold {
                let payload = serde_json::to_string(post).context("encode staged post")?;
                self.broker
                    .sadd(&posts_key, &payload)
                    .await
                    .context("stage post")?;
                staged += 1;
            } else {
                stale += 1;
            }
        }
        if stale > 0 {
            *self.bad.entry(name.to_string()).or_insert(0) += stale;
        }

        tracing::info!(
            event = "fetcher.page.complete",
            blog = name,
            offset = task.offset,
            fetched = posts.len(),
            staged,
            "page staged"
        );
        Ok(Outcome::Completed {
            fetched: posts.len() as u64,
            staged,
        })
    }
}

async fn worker_loop(
    mut fetcher: Fetcher,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    while !*shutdown.borrow() {
        fetcher.step().await?;
    }
    Ok(())
}

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&cfg.redis_url())
            .await
            .context("connect broker")?,
    );
    let keys = BrokerKeys::new(&cfg.queue_prefix);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    let worker_count = cfg.workers_for(Role::Fetcher);
    for _ in 0..worker_count {
        // One client per worker keeps the pacing clocks independent.
        let api: Arc<dyn TumblrApi> = Arc::new(TumblrClient::new(&cfg.api_base, &cfg.api_key));
        let fetcher = Fetcher::new(
            broker.clone(),
            api,
            keys.clone(),
            FetcherConfig::from_config(cfg),
        );
        workers.spawn(worker_loop(fetcher, shutdown_rx.clone()));
    }

    tracing::info!(
        event = "crawler.fetcher.started",
        workers = worker_count,
        "fetcher pool started"
    );
    supervisor::supervise(workers, shutdown_tx).await
}
