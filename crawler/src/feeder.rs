//! Feeder worker: expands catalogue blogs needing a crawl into offset tasks
//! on the import queue.

use crate::config::{Config, Role};
use crate::constants::{FEEDER_SKIP_DELAY, IDLE_DELAY, OFFSET_HEADROOM, SAMPLE_MAX};
use crate::supervisor;
use anyhow::Context;
use chrono::{DateTime, Utc};
use pipeline_core::tumblr::POSTS_PAGE_SIZE;
use pipeline_core::{Broker, BrokerKeys, ImportTask, RedisBroker, TumblrApi, TumblrClient};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub import_high_water: u64,
    pub sample_max: u64,
    pub idle_delay: Duration,
    pub skip_delay: Duration,
}

impl FeederConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            import_high_water: cfg.import_high_water,
            sample_max: SAMPLE_MAX,
            idle_delay: IDLE_DELAY,
            skip_delay: FEEDER_SKIP_DELAY,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct Candidate {
    id: i64,
    name: Option<String>,
    last_crawl_update: Option<DateTime<Utc>>,
}

pub struct Feeder {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    api: Arc<dyn TumblrApi>,
    keys: BrokerKeys,
    cfg: FeederConfig,
}

impl Feeder {
    pub fn new(
        pool: PgPool,
        broker: Arc<dyn Broker>,
        api: Arc<dyn TumblrApi>,
        keys: BrokerKeys,
        cfg: FeederConfig,
    ) -> Self {
        Self {
            pool,
            broker,
            api,
            keys,
            cfg,
        }
    }

    /// One loop iteration. Manual-queue names are always served; otherwise
    /// the import-queue depth gates a randomized sample of re-crawl
    /// candidates.
    pub async fn step(&self) -> anyhow::Result<()> {
        let manual = self
            .broker
            .spop(&self.keys.manual_queue(), self.cfg.sample_max as usize)
            .await
            .context("drain manual queue")?;

        let candidates = if manual.is_empty() {
            let queued = self
                .broker
                .scard(&self.keys.import())
                .await
                .context("read import queue depth")?;
            let working = self
                .broker
                .scard(&self.keys.import_working())
                .await
                .context("read working set depth")?;
            tracing::info!(
                event = "feeder.depths",
                queued,
                working,
                "import queue status"
            );

            if queued > self.cfg.import_high_water {
                tokio::time::sleep(self.cfg.idle_delay).await;
                return Ok(());
            }

            let sample = {
                let mut rng = rand::thread_rng();
                rng.gen_range(1..=self.cfg.sample_max.max(1))
            };
            self.random_candidates(sample as i64).await?
        } else {
            self.resolve_names(&manual).await?
        };

        if candidates.is_empty() {
            tokio::time::sleep(self.cfg.idle_delay).await;
            return Ok(());
        }

        for candidate in candidates {
            let name = candidate.name.clone().unwrap_or_default();
            if let Err(err) = self.archive(&candidate).await {
                tracing::warn!(
                    event = "feeder.blog.error",
                    blog = %name,
                    error = %format!("{err:#}"),
                    "archiving blog failed"
                );
            }
        }
        Ok(())
    }

    /// Blogs whose source-side `updated` moved past the last completed crawl.
    /// Randomized to keep concurrent feeders off the same candidates.
    async fn random_candidates(&self, limit: i64) -> anyhow::Result<Vec<Candidate>> {
        sqlx::query_as(
            r#"
            SELECT id, name, last_crawl_update
            FROM blogs
            WHERE updated <> last_crawl_update OR last_crawl_update IS NULL
            ORDER BY random()
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("select re-crawl candidates")
    }

    async fn resolve_names(&self, names: &[String]) -> anyhow::Result<Vec<Candidate>> {
        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let found: Option<Candidate> = sqlx::query_as(
                r#"
                SELECT id, name, last_crawl_update
                FROM blogs
                WHERE name = $1
                ORDER BY updated DESC NULLS LAST
                LIMIT 1
                "#,
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("resolve manual blog {name}"))?;
            match found {
                Some(candidate) => candidates.push(candidate),
                None => tracing::warn!(
                    event = "feeder.manual.unknown",
                    blog = %name,
                    "manual queue name not in catalogue"
                ),
            }
        }
        Ok(candidates)
    }

    async fn archive(&self, blog: &Candidate) -> anyhow::Result<()> {
        let Some(name) = blog.name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(());
        };

        let info = self.api.blog_info(name).await.context("fetch blog info")?;
        match info.status() {
            Some(404) => {
                tracing::warn!(
                    event = "feeder.blog.gone",
                    blog = name,
                    "blog returned 404; marking crawled"
                );
                return self.mark_crawled(blog).await;
            }
            Some(status @ (429 | 503 | 504)) => {
                tracing::warn!(
                    event = "feeder.remote.transient",
                    blog = name,
                    status,
                    "transient remote status; skipping candidate"
                );
                tokio::time::sleep(self.cfg.skip_delay).await;
                return Ok(());
            }
            _ => {}
        }

        let Some(post_count) = info.blog_post_count() else {
            tracing::warn!(
                event = "feeder.info.missing",
                blog = name,
                "blog info carries no post count; skipping"
            );
            return Ok(());
        };

        // Stage the blog envelope so the parser keeps the catalogue's blog
        // metadata fresh alongside the posts.
        let envelope = serde_json::to_string(&info).context("encode blog envelope")?;
        self.broker
            .sadd(&self.keys.blogs_staging(), &envelope)
            .await
            .context("stage blog info")?;

        let mut offsets = 0u64;
        for offset in expand_offsets(post_count) {
            let task = ImportTask::new(name, offset, blog.last_crawl_update);
            self.broker
                .sadd(&self.keys.import(), &task.encode()?)
                .await
                .context("enqueue import task")?;
            offsets += 1;
        }
        self.mark_crawled(blog).await?;

        tracing::info!(
            event = "feeder.blog.enqueued",
            blog = name,
            posts = post_count,
            offsets,
            "offsets enqueued"
        );
        Ok(())
    }

    async fn mark_crawled(&self, blog: &Candidate) -> anyhow::Result<()> {
        sqlx::query("UPDATE blogs SET last_crawl_update = updated WHERE id = $1")
            .bind(blog.id)
            .execute(&self.pool)
            .await
            .context("mark blog crawled")?;
        Ok(())
    }
}

/// Page offsets covering `post_count` posts plus headroom for posts added
/// since the count was read. The possibly-redundant trailing page is
/// intentional.
fn expand_offsets(post_count: u64) -> impl Iterator<Item = u64> {
    (0..post_count + OFFSET_HEADROOM).step_by(POSTS_PAGE_SIZE as usize)
}

async fn worker_loop(feeder: Feeder, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    while !*shutdown.borrow() {
        feeder.step().await?;
    }
    Ok(())
}

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect catalogue")?;
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&cfg.redis_url())
            .await
            .context("connect broker")?,
    );
    let keys = BrokerKeys::new(&cfg.queue_prefix);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    let worker_count = cfg.workers_for(Role::Feeder);
    for _ in 0..worker_count {
        let api: Arc<dyn TumblrApi> = Arc::new(TumblrClient::new(&cfg.api_base, &cfg.api_key));
        let feeder = Feeder::new(
            pool.clone(),
            broker.clone(),
            api,
            keys.clone(),
            FeederConfig::from_config(cfg),
        );
        workers.spawn(worker_loop(feeder, shutdown_rx.clone()));
    }

    tracing::info!(
        event = "crawler.feeder.started",
        workers = worker_count,
        "feeder started"
    );
    supervisor::supervise(workers, shutdown_tx).await
}
