//! Parser pool wiring: each worker drains the staging queues through the
//! ingest layer with its own blog-id cache.

use crate::config::{Config, Role};
use crate::supervisor;
use anyhow::Context;
use pipeline_core::{Broker, BrokerKeys, RedisBroker};
use pipeline_ingest::{Ingest, Parser, ParserConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.workers_for(Role::Parser) as u32 + 1)
        .connect(&cfg.postgres_url)
        .await
        .context("connect catalogue")?;
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&cfg.redis_url())
            .await
            .context("connect broker")?,
    );
    let keys = BrokerKeys::new(&cfg.queue_prefix);

    let parser_cfg = ParserConfig {
        batch_size: cfg.batch_size,
        ..ParserConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    let worker_count = cfg.workers_for(Role::Parser);
    for _ in 0..worker_count {
        let ingest = Ingest::new(pool.clone(), broker.clone(), keys.clone());
        let parser = Parser::new(parser_cfg.clone(), broker.clone(), keys.clone(), ingest);
        workers.spawn(parser.run(shutdown_rx.clone()));
    }

    tracing::info!(
        event = "crawler.parser.started",
        workers = worker_count,
        batch_size = cfg.batch_size,
        "parser pool started"
    );
    supervisor::supervise(workers, shutdown_tx).await
}
