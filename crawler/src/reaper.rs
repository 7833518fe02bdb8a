//! Reaper worker: returns expired leases to the import queue.

use crate::config::{Config, Role};
use crate::supervisor;
use anyhow::Context;
use chrono::Utc;
use pipeline_core::{Broker, BrokerKeys, Lease, RedisBroker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Scan the working set once and requeue every lease older than
/// `lease_timeout` seconds relative to `now`. Removing an entry that is
/// already gone is a no-op, so concurrent reapers and crashed scans are
/// harmless.
pub async fn reap_once(
    broker: &dyn Broker,
    keys: &BrokerKeys,
    lease_timeout: i64,
    now: i64,
) -> anyhow::Result<u64> {
    let working = keys.import_working();
    let mut requeued = 0u64;

    for entry in broker
        .smembers(&working)
        .await
        .context("scan working set")?
    {
        let Some((started, payload)) = Lease::split_entry(&entry) else {
            tracing::warn!(
                event = "reaper.entry.malformed",
                entry = %entry,
                "dropping unparseable lease entry"
            );
            broker
                .srem(&working, &entry)
                .await
                .context("drop malformed lease entry")?;
            continue;
        };

        let idle = now - started;
        if idle > lease_timeout {
            tracing::warn!(
                event = "reaper.lease.expired",
                idle_secs = idle,
                "requeueing idle task"
            );
            broker
                .srem(&working, &entry)
                .await
                .context("remove expired lease")?;
            broker
                .sadd(&keys.import(), payload)
                .await
                .context("requeue expired task")?;
            requeued += 1;
        }
    }
    Ok(requeued)
}

async fn worker_loop(
    broker: Arc<dyn Broker>,
    keys: BrokerKeys,
    lease_timeout: i64,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let requeued = reap_once(
            broker.as_ref(),
            &keys,
            lease_timeout,
            Utc::now().timestamp(),
        )
        .await?;
        if requeued > 0 {
            tracing::info!(event = "reaper.pass", requeued, "requeued expired leases");
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&cfg.redis_url())
            .await
            .context("connect broker")?,
    );
    let keys = BrokerKeys::new(&cfg.queue_prefix);
    let period = Duration::from_secs(cfg.reaper_period_secs);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for _ in 0..cfg.workers_for(Role::Reaper) {
        workers.spawn(worker_loop(
            broker.clone(),
            keys.clone(),
            cfg.lease_timeout_secs,
            period,
            shutdown_rx.clone(),
        ));
    }

    tracing::info!(
        event = "crawler.reaper.started",
        lease_timeout_secs = cfg.lease_timeout_secs,
        "reaper started"
    );
    supervisor::supervise(workers, shutdown_tx).await
}
