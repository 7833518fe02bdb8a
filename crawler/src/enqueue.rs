use crate::config::Config;
use anyhow::Context;
use pipeline_core::{Broker, BrokerKeys, RedisBroker};

/// Push a blog name onto the manual re-crawl queue.
///
/// This exists purely to make operating the pipeline ergonomic: the feeder
/// serves manual names ahead of its random sampling, even when the import
/// queue is over its high water.
pub async fn run(cfg: &Config, blog: &str) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&cfg.redis_url())
        .await
        .context("connect broker")?;
    let keys = BrokerKeys::new(&cfg.queue_prefix);

    broker
        .sadd(&keys.manual_queue(), blog)
        .await
        .context("enqueue manual blog")?;

    println!("enqueued blog={blog}");
    Ok(())
}
