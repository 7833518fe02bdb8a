//! Fetch-flow scenarios: lease lifecycle, retries, backpressure, and the
//! reaper, exercised against the in-memory broker with a scripted API.

use async_trait::async_trait;
use pipeline_core::{ApiEnvelope, Broker, BrokerKeys, Lease, MemoryBroker, TumblrApi};
use pipeline_crawler::fetcher::{Fetcher, FetcherConfig};
use pipeline_crawler::reaper;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// API double that replays a scripted sequence of responses, then keeps
/// serving the fallback.
struct ScriptedApi {
    queue: Mutex<VecDeque<ApiEnvelope>>,
    fallback: ApiEnvelope,
    calls: AtomicUsize,
}

impl ScriptedApi {
    fn new(fallback: ApiEnvelope) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn push(&self, envelope: ApiEnvelope) {
        self.queue.lock().unwrap().push_back(envelope);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TumblrApi for ScriptedApi {
    async fn blog_info(&self, _name: &str) -> anyhow::Result<ApiEnvelope> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fallback.clone())
    }

    async fn posts(&self, _name: &str, _offset: u64) -> anyhow::Result<ApiEnvelope> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.queue.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.fallback.clone()))
    }
}

fn post(id: u64, timestamp: i64) -> Value {
    json!({
        "id": id,
        "timestamp": timestamp,
        "blog_name": "a",
        "blog": {"uuid": "t:a", "name": "a"},
    })
}

fn posts_page(posts: Vec<Value>) -> ApiEnvelope {
    serde_json::from_value(json!({
        "meta": {"status": 200, "msg": "OK"},
        "blog": {"name": "a", "uuid": "t:a", "posts": posts.len()},
        "posts": posts,
    }))
    .unwrap()
}

fn status_only(status: u16) -> ApiEnvelope {
    serde_json::from_value(json!({"meta": {"status": status, "msg": "err"}})).unwrap()
}

fn fetcher_config() -> FetcherConfig {
    FetcherConfig {
        worker_name: "test-worker".to_string(),
        stage_high_water: 50_000,
        bad_threshold: 15,
        idle_delay: Duration::from_millis(10),
        retry_delay: Duration::from_secs(10),
        backpressure_delay: Duration::from_secs(5),
    }
}

async fn seed_task(broker: &dyn Broker, keys: &BrokerKeys, raw: &str) -> anyhow::Result<()> {
    broker.sadd(&keys.import(), raw).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn seeded_task_drains_to_staging() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(posts_page(vec![post(10, 100), post(11, 200)]));

    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":0,"last_crawl":"0"}"#,
    )
    .await?;

    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    fetcher.step().await?;

    assert_eq!(broker.scard(&keys.posts_staging()).await?, 2);
    assert_eq!(broker.scard(&keys.import()).await?, 0);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    assert_eq!(
        broker.hget(&keys.work_stats(), "test-worker").await?,
        Some("2".to_string())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn crashed_fetcher_lease_is_reaped_and_completed() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(posts_page(vec![post(10, 100), post(11, 200)]));

    let raw = r#"{"name":"a","offset":0,"last_crawl":"0"}"#;
    seed_task(broker.as_ref(), &keys, raw).await?;

    // First fetcher dies right after the atomic pop: the lease entry stays.
    let lease = broker
        .lease_pop(&keys.import(), &keys.import_working())
        .await?
        .expect("task leased");
    assert_eq!(broker.scard(&keys.import_working()).await?, 1);

    // One second short of the timeout nothing happens.
    let requeued = reaper::reap_once(broker.as_ref(), &keys, 180, lease.epoch + 179).await?;
    assert_eq!(requeued, 0);

    let requeued = reaper::reap_once(broker.as_ref(), &keys, 180, lease.epoch + 181).await?;
    assert_eq!(requeued, 1);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    assert!(broker.sismember(&keys.import(), raw).await?);

    // A second fetcher picks the requeued task up and completes it.
    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    fetcher.step().await?;

    assert_eq!(broker.scard(&keys.posts_staging()).await?, 2);
    assert_eq!(broker.scard(&keys.import()).await?, 0);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transient_status_sleeps_and_retries_in_line() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(posts_page(vec![post(10, 100)]));
    api.push(status_only(429));

    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":0,"last_crawl":"0"}"#,
    )
    .await?;

    let started = tokio::time::Instant::now();
    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    fetcher.step().await?;

    assert_eq!(api.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(broker.scard(&keys.posts_staging()).await?, 1);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gone_blog_is_abandoned_without_requeue() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(status_only(404));

    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":40,"last_crawl":"0"}"#,
    )
    .await?;

    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    fetcher.step().await?;

    assert_eq!(api.calls(), 1);
    assert_eq!(broker.scard(&keys.import()).await?, 0);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    assert_eq!(broker.scard(&keys.posts_staging()).await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn malformed_task_payload_is_dropped() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(posts_page(vec![]));

    seed_task(broker.as_ref(), &keys, "not json at all").await?;
    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":0,"last_crawl":"soon"}"#,
    )
    .await?;

    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    fetcher.step().await?;
    fetcher.step().await?;

    assert_eq!(api.calls(), 0);
    assert_eq!(broker.scard(&keys.import()).await?, 0);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_pages_pin_blog_as_done() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    // Every returned post predates the task's last crawl.
    let stale: Vec<Value> = (0..20).map(|n| post(n, 5)).collect();
    let api = ScriptedApi::new(posts_page(stale));

    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());

    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":0,"last_crawl":"100"}"#,
    )
    .await?;
    fetcher.step().await?;
    assert_eq!(api.calls(), 1);
    assert_eq!(broker.scard(&keys.posts_staging()).await?, 0);

    // 20 stale posts crossed the threshold of 15: further tasks for the blog
    // complete without touching the API.
    for _ in 0..2 {
        seed_task(
            broker.as_ref(),
            &keys,
            r#"{"name":"a","offset":20,"last_crawl":"100"}"#,
        )
        .await?;
        fetcher.step().await?;
    }
    assert_eq!(api.calls(), 1);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backpressure_holds_api_until_staging_drains() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let api = ScriptedApi::new(posts_page(vec![post(10, 100)]));

    let staging = keys.posts_staging();
    for n in 0..50_001u64 {
        broker.sadd(&staging, &format!("preloaded-{n}")).await?;
    }
    seed_task(
        broker.as_ref(),
        &keys,
        r#"{"name":"a","offset":0,"last_crawl":"0"}"#,
    )
    .await?;

    let mut fetcher = Fetcher::new(broker.clone(), api.clone(), keys.clone(), fetcher_config());
    let step = tokio::spawn(async move { fetcher.step().await });

    // Let the fetcher spin through several backpressure sleeps.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(api.calls(), 0);

    // Drop below the high water; the held task proceeds.
    broker.srem(&staging, "preloaded-0").await?;
    broker.srem(&staging, "preloaded-1").await?;
    step.await??;

    assert_eq!(api.calls(), 1);
    assert_eq!(broker.scard(&keys.import_working()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn reaper_ignores_fresh_and_drops_malformed_entries() -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let keys = BrokerKeys::default();
    let now = 1_700_000_000i64;

    let fresh = Lease {
        epoch: now - 60,
        payload: r#"{"name":"a","offset":0,"last_crawl":"0"}"#.to_string(),
    };
    broker
        .sadd(&keys.import_working(), &fresh.entry())
        .await?;
    broker
        .sadd(&keys.import_working(), "garbage without separator")
        .await?;

    let requeued = reaper::reap_once(broker.as_ref(), &keys, 180, now).await?;
    assert_eq!(requeued, 0);
    assert_eq!(broker.scard(&keys.import()).await?, 0);

    // The fresh lease survived; the malformed entry is gone.
    let remaining = broker.smembers(&keys.import_working()).await?;
    assert_eq!(remaining, vec![fresh.entry()]);
    Ok(())
}
