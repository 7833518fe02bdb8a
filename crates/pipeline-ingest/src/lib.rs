//! Ingest upsert layer.
//!
//! Turns raw API documents into catalogue rows. Writes go through a bulk
//! fast-path (one multi-row insert per batch) and fall back to per-row
//! upserts when a uniqueness conflict shows the batch touches existing rows.
//! Timestamp columns merge monotonically: a stored `posted`/`updated` value
//! is only ever replaced by a greater one, so re-ingestion in any order
//! converges on the same row.

use anyhow::Context;
use chrono::{DateTime, Utc};
use pipeline_core::{Broker, BrokerKeys};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod parser;

pub use parser::{Parser, ParserConfig};

/// Upper bound on the in-process blog-id cache. The cache is advisory (the
/// broker hash and the catalogue remain authoritative), so overflow simply
/// resets it.
const BLOG_ID_CACHE_MAX: usize = 10_000;

/// Which staging queue a batch came from, with its table binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingKind {
    Blogs,
    Posts,
}

impl StagingKind {
    pub fn queue_key(&self, keys: &BrokerKeys) -> String {
        match self {
            StagingKind::Blogs => keys.blogs_staging(),
            StagingKind::Posts => keys.posts_staging(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StagingKind::Blogs => "blogs",
            StagingKind::Posts => "posts",
        }
    }
}

/// Outcome of one submitted batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSummary {
    /// Rows handed to the catalogue (fast or slow path).
    pub submitted: usize,
    /// Records dropped before submission: undecodable JSON or unkeyable
    /// payloads.
    pub discarded: usize,
    /// Whether the bulk insert succeeded without falling back.
    pub fast_path: bool,
}

#[derive(Debug, Clone)]
struct BlogRecord {
    tumblr_uid: String,
    name: Option<String>,
    updated: DateTime<Utc>,
    data: Value,
    extra_meta: Value,
}

#[derive(Debug, Clone)]
struct PostRecord {
    tumblr_id: i64,
    author_id: Option<i64>,
    posted: DateTime<Utc>,
    data: Value,
}

pub struct Ingest {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    keys: BrokerKeys,
    blog_ids: Mutex<HashMap<String, i64>>,
}

impl Ingest {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>, keys: BrokerKeys) -> Self {
        Self {
            pool,
            broker,
            keys,
            blog_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Insert-or-update a blog from a raw API document (either a bare blog
    /// object or a `{meta, blog}` envelope). Returns the catalogue id, or
    /// `None` when the document carries no UID and cannot be keyed.
    pub async fn upsert_blog(&self, info: &Value) -> anyhow::Result<Option<i64>> {
        let Some(record) = blog_record(info) else {
            return Ok(None);
        };
        self.upsert_blog_record(&record).await.map(Some)
    }

    /// Insert-or-update a post from a raw API document. Returns `false` when
    /// the document has no numeric id and was discarded.
    pub async fn upsert_post(&self, info: &Value) -> anyhow::Result<bool> {
        let Some(record) = self.post_record(info).await? else {
            return Ok(false);
        };
        self.upsert_post_record(&record).await?;
        Ok(true)
    }

    /// Submit one decoded staging batch. Attempts the bulk fast-path first;
    /// on a uniqueness conflict the whole batch is rolled back and replayed
    /// row by row through the conflict-merging upserts.
    pub async fn ingest_batch(
        &self,
        kind: StagingKind,
        raw: &[String],
    ) -> anyhow::Result<BatchSummary> {
        match kind {
            StagingKind::Blogs => self.ingest_blogs(raw).await,
            StagingKind::Posts => self.ingest_posts(raw).await,
        }
    }

    async fn ingest_blogs(&self, raw: &[String]) -> anyhow::Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut records = Vec::with_capacity(raw.len());
        for raw_item in raw {
            let Ok(info) = serde_json::from_str::<Value>(raw_item) else {
                summary.discarded += 1;
                continue;
            };
            match blog_record(&info) {
                Some(record) => records.push(record),
                None => summary.discarded += 1,
            }
        }
        if records.is_empty() {
            return Ok(summary);
        }
        summary.submitted = records.len();

        match self.bulk_insert_blogs(&records).await {
            Ok(()) => summary.fast_path = true,
            Err(err) if is_unique_violation(&err) => {
                for record in &records {
                    self.upsert_blog_record(record).await?;
                }
            }
            Err(err) => return Err(err).context("bulk insert blogs"),
        }
        Ok(summary)
    }

    async fn ingest_posts(&self, raw: &[String]) -> anyhow::Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut records = Vec::with_capacity(raw.len());
        for raw_item in raw {
            let Ok(info) = serde_json::from_str::<Value>(raw_item) else {
                summary.discarded += 1;
                continue;
            };
            match self.post_record(&info).await? {
                Some(record) => records.push(record),
                None => summary.discarded += 1,
            }
        }
        if records.is_empty() {
            return Ok(summary);
        }
        summary.submitted = records.len();

        match self.bulk_insert_posts(&records).await {
            Ok(()) => summary.fast_path = true,
            Err(err) if is_unique_violation(&err) => {
                for record in &records {
                    self.upsert_post_record(record).await?;
                }
            }
            Err(err) => return Err(err).context("bulk insert posts"),
        }
        Ok(summary)
    }

    async fn bulk_insert_blogs(&self, records: &[BlogRecord]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO blogs (tumblr_uid, name, updated, data, extra_meta) ");
        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.tumblr_uid)
                .push_bind(&record.name)
                .push_bind(record.updated)
                .push_bind(&record.data)
                .push_bind(&record.extra_meta);
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await
    }

    async fn bulk_insert_posts(&self, records: &[PostRecord]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO posts (tumblr_id, author_id, posted, data) ");
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.tumblr_id)
                .push_bind(record.author_id)
                .push_bind(record.posted)
                .push_bind(&record.data);
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await
    }

    async fn upsert_blog_record(&self, record: &BlogRecord) -> anyhow::Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO blogs (tumblr_uid, name, updated, data, extra_meta)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tumblr_uid) DO UPDATE
            SET name = EXCLUDED.name,
                updated = GREATEST(blogs.updated, EXCLUDED.updated),
                data = EXCLUDED.data,
                extra_meta = EXCLUDED.extra_meta
            RETURNING id
            "#,
        )
        .bind(&record.tumblr_uid)
        .bind(&record.name)
        .bind(record.updated)
        .bind(&record.data)
        .bind(&record.extra_meta)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert blog uid={}", record.tumblr_uid))?;
        Ok(id)
    }

    async fn upsert_post_record(&self, record: &PostRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (tumblr_id, author_id, posted, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tumblr_id, author_id) DO UPDATE
            SET posted = GREATEST(posts.posted, EXCLUDED.posted),
                data = EXCLUDED.data
            "#,
        )
        .bind(record.tumblr_id)
        .bind(record.author_id)
        .bind(record.posted)
        .bind(&record.data)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert post id={}", record.tumblr_id))?;
        Ok(())
    }

    async fn post_record(&self, info: &Value) -> anyhow::Result<Option<PostRecord>> {
        let Some(tumblr_id) = info.get("id").and_then(Value::as_i64) else {
            // Without an id the (tumblr_id, author_id) key can never match
            // again; the row would duplicate forever.
            return Ok(None);
        };
        let author_id = self.resolve_author(info).await?;
        let mut data = info.clone();
        strip_nul(&mut data);
        Ok(Some(PostRecord {
            tumblr_id,
            author_id,
            posted: epoch_to_datetime(info.get("timestamp")),
            data,
        }))
    }

    /// Resolve a post's author to a catalogue blog id.
    ///
    /// Lookup order: in-process cache, shared broker hash, catalogue by name
    /// (most recently updated wins), and finally synthesizing the blog from
    /// the post's embedded `blog` object when it carries a UID. Positive
    /// results propagate back through both caches.
    async fn resolve_author(&self, info: &Value) -> anyhow::Result<Option<i64>> {
        if info.get("blog").is_none() {
            return Ok(None);
        }
        let Some(name) = info.get("blog_name").and_then(Value::as_str) else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }

        if let Some(id) = self.cached_blog_id(name) {
            return Ok(Some(id));
        }

        if let Some(raw) = self.broker.hget(&self.keys.blog_ids(), name).await? {
            if let Ok(id) = raw.parse::<i64>() {
                self.cache_blog_id(name, id);
                return Ok(Some(id));
            }
        }

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM blogs WHERE name = $1 ORDER BY updated DESC NULLS LAST LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("look up blog by name={name}"))?;
        let mut author_id = row.map(|(id,)| id);

        if author_id.is_none() {
            let blog = info.get("blog").cloned().unwrap_or(Value::Null);
            if blog.get("uuid").and_then(Value::as_str).is_some() {
                author_id = self.upsert_blog(&blog).await?;
            }
        }

        if let Some(id) = author_id {
            self.broker
                .hset(&self.keys.blog_ids(), name, &id.to_string())
                .await?;
            self.cache_blog_id(name, id);
        }
        Ok(author_id)
    }

    fn cached_blog_id(&self, name: &str) -> Option<i64> {
        self.blog_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn cache_blog_id(&self, name: &str, id: i64) {
        let mut cache = self.blog_ids.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= BLOG_ID_CACHE_MAX {
            cache.clear();
        }
        cache.insert(name.to_string(), id);
    }
}

fn blog_record(info: &Value) -> Option<BlogRecord> {
    let blog = info.get("blog").unwrap_or(info);
    let uid = blog.get("uuid")?.as_str()?;

    let mut data = blog.clone();
    strip_nul(&mut data);
    let mut extra_meta = info
        .get("meta")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    strip_nul(&mut extra_meta);

    Some(BlogRecord {
        tumblr_uid: uid.replace('\0', ""),
        name: blog
            .get("name")
            .and_then(Value::as_str)
            .map(|n| n.replace('\0', "")),
        updated: epoch_to_datetime(blog.get("updated")),
        data,
        extra_meta,
    })
}

fn epoch_to_datetime(value: Option<&Value>) -> DateTime<Utc> {
    let secs = value.and_then(Value::as_f64).unwrap_or(0.0);
    DateTime::from_timestamp(secs as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Recursively remove NUL bytes from every string in the payload; the
/// catalogue's JSONB columns reject `\u{0000}`.
pub fn strip_nul(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains('\0') {
                *s = s.replace('\0', "");
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nul),
        Value::Object(map) => map.values_mut().for_each(strip_nul),
        _ => {}
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "23505")
}

/// Whether an error chain bottoms out in a relational error worth re-running
/// the batch for (serialization failure or deadlock).
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|db| db.code())
            .map_or(false, |code| code == "40001" || code == "40P01")
    })
}
