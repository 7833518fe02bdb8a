use std::time::Duration;

pub const DEFAULT_FEEDER_WORKERS: usize = 1;
pub const DEFAULT_FETCHER_WORKERS: usize = 2;
pub const DEFAULT_REAPER_WORKERS: usize = 1;
pub const DEFAULT_PARSER_WORKERS: usize = 4;

/// Sleep when a queue a worker depends on is empty or over its high water.
pub const IDLE_DELAY: Duration = Duration::from_secs(1);

/// Feeder sleep after a transient remote status before moving on.
pub const FEEDER_SKIP_DELAY: Duration = Duration::from_secs(5);

/// Fetcher sleep before retrying a leased task after a transient failure.
pub const FETCHER_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Fetcher sleep while the posts staging queue is over its high water.
pub const BACKPRESSURE_DELAY: Duration = Duration::from_secs(5);

/// Sentinel for a blog whose bad counter crossed the done threshold; keeps
/// the "all posts crawled" line from logging more than once.
pub const BAD_COUNTER_PINNED: u32 = 999;

/// Largest random candidate sample the feeder requests per iteration.
pub const SAMPLE_MAX: u64 = 25;

/// Extra offset range past the advertised post count, covering posts added
/// between reading the count and fetching the last page.
pub const OFFSET_HEADROOM: u64 = 20;
