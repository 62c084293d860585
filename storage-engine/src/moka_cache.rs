use carbon::domain::CacheValue;
use moka::Expiry;
use moka::future::Cache;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Expirations up to this many seconds are relative; larger ones are unix
/// timestamps.
const MAX_RELATIVE_EXP: i64 = 60 * 60 * 24 * 30;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredItem {
    pub value: CacheValue,
    pub cas: u64,
    pub expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// When an item written with a memcached `exp` stops being visible.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Deadline {
    Never,
    At(Instant),
    Passed,
}

impl Deadline {
    pub fn from_exp(exp: i64, now: Instant) -> Self {
        match exp {
            0 => Deadline::Never,
            e if e < 0 => Deadline::Passed,
            e if e <= MAX_RELATIVE_EXP => Deadline::At(now + Duration::from_secs(e as u64)),
            e => {
                let unix_now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();
                if e <= unix_now {
                    Deadline::Passed
                } else {
                    Deadline::At(now + Duration::from_secs((e - unix_now) as u64))
                }
            }
        }
    }
}

/// Lets moka evict each item at its own deadline.
struct ItemExpiry;

impl Expiry<String, StoredItem> for ItemExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        item: &StoredItem,
        created_at: Instant,
    ) -> Option<Duration> {
        item.expires_at
            .map(|at| at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        item: &StoredItem,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        item.expires_at
            .map(|at| at.saturating_duration_since(updated_at))
    }
}

/// Counters reported by `getstats`, named after memcached's.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub cmd_touch: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub delete_hits: AtomicU64,
    pub delete_misses: AtomicU64,
    pub incr_hits: AtomicU64,
    pub incr_misses: AtomicU64,
    pub decr_hits: AtomicU64,
    pub decr_misses: AtomicU64,
    pub touch_hits: AtomicU64,
    pub touch_misses: AtomicU64,
    pub total_items: AtomicU64,
}

impl NodeStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_or_miss(found: bool, hits: &AtomicU64, misses: &AtomicU64) {
        Self::bump(if found { hits } else { misses });
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed).to_string();
        BTreeMap::from([
            ("cmd_get".to_string(), read(&self.cmd_get)),
            ("cmd_set".to_string(), read(&self.cmd_set)),
            ("cmd_touch".to_string(), read(&self.cmd_touch)),
            ("get_hits".to_string(), read(&self.get_hits)),
            ("get_misses".to_string(), read(&self.get_misses)),
            ("delete_hits".to_string(), read(&self.delete_hits)),
            ("delete_misses".to_string(), read(&self.delete_misses)),
            ("incr_hits".to_string(), read(&self.incr_hits)),
            ("incr_misses".to_string(), read(&self.incr_misses)),
            ("decr_hits".to_string(), read(&self.decr_hits)),
            ("decr_misses".to_string(), read(&self.decr_misses)),
            ("touch_hits".to_string(), read(&self.touch_hits)),
            ("touch_misses".to_string(), read(&self.touch_misses)),
            ("total_items".to_string(), read(&self.total_items)),
        ])
    }
}

/// One emulated memcached server: a moka cache with per-item expiry.
pub struct MokaNode {
    address: String,
    items: Cache<String, StoredItem>,
    available: AtomicBool,
    pub stats: NodeStats,
}

impl MokaNode {
    pub fn new(address: impl Into<String>, max_items: Option<u64>) -> Self {
        let address = address.into();
        let mut builder = Cache::<String, StoredItem>::builder()
            .name(&address)
            .expire_after(ItemExpiry);

        if let Some(capacity) = max_items {
            builder = builder.max_capacity(capacity);
        }

        Self {
            items: builder.build(),
            address,
            available: AtomicBool::new(true),
            stats: NodeStats::default(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn lookup(&self, key: &str) -> Option<StoredItem> {
        self.items
            .get(key)
            .await
            .filter(|item| item.is_live(Instant::now()))
    }

    pub async fn store(&self, key: &str, item: StoredItem) {
        NodeStats::bump(&self.stats.total_items);
        self.items.insert(key.to_string(), item).await;
    }

    /// Rewrites an existing item without counting it as a new one.
    pub async fn restore(&self, key: &str, item: StoredItem) {
        self.items.insert(key.to_string(), item).await;
    }

    pub async fn remove(&self, key: &str) -> Option<StoredItem> {
        self.items
            .remove(key)
            .await
            .filter(|item| item.is_live(Instant::now()))
    }

    pub fn flush(&self) {
        self.items.invalidate_all();
    }

    /// Snapshot of this node's counters plus the process-level fields.
    pub fn stats_snapshot(&self, uptime: Duration) -> BTreeMap<String, String> {
        let mut stats = self.stats.snapshot();
        stats.insert("pid".to_string(), std::process::id().to_string());
        stats.insert("uptime".to_string(), uptime.as_secs().to_string());
        stats.insert("curr_items".to_string(), self.items.entry_count().to_string());
        stats.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        stats
    }
}

impl Debug for MokaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaNode")
            .field("address", &self.address)
            .field("available", &self.is_available())
            .field("entry_count", &self.items.entry_count())
            .finish()
    }
}
