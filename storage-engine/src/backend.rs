use crate::moka_cache::{Deadline, MokaNode, NodeStats, StoredItem};
use carbon::domain::{CacheValue, CasValue};
use carbon::ports::{OpResult, OpValue, Operation};
use shared::{Error, Result};
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// In-process stand-in for a memcached cluster.
///
/// Keys are spread over the configured servers by a stable hash, the way a
/// memcached client would. Read-modify-write commands are serialized so that
/// add, cas-checked append and counters behave atomically.
pub struct MokaBackend {
    nodes: Vec<Arc<MokaNode>>,
    next_cas: AtomicU64,
    writes: Mutex<()>,
    started: Instant,
}

impl MokaBackend {
    pub fn new(servers: &[String], max_items_per_node: Option<u64>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::Backend("no servers configured".to_string()));
        }
        let nodes = servers
            .iter()
            .map(|address| Arc::new(MokaNode::new(address.as_str(), max_items_per_node)))
            .collect();

        info!("Moka backend emulating {} server(s): {}", servers.len(), servers.join(" "));
        Ok(Self {
            nodes,
            next_cas: AtomicU64::new(1),
            writes: Mutex::new(()),
            started: Instant::now(),
        })
    }

    pub fn servers(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address().to_string()).collect()
    }

    /// Marks a server up or down. Returns false for an unknown address.
    pub fn set_available(&self, address: &str, available: bool) -> bool {
        match self.nodes.iter().find(|n| n.address() == address) {
            Some(node) => {
                node.set_available(available);
                info!("Server {} marked {}", address, if available { "up" } else { "down" });
                true
            }
            None => false,
        }
    }

    pub fn available_servers(&self) -> Vec<String> {
        self.servers_where(true)
    }

    pub fn unavailable_servers(&self) -> Vec<String> {
        self.servers_where(false)
    }

    /// Per-server counters for the servers that are up.
    pub fn stats(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let uptime = self.started.elapsed();
        self.nodes
            .iter()
            .filter(|n| n.is_available())
            .map(|n| (n.address().to_string(), n.stats_snapshot(uptime)))
            .collect()
    }

    pub async fn execute(&self, operation: Operation) -> OpResult {
        debug!("Executing {} on {:?}", operation.name(), operation.key());
        match operation {
            Operation::Get { key } => {
                let node = self.live_node(&key)?;
                NodeStats::bump(&node.stats.cmd_get);
                let found = node.lookup(&key).await;
                NodeStats::hit_or_miss(found.is_some(), &node.stats.get_hits, &node.stats.get_misses);
                Ok(OpValue::Fetched(found.map(|item| item.value)))
            }
            Operation::GetBulk { keys } => {
                let mut found = BTreeMap::new();
                for key in keys {
                    // keys on a server that is down read as missing
                    let Ok(node) = self.live_node(&key) else {
                        continue;
                    };
                    NodeStats::bump(&node.stats.cmd_get);
                    let item = node.lookup(&key).await;
                    NodeStats::hit_or_miss(item.is_some(), &node.stats.get_hits, &node.stats.get_misses);
                    if let Some(item) = item {
                        found.insert(key, item.value);
                    }
                }
                Ok(OpValue::Bulk(found))
            }
            Operation::GetAndTouch { key, exp } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                NodeStats::bump(&node.stats.cmd_touch);
                let Some(mut item) = node.lookup(&key).await else {
                    NodeStats::bump(&node.stats.touch_misses);
                    return Ok(OpValue::CasFetched(None));
                };
                NodeStats::bump(&node.stats.touch_hits);
                let fetched = CasValue::new(item.value.clone(), item.cas);
                match Deadline::from_exp(exp, Instant::now()) {
                    Deadline::Passed => {
                        node.remove(&key).await;
                    }
                    deadline => {
                        item.expires_at = expires_at(deadline);
                        node.restore(&key, item).await;
                    }
                }
                Ok(OpValue::CasFetched(Some(fetched)))
            }
            Operation::Set { key, exp, value } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                Ok(OpValue::Stored(self.write(node, &key, value, exp).await))
            }
            Operation::Add { key, exp, value } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                if node.lookup(&key).await.is_some() {
                    NodeStats::bump(&node.stats.cmd_set);
                    return Ok(OpValue::Stored(false));
                }
                Ok(OpValue::Stored(self.write(node, &key, value, exp).await))
            }
            Operation::Replace { key, exp, value } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                if node.lookup(&key).await.is_none() {
                    NodeStats::bump(&node.stats.cmd_set);
                    return Ok(OpValue::Stored(false));
                }
                Ok(OpValue::Stored(self.write(node, &key, value, exp).await))
            }
            Operation::Append { key, cas, value } => self.concat(&key, cas, value, true).await,
            Operation::Prepend { key, cas, value } => self.concat(&key, cas, value, false).await,
            Operation::Touch { key, exp } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                NodeStats::bump(&node.stats.cmd_touch);
                let Some(mut item) = node.lookup(&key).await else {
                    NodeStats::bump(&node.stats.touch_misses);
                    return Ok(OpValue::Stored(false));
                };
                NodeStats::bump(&node.stats.touch_hits);
                match Deadline::from_exp(exp, Instant::now()) {
                    Deadline::Passed => {
                        node.remove(&key).await;
                    }
                    deadline => {
                        item.expires_at = expires_at(deadline);
                        node.restore(&key, item).await;
                    }
                }
                Ok(OpValue::Stored(true))
            }
            Operation::Incr { key, by } => self.count(&key, by, true).await,
            Operation::Decr { key, by } => self.count(&key, by, false).await,
            Operation::Delete { key } => {
                let node = self.live_node(&key)?;
                let _guard = self.writes.lock().await;
                let removed = node.remove(&key).await.is_some();
                NodeStats::hit_or_miss(removed, &node.stats.delete_hits, &node.stats.delete_misses);
                Ok(OpValue::Stored(removed))
            }
            Operation::Flush { delay } => Ok(OpValue::Stored(self.flush(delay))),
        }
    }

    fn servers_where(&self, available: bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_available() == available)
            .map(|n| n.address().to_string())
            .collect()
    }

    fn route(&self, key: &str) -> &Arc<MokaNode> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.nodes.len() as u64) as usize;
        &self.nodes[index]
    }

    fn live_node(&self, key: &str) -> Result<&Arc<MokaNode>> {
        let node = self.route(key);
        if node.is_available() {
            Ok(node)
        } else {
            Err(Error::Backend(format!("server {} is unavailable", node.address())))
        }
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }

    /// Unconditional store. Callers hold the write lock.
    async fn write(&self, node: &MokaNode, key: &str, value: CacheValue, exp: i64) -> bool {
        NodeStats::bump(&node.stats.cmd_set);
        match Deadline::from_exp(exp, Instant::now()) {
            Deadline::Passed => {
                // stored and immediately expired
                node.remove(key).await;
            }
            deadline => {
                let item = StoredItem {
                    value,
                    cas: self.next_cas(),
                    expires_at: expires_at(deadline),
                };
                node.store(key, item).await;
            }
        }
        true
    }

    async fn concat(&self, key: &str, cas: u64, addition: CacheValue, append: bool) -> OpResult {
        let node = self.live_node(key)?;
        let _guard = self.writes.lock().await;
        NodeStats::bump(&node.stats.cmd_set);

        let Some(item) = node.lookup(key).await else {
            return Ok(OpValue::Stored(false));
        };
        // a zero token skips the check
        if cas != 0 && cas != item.cas {
            debug!("cas mismatch on '{}': {} != {}", key, cas, item.cas);
            return Ok(OpValue::Stored(false));
        }

        let joined = StoredItem {
            value: joined(&item.value, &addition, append),
            cas: self.next_cas(),
            expires_at: item.expires_at,
        };
        node.restore(key, joined).await;
        Ok(OpValue::Stored(true))
    }

    async fn count(&self, key: &str, by: u64, increment: bool) -> OpResult {
        let node = self.live_node(key)?;
        let (hits, misses) = if increment {
            (&node.stats.incr_hits, &node.stats.incr_misses)
        } else {
            (&node.stats.decr_hits, &node.stats.decr_misses)
        };
        let _guard = self.writes.lock().await;

        let Some(item) = node.lookup(key).await else {
            NodeStats::bump(misses);
            return Ok(OpValue::Counter(None));
        };
        NodeStats::bump(hits);

        let current = counter_of(&item.value)?;
        // memcached wraps on overflow and stops at zero on underflow
        let next = if increment {
            current.wrapping_add(by)
        } else {
            current.saturating_sub(by)
        };

        let updated = StoredItem {
            value: counter_value(&item.value, next),
            cas: self.next_cas(),
            expires_at: item.expires_at,
        };
        node.restore(key, updated).await;
        Ok(OpValue::Counter(Some(next)))
    }

    fn flush(&self, delay: i64) -> bool {
        let mut flushed = false;
        for node in self.nodes.iter().filter(|n| n.is_available()) {
            flushed = true;
            if delay <= 0 {
                node.flush();
                continue;
            }
            let node = Arc::clone(node);
            let wait = Duration::from_secs(delay as u64);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                node.flush();
                debug!("Delayed flush of {} done", node.address());
            });
        }
        flushed
    }
}

fn expires_at(deadline: Deadline) -> Option<Instant> {
    match deadline {
        Deadline::At(at) => Some(at),
        Deadline::Never | Deadline::Passed => None,
    }
}

fn joined(existing: &CacheValue, addition: &CacheValue, append: bool) -> CacheValue {
    let (head, tail) = if append {
        (existing, addition)
    } else {
        (addition, existing)
    };
    match (existing, addition) {
        (CacheValue::Bytes(_), _) | (_, CacheValue::Bytes(_)) => {
            let mut bytes = head.to_bytes();
            bytes.extend(tail.to_bytes());
            CacheValue::Bytes(bytes)
        }
        _ => {
            let mut text = String::from_utf8_lossy(&head.to_bytes()).into_owned();
            text.push_str(&String::from_utf8_lossy(&tail.to_bytes()));
            CacheValue::Text(text)
        }
    }
}

fn counter_of(value: &CacheValue) -> Result<u64> {
    let raw = value.to_bytes();
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            Error::Backend(format!(
                "cannot increment or decrement non-numeric {} value",
                value.type_name()
            ))
        })
}

/// Keeps the stored representation of a counter close to what it was.
fn counter_value(previous: &CacheValue, counter: u64) -> CacheValue {
    match previous {
        CacheValue::Int(_) => i64::try_from(counter)
            .map(CacheValue::Int)
            .unwrap_or_else(|_| CacheValue::Text(counter.to_string())),
        CacheValue::Bytes(_) => CacheValue::Bytes(counter.to_string().into_bytes()),
        _ => CacheValue::Text(counter.to_string()),
    }
}
