//! In-process [`Queue`] implementation.
//!
//! One mutex over the whole store; a [`Notify`] wakes blocked stream readers
//! when entries arrive. Stream groups track a delivery cursor plus a pending
//! set, so entries are handed out once and stay pending until acked.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{Queue, QueueError, Result, StreamEntry};

#[derive(Default)]
struct GroupState {
    /// Index into the stream's entry vec of the next undelivered entry.
    cursor: usize,
    pending: HashSet<String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, String)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Store {
    lists: HashMap<String, VecDeque<String>>,
    kv: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, StreamState>,
}

impl Store {
    fn kv_get(&mut self, key: &str) -> Option<String> {
        match self.kv.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                self.kv.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

/// Resolve a redis-style `start..=stop` rank range (negative = from the end)
/// against a collection of `len` items.
fn rank_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let norm = |idx: i64| -> i64 {
        if idx < 0 {
            len + idx
        } else {
            idx
        }
    };
    let from = norm(start).max(0);
    let to = norm(stop).min(len - 1);
    if from > to || len == 0 {
        None
    } else {
        Some((from as usize, to as usize))
    }
}

pub struct MemoryQueue {
    store: Mutex<Store>,
    stream_notify: Arc<Notify>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            stream_notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().expect("queue store poisoned")
    }

    fn try_read(
        store: &mut Store,
        group: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut out = Vec::new();

        for stream_key in streams {
            if out.len() >= count {
                break;
            }

            let stream = store.streams.entry(stream_key.clone()).or_default();
            let StreamState { entries, groups, .. } = stream;
            let state = groups.get_mut(group).ok_or_else(|| {
                QueueError::GroupMissing {
                    stream: stream_key.clone(),
                    group: group.to_string(),
                }
            })?;

            while state.cursor < entries.len() && out.len() < count {
                let (id, payload) = entries[state.cursor].clone();
                state.pending.insert(id.clone());
                state.cursor += 1;
                out.push(StreamEntry {
                    stream: stream_key.clone(),
                    id,
                    payload,
                });
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut store = self.lock();
        let list = store.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.lock();
        Ok(store.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let store = self.lock();
        let Some(list) = store.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((from, to)) = rank_range(start, stop, list.len()) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(from).take(to - from + 1).cloned().collect())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let store = self.lock();
        Ok(store.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn pop_batch(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut store = self.lock();
        let Some(list) = store.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        Ok(list.drain(..take).collect())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().kv.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        self.lock().kv.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().kv_get(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut store = self.lock();
        store.kv.remove(key);
        store.lists.remove(key);
        store.sets.remove(key);
        store.zsets.remove(key);
        store.hashes.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut store = self.lock();
        let current = store
            .kv_get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        store.kv.insert(key.to_string(), (next.to_string(), None));
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.lock();
        Ok(store
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let store = self.lock();
        Ok(store.sets.get(key).map_or(0, HashSet::len))
    }

    async fn spop_all(&self, key: &str) -> Result<Vec<String>> {
        let mut store = self.lock();
        Ok(store
            .sets
            .remove(key)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut store = self.lock();
        let zset = store.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        let at = zset
            .binary_search_by(|(_, s)| s.partial_cmp(&score).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or_else(|i| i);
        zset.insert(at, (member.to_string(), score));
        Ok(())
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let store = self.lock();
        let Some(zset) = store.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((from, to)) = rank_range(start, stop, zset.len()) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .iter()
            .rev()
            .skip(from)
            .take(to - from + 1)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn ztrim_to(&self, key: &str, keep: usize) -> Result<()> {
        let mut store = self.lock();
        if let Some(zset) = store.zsets.get_mut(key) {
            let len = zset.len();
            if len > keep {
                // Lowest scores sit at the front.
                zset.drain(..len - keep);
            }
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let store = self.lock();
        Ok(store
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let store = self.lock();
        let hash = store.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn xadd(&self, stream: &str, payload: &str) -> Result<String> {
        let id = {
            let mut store = self.lock();
            let state = store.streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let id = format!("{}-{}", state.next_seq, 0);
            state.entries.push((id.clone(), payload.to_string()));
            id
        };
        self.stream_notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut store = self.lock();
        let state = store.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let _ = consumer;
        let deadline = Instant::now() + block;

        loop {
            {
                let mut store = self.lock();
                let entries = Self::try_read(&mut store, group, streams, count)?;
                if !entries.is_empty() {
                    return Ok(entries);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            let notified = self.stream_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut store = self.lock();
        if let Some(state) = store
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            state.pending.remove(id);
        }
        Ok(())
    }
}
