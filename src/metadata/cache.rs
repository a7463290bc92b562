use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Bounded most-recently-used cache keyed by canonical URL.
///
/// Reads reorder, so even lookups take the lock exclusively.
pub struct ResolverCache<V> {
    capacity: usize,
    inner: Mutex<LruState<V>>,
}

struct LruState<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> LruState<V> {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

impl<V: Clone> ResolverCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut state = self.inner.lock().await;
        let value = state.entries.get(key).cloned()?;
        state.touch(key);
        Some(value)
    }

    pub async fn put(&self, key: String, value: V) {
        let mut state = self.inner.lock().await;
        if state.entries.insert(key.clone(), value).is_some() {
            state.touch(&key);
            return;
        }
        state.order.push_back(key);
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                log::debug!("[CACHE] evicting {}", oldest);
                state.entries.remove(&oldest);
            }
        }
    }

    /// Membership check that leaves the recency order alone.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut state = self.inner.lock().await;
        state.entries.clear();
        state.order.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
