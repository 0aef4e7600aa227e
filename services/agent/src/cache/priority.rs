//! Indexed binary min-heap implementation of [`CacheManager`].

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::{CacheConfig, CacheError, CacheManager, CacheResult};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    priority: i64,
    /// Add/update order; breaks priority ties.
    seq: u64,
}

impl Entry {
    fn key(&self) -> (i64, u64) {
        (self.priority, self.seq)
    }
}

/// Heap ordered by `(priority, seq)` plus a map of each id's heap slot.
#[derive(Debug, Default)]
struct IndexedHeap {
    entries: Vec<Entry>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl IndexedHeap {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn max_priority(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.priority).max()
    }

    fn push(&mut self, id: &str, priority: i64) {
        let seq = self.next_seq();
        let index = self.entries.len();
        self.entries.push(Entry {
            id: id.to_string(),
            priority,
            seq,
        });
        self.positions.insert(id.to_string(), index);
        self.sift_up(index);
    }

    fn set_priority(&mut self, index: usize, priority: i64) {
        let seq = self.next_seq();
        let entry = &mut self.entries[index];
        entry.priority = priority;
        entry.seq = seq;
        self.fix(index);
    }

    fn remove_at(&mut self, index: usize) -> Entry {
        let removed = self.entries.swap_remove(index);
        self.positions.remove(&removed.id);
        if let Some(moved) = self.entries.get(index) {
            self.positions.insert(moved.id.clone(), index);
            self.fix(index);
        }
        removed
    }

    fn fix(&mut self, index: usize) {
        if !self.sift_up(index) {
            self.sift_down(index);
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].key() < self.entries[b].key()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        for index in [a, b] {
            if let Some(position) = self.positions.get_mut(&self.entries[index].id) {
                *position = index;
            }
        }
    }

    /// Returns true if the entry moved.
    fn sift_up(&mut self, mut index: usize) -> bool {
        let start = index;
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index != start
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Thread-safe [`CacheManager`] backed by an indexed binary heap.
///
/// `peek`/`evict` are O(log n); `exists`/`get` are O(1).
#[derive(Debug, Default)]
pub struct PriorityCache {
    config: CacheConfig,
    heap: Mutex<IndexedHeap>,
}

impl PriorityCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            heap: Mutex::new(IndexedHeap::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl CacheManager for PriorityCache {
    fn add(&self, id: &str, priority: i64) -> CacheResult<()> {
        let mut heap = self.heap.lock();
        if heap.positions.contains_key(id) {
            return Err(CacheError::AlreadyExists(id.to_string()));
        }
        heap.push(id, priority);
        debug!(id, priority, "Cache entry added");
        Ok(())
    }

    fn add_default(&self, id: &str) -> CacheResult<()> {
        let mut heap = self.heap.lock();
        if heap.positions.contains_key(id) {
            return Err(CacheError::AlreadyExists(id.to_string()));
        }
        let priority = self.config.default_priority.resolve(heap.max_priority());
        heap.push(id, priority);
        debug!(id, priority, "Cache entry added with default priority");
        Ok(())
    }

    fn update(&self, id: &str, priority: i64) -> CacheResult<()> {
        let mut heap = self.heap.lock();
        let index = *heap
            .positions
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        heap.set_priority(index, priority);
        Ok(())
    }

    fn update_default(&self, id: &str) -> CacheResult<()> {
        let mut heap = self.heap.lock();
        let index = *heap
            .positions
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        let priority = self.config.default_priority.resolve(heap.max_priority());
        heap.set_priority(index, priority);
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.heap.lock().positions.contains_key(id)
    }

    fn get(&self, id: &str) -> CacheResult<i64> {
        let heap = self.heap.lock();
        heap.positions
            .get(id)
            .map(|index| heap.entries[*index].priority)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> CacheResult<()> {
        let mut heap = self.heap.lock();
        let index = *heap
            .positions
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        heap.remove_at(index);
        debug!(id, "Cache entry deleted");
        Ok(())
    }

    fn get_items(&self) -> (Vec<String>, Vec<i64>) {
        let mut entries = self.heap.lock().entries.clone();
        entries.sort_by_key(Entry::key);
        entries.into_iter().map(|e| (e.id, e.priority)).unzip()
    }

    fn peek(&self) -> CacheResult<(String, i64)> {
        let heap = self.heap.lock();
        heap.entries
            .first()
            .map(|e| (e.id.clone(), e.priority))
            .ok_or(CacheError::Empty)
    }

    fn evict(&self) -> CacheResult<(String, i64)> {
        let mut heap = self.heap.lock();
        if heap.entries.is_empty() {
            return Err(CacheError::Empty);
        }
        let entry = heap.remove_at(0);
        debug!(id = %entry.id, priority = entry.priority, "Cache entry evicted");
        Ok((entry.id, entry.priority))
    }

    fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }
}
