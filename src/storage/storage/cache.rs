use linked_hash_map::LinkedHashMap;
use super::Page;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub struct LRUCache {
    pub map: LinkedHashMap<u64, Arc<RwLock<Page>>>,
    pinned: HashSet<u64>,
    capacity: usize,
}

impl LRUCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: LinkedHashMap::new(),
            pinned: HashSet::new(),
            capacity,
        }
    }

    // get the latest page and move it to the back
    pub fn get(&mut self, key: &u64) -> Option<&mut Arc<RwLock<Page>>> {
        self.map.get_refresh(key)
    }

    pub fn contains(&self, key: &u64) -> bool {
        self.map.contains_key(key)
    }

    // insert value, if the cache is full, remove the oldest unpinned one
    pub fn insert(&mut self, key: u64, value: Arc<RwLock<Page>>) -> Option<(u64, Arc<RwLock<Page>>)> {
        // if exists, remove it first
        self.map.remove(&key);

        // insert (become the latest automatically)
        self.map.insert(key, value);

        if self.map.len() <= self.capacity {
            return None;
        }
        // pinned pages rotate to the back instead of being evicted
        let mut attempts = self.map.len();
        while attempts > 0 {
            let (k, v) = self.map.pop_front()?;
            if self.pinned.contains(&k) {
                self.map.insert(k, v);
                attempts -= 1;
                continue;
            }
            return Some((k, v));
        }
        None
    }

    /// Mark a page so it is never evicted
    pub fn pin(&mut self, key: u64) {
        self.pinned.insert(key);
    }

    /// remove a page from cache
    /// WARN: if the page is dirty, it will be lost!
    pub fn remove(&mut self, key: &u64) -> Option<Arc<RwLock<Page>>> {
        self.pinned.remove(key);
        self.map.remove(key)
    }

    /// drop every cached page, keeping the pin markers
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn max_key(&self) -> Option<u64> {
        self.map.keys().max().copied()
    }
}
