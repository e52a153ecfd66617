// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// One bit per possible packet id, mirrors FIFO membership exactly so the
/// duplicate test is a single word lookup.
struct IdBitmap(Vec<u64>);

impl IdBitmap {
    fn new() -> Self {
        Self(vec![0; (usize::from(u16::MAX) + 1) / 64])
    }

    fn contains(&self, id: u16) -> bool {
        self.0[usize::from(id) / 64] & (1 << (id % 64)) != 0
    }

    fn insert(&mut self, id: u16) {
        self.0[usize::from(id) / 64] |= 1 << (id % 64);
    }

    fn remove(&mut self, id: u16) {
        self.0[usize::from(id) / 64] &= !(1 << (id % 64));
    }
}

struct TopicWindow {
    /// Insertion order with expiry deadlines; deadlines are monotonic so
    /// expired entries always sit at the front.
    fifo: VecDeque<(u16, Instant)>,
    seen: IdBitmap,
}

impl TopicWindow {
    fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            seen: IdBitmap::new(),
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((id, deadline)) = self.fifo.front() {
            if *deadline > now {
                break;
            }
            self.seen.remove(*id);
            self.fifo.pop_front();
        }
    }
}

/// Bounded per-topic memory of recently seen packet ids, used to suppress
/// re-delivery of `QoS` 1/2 publishes the broker retransmitted.
///
/// Duplicates are still acknowledged on the wire; only the application
/// visible delivery is suppressed.
pub(crate) struct DedupCache {
    topics: HashMap<String, TopicWindow>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            topics: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Record `id` under `topic`. Returns true when the id was already in
    /// the window, meaning this packet is a duplicate delivery.
    ///
    /// Eviction is lazy: expired entries go first, then the oldest entry
    /// when the window is at capacity.
    pub fn observe(&mut self, topic: &str, id: u16, now: Instant) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let window = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicWindow::new);

        window.evict_expired(now);
        if window.seen.contains(id) {
            return true;
        }
        if window.fifo.len() >= self.capacity {
            if let Some((oldest, _)) = window.fifo.pop_front() {
                window.seen.remove(oldest);
            }
        }
        window.fifo.push_back((id, now + self.ttl));
        window.seen.insert(id);
        false
    }

    /// Periodic eviction so idle topics do not pin memory until their next
    /// publish.
    pub fn sweep(&mut self, now: Instant) {
        self.topics.retain(|_, window| {
            window.evict_expired(now);
            !window.fifo.is_empty()
        });
    }

    #[cfg(test)]
    fn contains(&self, topic: &str, id: u16) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|window| window.seen.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_duplicate_within_window_is_suppressed() {
        let mut cache = DedupCache::new(1000, TTL);
        let now = Instant::now();
        assert!(!cache.observe("topic", 1, now));
        assert!(cache.observe("topic", 1, now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_windows_are_per_topic() {
        let mut cache = DedupCache::new(1000, TTL);
        let now = Instant::now();
        assert!(!cache.observe("a", 1, now));
        assert!(!cache.observe("b", 1, now));
        assert!(cache.observe("a", 1, now));
    }

    #[tokio::test]
    async fn test_expired_entry_is_forgotten() {
        let mut cache = DedupCache::new(1000, TTL);
        let now = Instant::now();
        assert!(!cache.observe("topic", 1, now));
        assert!(!cache.observe("topic", 1, now + TTL + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(3, TTL);
        let now = Instant::now();
        for id in 1..=3 {
            assert!(!cache.observe("topic", id, now + Duration::from_millis(u64::from(id))));
        }
        // Window full, inserting a fourth id evicts id 1.
        assert!(!cache.observe("topic", 4, now + Duration::from_millis(10)));
        assert!(!cache.contains("topic", 1));
        assert!(cache.contains("topic", 2));

        // Id 1 can now be seen again as new.
        assert!(!cache.observe("topic", 1, now + Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_bitmap_mirrors_fifo() {
        let mut cache = DedupCache::new(2, TTL);
        let now = Instant::now();
        cache.observe("topic", 10, now);
        cache.observe("topic", 20, now + Duration::from_millis(1));
        cache.observe("topic", 30, now + Duration::from_millis(2));

        let window = cache.topics.get("topic").unwrap();
        assert_eq!(window.fifo.len(), 2);
        for id in [0u16, 10, 20, 30, 40] {
            let in_fifo = window.fifo.iter().any(|(entry, _)| *entry == id);
            assert_eq!(window.seen.contains(id), in_fifo, "id {id}");
        }
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_topics() {
        let mut cache = DedupCache::new(1000, TTL);
        let now = Instant::now();
        cache.observe("topic", 1, now);
        assert_eq!(cache.topics.len(), 1);

        cache.sweep(now + TTL + Duration::from_millis(1));
        assert!(cache.topics.is_empty());
    }
}
