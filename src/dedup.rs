//! Deduplication Cache
//!
//! Collapses bursts of identical updates for the same entity. Owned by the
//! ingestion task, so it needs no locking. A miss only costs an extra write,
//! never graph correctness.

use crate::envelope::{EntityKind, Envelope, WriteMode};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

type Fingerprint = [u8; 32];
type Key = (EntityKind, WriteMode, String);

struct Entry {
    fingerprint: Fingerprint,
    seen_at: Instant,
    seq: u64,
}

pub struct DedupCache {
    window: Duration,
    max_entries: usize,
    entries: HashMap<Key, Entry>,
    /// Keys ordered by admission, oldest first.
    by_age: BTreeMap<(Instant, u64), Key>,
    next_seq: u64,
}

impl DedupCache {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Returns `true` when the envelope should be forwarded, `false` on a
    /// dedup hit.
    ///
    /// A hit does not refresh the entry, so an unchanged value is written
    /// at least once per window and `last_updated` keeps moving in the
    /// store.
    pub fn admit(&mut self, env: &Envelope, now: Instant) -> bool {
        let fingerprint = fingerprint(env);
        let key = (env.kind, env.mode, env.entity_id.clone());

        if let Some(entry) = self.entries.get(&key) {
            let fresh = now.saturating_duration_since(entry.seen_at) < self.window;
            if fresh && entry.fingerprint == fingerprint {
                return false;
            }
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room(now);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_age.insert((now, seq), key.clone());
        let previous = self.entries.insert(
            key,
            Entry {
                fingerprint,
                seen_at: now,
                seq,
            },
        );
        if let Some(old) = previous {
            self.by_age.remove(&(old.seen_at, old.seq));
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops expired entries from the old end, then the oldest live one if
    /// the cache is still full. Each removal is logarithmic.
    fn make_room(&mut self, now: Instant) {
        while let Some((&(seen_at, _), _)) = self.by_age.first_key_value() {
            if now.saturating_duration_since(seen_at) < self.window {
                break;
            }
            self.pop_oldest();
        }

        if self.entries.len() >= self.max_entries {
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((_, key)) = self.by_age.pop_first() {
            self.entries.remove(&key);
        }
    }
}

/// Content hash of the fields that end up in the store. Receive time is
/// excluded so identical repeats share a fingerprint.
fn fingerprint(env: &Envelope) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(env.parent_id.as_deref().unwrap_or("").as_bytes());
    hasher.update(&[0]);
    for (key, value) in &env.attributes {
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update(&[0]);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn camera(id: &str, fov: i64) -> Envelope {
        let mut attributes = crate::envelope::Attributes::new();
        attributes.insert("fov".to_string(), json!(fov));
        Envelope {
            kind: EntityKind::Camera,
            entity_id: id.to_string(),
            parent_id: Some("scene-root".to_string()),
            attributes,
            received_at: Utc::now(),
            mode: WriteMode::Replace,
        }
    }

    #[test]
    fn test_identical_envelope_within_window_is_suppressed() {
        let mut cache = DedupCache::new(Duration::from_millis(1000), 100);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 60), t0));
        assert!(!cache.admit(&camera("cam1", 60), t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_changed_attributes_are_forwarded() {
        let mut cache = DedupCache::new(Duration::from_millis(1000), 100);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 60), t0));
        assert!(cache.admit(&camera("cam1", 65), t0 + Duration::from_millis(10)));
        // Flipping back must not be swallowed by a stale fingerprint.
        assert!(cache.admit(&camera("cam1", 60), t0 + Duration::from_millis(20)));
    }

    #[test]
    fn test_hit_does_not_extend_window() {
        let mut cache = DedupCache::new(Duration::from_millis(100), 100);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 60), t0));
        assert!(!cache.admit(&camera("cam1", 60), t0 + Duration::from_millis(60)));
        assert!(cache.admit(&camera("cam1", 60), t0 + Duration::from_millis(120)));
    }

    #[test]
    fn test_different_ids_are_independent() {
        let mut cache = DedupCache::new(Duration::from_millis(1000), 100);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 60), t0));
        assert!(cache.admit(&camera("cam2", 60), t0));
    }

    #[test]
    fn test_bounded_entries() {
        let mut cache = DedupCache::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();

        for i in 0..10 {
            let id = format!("cam{}", i);
            assert!(cache.admit(&camera(&id, 1), t0 + Duration::from_millis(i)));
        }
        assert!(cache.len() <= 3);
        // Oldest entry was evicted, so it is admitted again.
        assert!(cache.admit(&camera("cam0", 1), t0 + Duration::from_millis(20)));
    }

    #[test]
    fn test_expired_entries_swept_before_oldest_eviction() {
        let mut cache = DedupCache::new(Duration::from_millis(50), 2);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 1), t0));
        assert!(cache.admit(&camera("cam2", 1), t0 + Duration::from_millis(40)));
        assert!(cache.admit(&camera("cam3", 1), t0 + Duration::from_millis(60)));

        // cam1 expired and was swept; cam2 survived.
        assert_eq!(cache.len(), 2);
        assert!(!cache.admit(&camera("cam2", 1), t0 + Duration::from_millis(70)));
    }

    #[test]
    fn test_readmitted_key_moves_to_the_young_end() {
        let mut cache = DedupCache::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();

        assert!(cache.admit(&camera("cam1", 1), t0));
        assert!(cache.admit(&camera("cam2", 1), t0 + Duration::from_millis(1)));
        // cam1 changes, so its entry is renewed and cam2 becomes the oldest.
        assert!(cache.admit(&camera("cam1", 2), t0 + Duration::from_millis(2)));
        assert!(cache.admit(&camera("cam3", 1), t0 + Duration::from_millis(3)));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.by_age.len(), 2);
        assert!(!cache.admit(&camera("cam1", 2), t0 + Duration::from_millis(4)));
        assert!(cache.admit(&camera("cam2", 1), t0 + Duration::from_millis(5)));
    }

    #[test]
    fn test_merge_and_replace_updates_are_tracked_apart() {
        let mut cache = DedupCache::new(Duration::from_secs(1), 100);
        let t0 = Instant::now();
        let mut merge = camera("cam1", 60);
        merge.mode = WriteMode::Merge;

        assert!(cache.admit(&camera("cam1", 60), t0));
        assert!(cache.admit(&merge, t0));
        assert!(!cache.admit(&camera("cam1", 60), t0 + Duration::from_millis(1)));
        assert!(!cache.admit(&merge, t0 + Duration::from_millis(1)));
    }
}
