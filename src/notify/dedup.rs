use std::collections::{HashMap, VecDeque};

use crate::TriggerId;

type Key = (String, TriggerId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    InProgress,
    Delivered,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns delivery of this key and must `complete` or `abandon` it.
    Claimed,
    /// Another worker is delivering it right now.
    InProgress,
    Delivered,
}

/// Bounded set of recently delivered `(sink, trigger)` pairs.
///
/// Oldest delivered entries are evicted first once `capacity` is exceeded.
/// Entries still in progress are never evicted.
#[derive(Debug)]
pub struct RecentlyDelivered {
    capacity: usize,
    entries: HashMap<Key, Entry>,
    order: VecDeque<Key>,
}

impl RecentlyDelivered {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn try_claim(&mut self, sink: &str, id: TriggerId) -> Claim {
        let key = (sink.to_string(), id);
        match self.entries.get(&key) {
            Some(Entry::Delivered) => Claim::Delivered,
            Some(Entry::InProgress) => Claim::InProgress,
            None => {
                self.entries.insert(key.clone(), Entry::InProgress);
                self.order.push_back(key);
                self.evict();
                Claim::Claimed
            }
        }
    }

    pub fn complete(&mut self, sink: &str, id: TriggerId) {
        if let Some(entry) = self.entries.get_mut(&(sink.to_string(), id)) {
            *entry = Entry::Delivered;
        }
        self.evict();
    }

    /// Drop a failed claim so a later duplicate outcome may try again.
    pub fn abandon(&mut self, sink: &str, id: TriggerId) {
        let key = (sink.to_string(), id);
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        let mut budget = self.order.len();
        while self.entries.len() > self.capacity && budget > 0 {
            budget -= 1;
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key) == Some(&Entry::InProgress) {
                self.order.push_back(key);
            } else {
                self.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TriggerId {
        TriggerId::from_raw(raw)
    }

    #[test]
    fn claim_is_exclusive_per_sink() {
        let mut set = RecentlyDelivered::new(8);
        assert_eq!(set.try_claim("mqtt", id(1)), Claim::Claimed);
        assert_eq!(set.try_claim("mqtt", id(1)), Claim::InProgress);
        assert_eq!(set.try_claim("log", id(1)), Claim::Claimed);
        set.complete("mqtt", id(1));
        assert_eq!(set.try_claim("mqtt", id(1)), Claim::Delivered);
    }

    #[test]
    fn abandoned_claim_can_be_retaken() {
        let mut set = RecentlyDelivered::new(8);
        assert_eq!(set.try_claim("mqtt", id(1)), Claim::Claimed);
        set.abandon("mqtt", id(1));
        assert!(set.is_empty());
        assert_eq!(set.try_claim("mqtt", id(1)), Claim::Claimed);
    }

    #[test]
    fn oldest_delivered_entries_are_evicted() {
        let mut set = RecentlyDelivered::new(2);
        for raw in 1..=3 {
            set.try_claim("log", id(raw));
            set.complete("log", id(raw));
        }
        assert_eq!(set.len(), 2);
        assert_eq!(set.try_claim("log", id(1)), Claim::Claimed);
        assert_eq!(set.try_claim("log", id(3)), Claim::Delivered);
    }

    #[test]
    fn in_progress_entries_survive_eviction() {
        let mut set = RecentlyDelivered::new(1);
        set.try_claim("log", id(1));
        set.try_claim("log", id(2));
        // Both in progress; capacity is exceeded but nothing is evictable.
        assert_eq!(set.len(), 2);
        set.complete("log", id(1));
        assert_eq!(set.len(), 1);
        assert_eq!(set.try_claim("log", id(2)), Claim::InProgress);
    }
}
