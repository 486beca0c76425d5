// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Inbound message deduplication.
//!
//! Every inbound CON/NON message is keyed by (peer, message-id). Seeing the
//! same key again within `CACHE_TIMEOUT` means the peer retransmitted: the
//! handler must not run twice, and for CON messages the previously produced
//! response is re-sent byte for byte.

use super::message::MsgId;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// What [`MessageCache::check`] decided about an inbound message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DedupDisposition {
    /// First sighting; dispatch to the handler.
    New,

    /// Duplicate of a message whose response is cached; re-send these bytes.
    DuplicateCached(Vec<u8>),

    /// Duplicate of a message still being processed (or one that produced no
    /// response, such as a NON); drop silently.
    DuplicatePending,
}

#[derive(Debug)]
struct CacheEntry {
    response: Option<Vec<u8>>,
    inserted: Instant,
}

/// Per-peer duplicate-detection cache.
#[derive(Debug)]
pub struct MessageCache<P> {
    entries: HashMap<(P, MsgId), CacheEntry>,
    // Entries all share one timeout, so insertion order is expiry order.
    expiry: VecDeque<(Instant, (P, MsgId))>,
    timeout: Duration,
}

impl<P: Copy + Eq + Hash> MessageCache<P> {
    /// Creates a cache retaining entries for `timeout` (`CACHE_TIMEOUT`).
    pub fn new(timeout: Duration) -> MessageCache<P> {
        MessageCache {
            entries: HashMap::new(),
            expiry: VecDeque::new(),
            timeout,
        }
    }

    /// Classifies an inbound message and, if it is new, records it.
    pub fn check(&mut self, peer: P, msg_id: MsgId, now: Instant) -> DedupDisposition {
        self.expire(now);

        if let Some(entry) = self.entries.get(&(peer, msg_id)) {
            return match &entry.response {
                Some(bytes) => DedupDisposition::DuplicateCached(bytes.clone()),
                None => DedupDisposition::DuplicatePending,
            };
        }

        self.entries.insert(
            (peer, msg_id),
            CacheEntry {
                response: None,
                inserted: now,
            },
        );
        self.expiry.push_back((now, (peer, msg_id)));

        DedupDisposition::New
    }

    /// Attaches the serialized response produced for a previously-checked
    /// message, so later duplicates can be answered from the cache.
    pub fn store_response(&mut self, peer: P, msg_id: MsgId, response: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&(peer, msg_id)) {
            entry.response = Some(response);
        }
    }

    /// Drops entries older than the cache timeout.
    pub fn expire(&mut self, now: Instant) {
        while let Some((inserted, key)) = self.expiry.front() {
            if now.duration_since(*inserted) < self.timeout {
                break;
            }

            // The map entry may have been refreshed or removed; only drop it
            // if the timestamps still agree.
            if let Some(entry) = self.entries.get(key) {
                if entry.inserted == *inserted {
                    self.entries.remove(key);
                }
            }

            let _ = self.expiry.pop_front();
        }
    }

    /// Removes all entries for a peer (session teardown).
    pub fn remove_peer(&mut self, peer: P) {
        self.entries.retain(|(entry_peer, _), _| *entry_peer != peer);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(8);

    #[test]
    fn first_sighting_is_new() {
        let mut cache = MessageCache::new(TIMEOUT);
        let now = Instant::now();
        assert_eq!(cache.check("peer", 1, now), DedupDisposition::New);
        assert_eq!(cache.check("peer", 2, now), DedupDisposition::New);
        assert_eq!(cache.check("other", 1, now), DedupDisposition::New);
    }

    #[test]
    fn duplicate_with_cached_response() {
        let mut cache = MessageCache::new(TIMEOUT);
        let now = Instant::now();

        assert_eq!(cache.check("peer", 7, now), DedupDisposition::New);
        cache.store_response("peer", 7, vec![1, 2, 3]);

        assert_eq!(
            cache.check("peer", 7, now + Duration::from_secs(1)),
            DedupDisposition::DuplicateCached(vec![1, 2, 3])
        );
    }

    #[test]
    fn duplicate_without_response_is_pending() {
        let mut cache = MessageCache::new(TIMEOUT);
        let now = Instant::now();

        assert_eq!(cache.check("peer", 7, now), DedupDisposition::New);
        assert_eq!(
            cache.check("peer", 7, now),
            DedupDisposition::DuplicatePending
        );
    }

    #[test]
    fn entry_expires_after_timeout() {
        let mut cache = MessageCache::new(TIMEOUT);
        let now = Instant::now();

        assert_eq!(cache.check("peer", 7, now), DedupDisposition::New);
        assert_eq!(
            cache.check("peer", 7, now + Duration::from_secs(9)),
            DedupDisposition::New
        );
    }

    #[test]
    fn remove_peer_drops_entries() {
        let mut cache = MessageCache::new(TIMEOUT);
        let now = Instant::now();

        cache.check("a", 1, now);
        cache.check("b", 1, now);
        cache.remove_peer("a");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.check("a", 1, now), DedupDisposition::New);
    }
}
