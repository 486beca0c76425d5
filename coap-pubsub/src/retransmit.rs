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

//! Reliable delivery of confirmable messages.
//!
//! One entry per outstanding CON message. Entries live in a single sorted
//! deadline queue; a periodic tick pops everything due and either
//! retransmits (doubling the timeout) or gives up after `MAX_RETRANSMIT`
//! retries. `NSTART` = 1 is enforced per peer: one CON in flight at a time,
//! the rest wait in a bounded backlog.

use super::message::{MsgId, MsgToken};
use super::trans_params::TransParams;
use super::Error;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Identifier of one retransmission entry.
pub type RetransId = u64;

/// A datagram that should be written to the socket now.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Transmit<P> {
    /// Destination peer.
    pub peer: P,

    /// The exact serialized bytes to send.
    pub bytes: Vec<u8>,
}

/// An entry that completed: its ACK (or RST) arrived.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Confirmed<P> {
    /// Peer the message was sent to.
    pub peer: P,

    /// Message id of the confirmable message.
    pub msg_id: MsgId,

    /// Token carried by the confirmable message.
    pub token: MsgToken,
}

/// An entry that exhausted all retransmissions.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Exhausted<P> {
    /// Peer the message was being sent to.
    pub peer: P,

    /// Message id of the abandoned message.
    pub msg_id: MsgId,

    /// Token carried by the abandoned message.
    pub token: MsgToken,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EntryState {
    InFlight,
    Queued,
}

#[derive(Debug)]
struct Entry<P> {
    peer: P,
    msg_id: MsgId,
    token: MsgToken,
    bytes: Vec<u8>,
    state: EntryState,
    /// Number of transmissions performed so far.
    attempts: u32,
    timeout: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct PeerState {
    in_flight: Option<RetransId>,
    backlog: VecDeque<RetransId>,
}

/// Tracker for outstanding confirmable messages.
#[derive(Debug)]
pub struct Retransmitter<P> {
    params: TransParams,
    entries: HashMap<RetransId, Entry<P>>,
    queue: BinaryHeap<Reverse<(Instant, RetransId)>>,
    peers: HashMap<P, PeerState>,
    next_id: RetransId,
    max_backlog: usize,
}

impl<P: Copy + Eq + Hash> Retransmitter<P> {
    /// Creates a new retransmitter.
    ///
    /// `max_backlog` bounds how many CON messages may wait behind the
    /// in-flight one for a single peer; beyond that, sends fail locally
    /// with [`Error::Congested`].
    pub fn new(params: TransParams, max_backlog: usize) -> Retransmitter<P> {
        Retransmitter {
            params,
            entries: HashMap::new(),
            queue: BinaryHeap::new(),
            peers: HashMap::new(),
            next_id: 1,
            max_backlog,
        }
    }

    /// Registers a confirmable message for reliable delivery.
    ///
    /// If the peer has no CON in flight, the message should be transmitted
    /// immediately and the returned `Transmit` is `Some`. Otherwise it is
    /// queued behind the in-flight exchange (`NSTART` = 1).
    pub fn enqueue(
        &mut self,
        peer: P,
        msg_id: MsgId,
        token: MsgToken,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<(RetransId, Option<Transmit<P>>), Error> {
        let peer_state = self.peers.entry(peer).or_default();

        if peer_state.in_flight.is_some() && peer_state.backlog.len() >= self.max_backlog {
            return Err(Error::Congested);
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut entry = Entry {
            peer,
            msg_id,
            token,
            bytes,
            state: EntryState::Queued,
            attempts: 0,
            timeout: Duration::from_secs(0),
            deadline: now,
        };

        let transmit = if peer_state.in_flight.is_none() {
            peer_state.in_flight = Some(id);

            entry.state = EntryState::InFlight;
            entry.attempts = 1;
            entry.timeout = self.params.initial_retransmit_timeout();
            entry.deadline = now + entry.timeout;

            self.queue.push(Reverse((entry.deadline, id)));

            Some(Transmit {
                peer,
                bytes: entry.bytes.clone(),
            })
        } else {
            peer_state.backlog.push_back(id);
            None
        };

        self.entries.insert(id, entry);

        Ok((id, transmit))
    }

    /// Processes a matching ACK. Returns the confirmed entry and any queued
    /// message promoted into flight (which must be transmitted now).
    pub fn acknowledge(
        &mut self,
        peer: P,
        msg_id: MsgId,
        now: Instant,
    ) -> Option<(Confirmed<P>, Option<Transmit<P>>)> {
        let id = self.find_in_flight(peer, msg_id)?;
        let entry = self.entries.remove(&id)?;

        let confirmed = Confirmed {
            peer: entry.peer,
            msg_id: entry.msg_id,
            token: entry.token,
        };

        if let Some(peer_state) = self.peers.get_mut(&peer) {
            peer_state.in_flight = None;
        }

        let promoted = self.promote_next(peer, now);

        Some((confirmed, promoted))
    }

    /// Processes a matching RST. The entry is dropped exactly as for an ACK;
    /// the caller decides what the reset means for the exchange.
    pub fn reject(
        &mut self,
        peer: P,
        msg_id: MsgId,
        now: Instant,
    ) -> Option<(Confirmed<P>, Option<Transmit<P>>)> {
        self.acknowledge(peer, msg_id, now)
    }

    /// Pops all due entries: retransmissions to perform now, and entries
    /// that exhausted their retries.
    pub fn poll_due(&mut self, now: Instant) -> (Vec<Transmit<P>>, Vec<Exhausted<P>>) {
        let mut transmits = Vec::new();
        let mut exhausted = Vec::new();

        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            if deadline > now {
                break;
            }
            let _ = self.queue.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                continue; // Completed earlier; stale heap entry.
            };

            if entry.state != EntryState::InFlight || entry.deadline != deadline {
                continue; // Rescheduled; a fresher heap entry exists.
            }

            if entry.attempts > self.params.max_retransmit {
                let entry = self.entries.remove(&id).unwrap();
                exhausted.push(Exhausted {
                    peer: entry.peer,
                    msg_id: entry.msg_id,
                    token: entry.token,
                });

                if let Some(peer_state) = self.peers.get_mut(&entry.peer) {
                    if peer_state.in_flight == Some(id) {
                        peer_state.in_flight = None;
                    }
                }

                if let Some(promoted) = self.promote_next(entry.peer, now) {
                    transmits.push(promoted);
                }
                continue;
            }

            entry.attempts += 1;
            entry.timeout *= 2;
            entry.deadline = now + entry.timeout;
            self.queue.push(Reverse((entry.deadline, id)));

            transmits.push(Transmit {
                peer: entry.peer,
                bytes: entry.bytes.clone(),
            });
        }

        (transmits, exhausted)
    }

    /// Drops every entry (in flight or queued) carrying `token` for `peer`.
    /// Used when an observation is cancelled.
    pub fn cancel_token(&mut self, peer: P, token: MsgToken, now: Instant) -> Option<Transmit<P>> {
        let ids: Vec<RetransId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.peer == peer && e.token == token)
            .map(|(id, _)| *id)
            .collect();

        let mut was_in_flight = false;
        for id in ids {
            self.entries.remove(&id);
            if let Some(peer_state) = self.peers.get_mut(&peer) {
                if peer_state.in_flight == Some(id) {
                    peer_state.in_flight = None;
                    was_in_flight = true;
                }
                peer_state.backlog.retain(|queued| *queued != id);
            }
        }

        if was_in_flight {
            self.promote_next(peer, now)
        } else {
            None
        }
    }

    /// Drops all state for a peer (session teardown), returning the
    /// abandoned entries.
    pub fn remove_peer(&mut self, peer: P) -> Vec<Exhausted<P>> {
        self.peers.remove(&peer);

        let ids: Vec<RetransId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| Exhausted {
                peer: entry.peer,
                msg_id: entry.msg_id,
                token: entry.token,
            })
            .collect()
    }

    /// Returns true if `peer` currently has a CON in flight.
    pub fn has_in_flight(&self, peer: P) -> bool {
        self.peers
            .get(&peer)
            .map(|state| state.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Number of tracked entries (in flight plus queued).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is being tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The deadline of the next scheduled event, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn find_in_flight(&self, peer: P, msg_id: MsgId) -> Option<RetransId> {
        let id = self.peers.get(&peer)?.in_flight?;
        let entry = self.entries.get(&id)?;

        if entry.msg_id == msg_id {
            Some(id)
        } else {
            None
        }
    }

    fn promote_next(&mut self, peer: P, now: Instant) -> Option<Transmit<P>> {
        let peer_state = self.peers.get_mut(&peer)?;

        let id = loop {
            let candidate = peer_state.backlog.pop_front()?;
            if self.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        peer_state.in_flight = Some(id);

        let entry = self.entries.get_mut(&id).unwrap();
        entry.state = EntryState::InFlight;
        entry.attempts = 1;
        entry.timeout = self.params.initial_retransmit_timeout();
        entry.deadline = now + entry.timeout;

        self.queue.push(Reverse((entry.deadline, id)));

        Some(Transmit {
            peer,
            bytes: entry.bytes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retransmitter() -> Retransmitter<&'static str> {
        Retransmitter::new(TransParams::default(), 8)
    }

    #[test]
    fn five_attempts_then_exhausted() {
        let mut rt = retransmitter();
        let start = Instant::now();

        let (_, transmit) = rt
            .enqueue("peer", 0x100, MsgToken::from(1u32), vec![1, 2, 3], start)
            .unwrap();
        assert!(transmit.is_some());

        let mut sends = 1;
        let mut now = start;

        loop {
            let deadline = match rt.next_deadline() {
                Some(deadline) => deadline,
                None => break,
            };
            now = deadline;
            let (transmits, exhausted) = rt.poll_due(now);
            sends += transmits.len();

            if !exhausted.is_empty() {
                assert_eq!(exhausted[0].msg_id, 0x100);
                break;
            }
        }

        // 1 initial + MAX_RETRANSMIT retransmissions.
        assert_eq!(sends, 5);
        assert!(rt.is_empty());

        // Total elapsed is the sum of five doubling timeouts; each initial
        // timeout is within [2 s, 3 s], so the span is within [62 s, 93 s].
        let total = now.duration_since(start);
        assert!(total >= Duration::from_secs(62), "total: {:?}", total);
        assert!(total <= Duration::from_secs(93), "total: {:?}", total);
    }

    #[test]
    fn ack_stops_retransmission() {
        let mut rt = retransmitter();
        let now = Instant::now();

        rt.enqueue("peer", 0x200, MsgToken::from(2u32), vec![0xAB], now)
            .unwrap();

        let (confirmed, promoted) = rt.acknowledge("peer", 0x200, now).unwrap();
        assert_eq!(confirmed.token, MsgToken::from(2u32));
        assert!(promoted.is_none());
        assert!(rt.is_empty());

        // A later tick produces nothing.
        let (transmits, exhausted) = rt.poll_due(now + Duration::from_secs(100));
        assert!(transmits.is_empty());
        assert!(exhausted.is_empty());
    }

    #[test]
    fn ack_with_wrong_msg_id_is_ignored() {
        let mut rt = retransmitter();
        let now = Instant::now();

        rt.enqueue("peer", 0x300, MsgToken::from(3u32), vec![1], now)
            .unwrap();
        assert!(rt.acknowledge("peer", 0x999, now).is_none());
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn nstart_serializes_per_peer() {
        let mut rt = retransmitter();
        let now = Instant::now();

        let (_, first) = rt
            .enqueue("peer", 1, MsgToken::from(1u32), vec![1], now)
            .unwrap();
        assert!(first.is_some());

        let (_, second) = rt
            .enqueue("peer", 2, MsgToken::from(2u32), vec![2], now)
            .unwrap();
        assert!(second.is_none(), "second CON must queue behind the first");

        // A different peer is not blocked.
        let (_, other) = rt
            .enqueue("other", 3, MsgToken::from(3u32), vec![3], now)
            .unwrap();
        assert!(other.is_some());

        // Acknowledging the first promotes the second.
        let (_, promoted) = rt.acknowledge("peer", 1, now).unwrap();
        let promoted = promoted.expect("queued CON should be promoted");
        assert_eq!(promoted.bytes, vec![2]);
    }

    #[test]
    fn backlog_is_bounded() {
        let mut rt = Retransmitter::new(TransParams::default(), 2);
        let now = Instant::now();

        rt.enqueue("peer", 1, MsgToken::from(1u32), vec![1], now)
            .unwrap();
        rt.enqueue("peer", 2, MsgToken::from(2u32), vec![2], now)
            .unwrap();
        rt.enqueue("peer", 3, MsgToken::from(3u32), vec![3], now)
            .unwrap();

        assert_eq!(
            rt.enqueue("peer", 4, MsgToken::from(4u32), vec![4], now)
                .err(),
            Some(Error::Congested)
        );
    }

    #[test]
    fn backoff_doubles() {
        let mut rt = retransmitter();
        let start = Instant::now();

        rt.enqueue("peer", 1, MsgToken::from(1u32), vec![1], start)
            .unwrap();

        let first_deadline = rt.next_deadline().unwrap();
        let first_timeout = first_deadline.duration_since(start);
        assert!(first_timeout >= Duration::from_secs(2));
        assert!(first_timeout <= Duration::from_secs(3));

        let (transmits, _) = rt.poll_due(first_deadline);
        assert_eq!(transmits.len(), 1);

        let second_deadline = rt.next_deadline().unwrap();
        assert_eq!(
            second_deadline.duration_since(first_deadline),
            first_timeout * 2
        );
    }

    #[test]
    fn cancel_token_promotes_backlog() {
        let mut rt = retransmitter();
        let now = Instant::now();

        let token_a = MsgToken::from(0xAAu32);
        let token_b = MsgToken::from(0xBBu32);

        rt.enqueue("peer", 1, token_a, vec![1], now).unwrap();
        rt.enqueue("peer", 2, token_b, vec![2], now).unwrap();

        let promoted = rt.cancel_token("peer", token_a, now);
        assert_eq!(promoted.map(|t| t.bytes), Some(vec![2]));
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn remove_peer_reports_abandoned() {
        let mut rt = retransmitter();
        let now = Instant::now();

        rt.enqueue("peer", 1, MsgToken::from(1u32), vec![1], now)
            .unwrap();
        rt.enqueue("peer", 2, MsgToken::from(2u32), vec![2], now)
            .unwrap();

        let abandoned = rt.remove_peer("peer");
        assert_eq!(abandoned.len(), 2);
        assert!(rt.is_empty());
    }
}
