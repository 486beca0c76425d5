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

//! Client-side token/exchange table.
//!
//! Maps (peer, token) to the continuation awaiting the response. Plain
//! request exchanges complete with the first (possibly block-reassembled)
//! response; observation exchanges stay registered and their continuation
//! fires once per notification. The broker's counterpart table (its
//! observation set) lives with the topic data resources in the pub/sub
//! manager.

use super::block::{BlockReconstructor, BlockSegmenter};
use super::message::{MsgToken, OwnedMessage};
use super::observe::ObserveSeq;
use super::ContentFormat;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Completion status handed to an operation's continuation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientStatus {
    /// The request completed with a 2.xx response.
    Ok,

    /// The request completed with a 4.xx/5.xx response, was reset, or the
    /// transport failed.
    Failed,

    /// Retransmissions were exhausted without any reply.
    Timeout,
}

/// Continuation invoked with the outcome of an operation.
///
/// For subscriptions the continuation is invoked once per notification,
/// which is why this is `FnMut` rather than `FnOnce`.
pub type ResponseHandler = Box<dyn FnMut(ClientStatus, Option<&OwnedMessage>) + Send>;

/// Discriminates one-shot requests from long-lived observations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExchangeKind {
    /// A single request/response exchange.
    Request,

    /// An observe registration: the exchange stays alive and yields a
    /// response per notification.
    Observation,
}

/// The request parameters needed to issue follow-up block requests of the
/// same logical transfer (Block2 continuation GETs reuse these).
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    /// Request method.
    pub code: super::message::MsgCode,

    /// Absolute resource path.
    pub uri_path: String,

    /// Uri-Query strings, in order.
    pub queries: Vec<String>,

    /// Whether the request is sent confirmable.
    pub confirmable: bool,
}

/// Client-side state of a `Block1` upload in progress.
#[derive(Debug)]
pub struct BlockUpload {
    /// Segment source for the logical payload.
    pub segmenter: BlockSegmenter,

    /// Index of the next block to send.
    pub next_num: u32,

    /// Content format of the logical payload.
    pub content_format: ContentFormat,
}

/// One outstanding exchange.
pub struct Exchange<P> {
    /// Peer the request was sent to.
    pub peer: P,

    /// Token correlating the exchange.
    pub token: MsgToken,

    /// Request or observation.
    pub kind: ExchangeKind,

    /// Completion/notification continuation.
    pub handler: ResponseHandler,

    /// Parameters for issuing follow-up block requests.
    pub template: RequestTemplate,

    /// Reassembly buffer for a Block2 response in progress.
    pub reassembly: Option<BlockReconstructor>,

    /// Segmentation state for a Block1 upload in progress.
    pub upload: Option<BlockUpload>,

    /// Topic-type filter the subscription was registered with, if any.
    pub filter: Option<String>,

    /// Freshness state of the last accepted notification.
    pub last_observe: Option<(ObserveSeq, Instant)>,

    /// When the exchange was created (or last refreshed, for observations).
    pub created: Instant,
}

impl<P: std::fmt::Debug> std::fmt::Debug for Exchange<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("peer", &self.peer)
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("template", &self.template)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Table of outstanding exchanges, keyed by (peer, token).
#[derive(Debug)]
pub struct ExchangeTable<P> {
    exchanges: HashMap<(P, MsgToken), Exchange<P>>,
    lifetime: Duration,
}

impl<P: Copy + Eq + Hash> ExchangeTable<P> {
    /// Creates a table whose entries expire after `lifetime`
    /// (`EXCHANGE_LIFETIME` for requests).
    pub fn new(lifetime: Duration) -> ExchangeTable<P> {
        ExchangeTable {
            exchanges: HashMap::new(),
            lifetime,
        }
    }

    /// Registers a new exchange.
    pub fn insert(&mut self, exchange: Exchange<P>) {
        self.exchanges
            .insert((exchange.peer, exchange.token), exchange);
    }

    /// Looks up an exchange by (peer, token).
    pub fn get_mut(&mut self, peer: P, token: MsgToken) -> Option<&mut Exchange<P>> {
        self.exchanges.get_mut(&(peer, token))
    }

    /// Returns true if an exchange with this key exists.
    pub fn contains(&self, peer: P, token: MsgToken) -> bool {
        self.exchanges.contains_key(&(peer, token))
    }

    /// Removes and returns an exchange.
    pub fn remove(&mut self, peer: P, token: MsgToken) -> Option<Exchange<P>> {
        self.exchanges.remove(&(peer, token))
    }

    /// Removes and returns the observation registered on `uri_path`, if
    /// any. Used to look up the token to cancel.
    pub fn take_observation_by_path(&mut self, peer: P, uri_path: &str) -> Option<Exchange<P>> {
        let key = self
            .exchanges
            .iter()
            .find(|((entry_peer, _), exchange)| {
                *entry_peer == peer
                    && exchange.kind == ExchangeKind::Observation
                    && exchange.template.uri_path == uri_path
            })
            .map(|(key, _)| *key)?;

        self.exchanges.remove(&key)
    }

    /// Removes request exchanges older than the exchange lifetime.
    /// Observations are long-lived and never age out here.
    pub fn expire(&mut self, now: Instant) -> Vec<Exchange<P>> {
        let lifetime = self.lifetime;
        let expired_keys: Vec<(P, MsgToken)> = self
            .exchanges
            .iter()
            .filter(|(_, exchange)| {
                exchange.kind == ExchangeKind::Request
                    && now.duration_since(exchange.created) >= lifetime
            })
            .map(|(key, _)| *key)
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| self.exchanges.remove(&key))
            .collect()
    }

    /// Removes all exchanges for `peer` (disconnect / session teardown).
    pub fn remove_peer(&mut self, peer: P) -> Vec<Exchange<P>> {
        let keys: Vec<(P, MsgToken)> = self
            .exchanges
            .keys()
            .filter(|(entry_peer, _)| *entry_peer == peer)
            .copied()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.exchanges.remove(&key))
            .collect()
    }

    /// Removes every exchange unconditionally.
    pub fn drain_all(&mut self) -> Vec<Exchange<P>> {
        self.exchanges.drain().map(|(_, exchange)| exchange).collect()
    }

    /// Number of outstanding exchanges.
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Returns true if no exchange is outstanding.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
