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

//! The broker: a single-threaded event loop around one datagram socket.
//!
//! Ingress path: datagram → codec → dedup cache → resource dispatch →
//! response assembly → block segmentation → retransmitter → socket. A
//! periodic tick drives retransmission, cache expiry, and confirmable
//! notification refreshes.

use super::block::{BlockFeed, BlockInfo, BlockReconstructor, BlockSegmenter};
use super::config::{NetCoapSettings, PropTree};
use super::consts::{DEFAULT_BLOCK_SZX, DEFAULT_COLLECTION_PATH, OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use super::dedup::{DedupDisposition, MessageCache};
use super::message::{
    MessageDisplay, MessageParser, MessageRead, MessageWrite, MsgCode, MsgId, MsgToken, MsgType,
    VecMessageEncoder,
};
use super::option::{self, OptionInsert, OptionInsertExt};
use super::props::PropValue;
use super::pubsub::{Notification, PubSubManager};
use super::resource::{LinkFilter, ResourceKind, TopicId};
use super::retransmit::{Retransmitter, Transmit};
use super::trans_params::TransParams;
use super::transport::{SecureDatagramSocket, SocketEvent};
use super::{ContentFormat, ETag, Error};
use futures::prelude::*;
use futures_timer::Delay;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Interval of the broker's housekeeping tick.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// How many confirmable notifications may queue behind the in-flight one
/// for a single peer before publishes start failing locally.
const MAX_PEER_BACKLOG: usize = 32;

/// Max-Age hint, in seconds, returned with 5.03 when `max-subscribers` is
/// exceeded.
const RETRY_AFTER_SECS: u32 = 60;

/// A fully-decoded response, before block segmentation and encoding.
#[derive(Debug, Default)]
struct Response {
    code: MsgCode,
    observe: Option<u32>,
    location_path: Option<String>,
    content_format: Option<ContentFormat>,
    max_age: Option<u32>,
    etag: Option<ETag>,
    block1: Option<BlockInfo>,
    block2: Option<BlockInfo>,
    size2: Option<u32>,
    payload: Vec<u8>,
}

impl Response {
    fn code(code: MsgCode) -> Response {
        Response {
            code,
            ..Default::default()
        }
    }

    fn content(
        payload: Vec<u8>,
        content_format: ContentFormat,
    ) -> Response {
        Response {
            code: MsgCode::SuccessContent,
            content_format: Some(content_format),
            payload,
            ..Default::default()
        }
    }
}

/// An inbound block-wise upload being reassembled.
#[derive(Debug)]
struct InboundTransfer {
    reconstructor: BlockReconstructor,
    last_activity: Instant,
}

/// An outbound representation pinned for a block-wise download on a
/// specific (peer, token).
#[derive(Debug)]
struct OutboundTransfer {
    segmenter: BlockSegmenter,
    content_format: Option<ContentFormat>,
    etag: Option<ETag>,
    created: Instant,
}

struct BrokerState<P> {
    manager: PubSubManager<P>,
    dedup: MessageCache<P>,
    retransmitter: Retransmitter<P>,
    uploads: HashMap<(P, MsgToken), InboundTransfer>,
    downloads: HashMap<(P, MsgToken), OutboundTransfer>,
    outbound: Vec<Transmit<P>>,
    next_msg_id: MsgId,
}

impl<P: Copy + Eq + std::hash::Hash> BrokerState<P> {
    fn alloc_msg_id(&mut self) -> MsgId {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }
}

/// A CoAP pub/sub broker bound to one datagram socket.
///
/// The broker owns its entire state; nothing is process-global. Create it,
/// then drive it with [`Broker::run`] on a single-threaded executor.
pub struct Broker<S: SecureDatagramSocket> {
    socket: Arc<S>,
    state: Arc<Mutex<BrokerState<S::PeerId>>>,
    params: TransParams,
    settings: NetCoapSettings,
}

impl<S: SecureDatagramSocket> Clone for Broker<S> {
    fn clone(&self) -> Self {
        Broker {
            socket: self.socket.clone(),
            state: self.state.clone(),
            params: self.params,
            settings: self.settings.clone(),
        }
    }
}

impl<S: SecureDatagramSocket> std::fmt::Debug for Broker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<S: SecureDatagramSocket> Broker<S> {
    /// Creates a broker from a configuration tree and a bound socket, with
    /// the topic collection at the default path.
    pub fn new(cfg: &PropTree, socket: S) -> Result<Broker<S>, Error> {
        Broker::with_collection_path(cfg, socket, DEFAULT_COLLECTION_PATH)
    }

    /// Creates a broker whose topic collection lives at `collection_path`.
    pub fn with_collection_path(
        cfg: &PropTree,
        socket: S,
        collection_path: &str,
    ) -> Result<Broker<S>, Error> {
        let settings = NetCoapSettings::from_tree(cfg)?;
        let params = TransParams::default();

        let state = BrokerState {
            manager: PubSubManager::new(collection_path),
            dedup: MessageCache::new(params.cache_timeout()),
            retransmitter: Retransmitter::new(params, MAX_PEER_BACKLOG),
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            outbound: Vec::new(),
            next_msg_id: rand::random::<MsgId>(),
        };

        Ok(Broker {
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(state)),
            params,
            settings,
        })
    }

    /// The broker-side settings parsed from the configuration tree.
    pub fn settings(&self) -> &NetCoapSettings {
        &self.settings
    }

    /// Path of the topic collection resource.
    pub fn collection_path(&self) -> String {
        self.state
            .lock()
            .expect("lock failure")
            .manager
            .collection_path()
            .to_string()
    }

    /// Number of live subscriptions, across all topics.
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .expect("lock failure")
            .manager
            .subscription_count()
    }

    /// Runs the broker event loop: receive, dispatch, tick. Never returns
    /// except on socket failure.
    pub async fn run(self) -> Result<(), Error> {
        let mut buf = vec![0u8; self.socket.max_datagram_size()];

        loop {
            self.flush().await?;

            let event = {
                let mut recv = self.socket.recv_event(&mut buf).fuse();
                let mut tick = Delay::new(TICK_INTERVAL).fuse();

                futures::select! {
                    event = recv => Some(event),
                    _ = tick => None,
                }
            };

            match event {
                Some(Ok(SocketEvent::Datagram { len, peer })) => {
                    self.handle_datagram(&buf[..len], peer, Instant::now());
                }
                Some(Ok(SocketEvent::SessionClosed { peer })) => {
                    self.handle_session_closed(peer);
                }
                Some(Err(err)) => {
                    log::warn!("Broker socket error: {}", err);
                    return Err(Error::IOError);
                }
                None => {
                    self.tick(Instant::now());
                }
            }
        }
    }

    /// Writes out everything queued by the last dispatch or tick.
    async fn flush(&self) -> Result<(), Error> {
        loop {
            let pending: Vec<Transmit<S::PeerId>> = {
                let mut state = self.state.lock().expect("lock failure");
                std::mem::take(&mut state.outbound)
            };

            if pending.is_empty() {
                return Ok(());
            }

            for transmit in pending {
                if let Err(err) = self.socket.send_to(&transmit.bytes, transmit.peer).await {
                    log::warn!("Broker send to {} failed: {}", transmit.peer, err);
                }
            }
        }
    }

    /// Housekeeping: retransmissions, expiries, confirmable refreshes.
    fn tick(&self, now: Instant) {
        let mut state = self.state.lock().expect("lock failure");

        let (transmits, exhausted) = state.retransmitter.poll_due(now);
        state.outbound.extend(transmits);

        for entry in exhausted {
            // An unreachable observer loses its subscription.
            log::info!(
                "Notification to {} exhausted retransmissions; dropping subscription",
                entry.peer
            );
            state.manager.drop_subscription(entry.peer, entry.token);
        }

        state.dedup.expire(now);

        let lifetime = self.params.exchange_lifetime();
        state
            .uploads
            .retain(|_, transfer| now.duration_since(transfer.last_activity) < lifetime);
        state
            .downloads
            .retain(|_, transfer| now.duration_since(transfer.created) < lifetime);
        state.manager.expire_pinned(now, lifetime);

        let refreshes = state.manager.due_con_refresh(now);
        for notification in refreshes {
            Self::push_notification(&mut state, notification, now);
        }
    }

    /// Tears down all state referencing a peer.
    fn handle_session_closed(&self, peer: S::PeerId) {
        log::info!("Session with {} closed", peer);
        let mut state = self.state.lock().expect("lock failure");

        state.dedup.remove_peer(peer);
        state.retransmitter.remove_peer(peer);
        state.manager.remove_peer(peer);
        state.uploads.retain(|(entry_peer, _), _| *entry_peer != peer);
        state.downloads.retain(|(entry_peer, _), _| *entry_peer != peer);
    }

    /// Decodes and dispatches one inbound datagram.
    fn handle_datagram(&self, bytes: &[u8], peer: S::PeerId, now: Instant) {
        let msg = match MessageParser::new(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("Malformed datagram from {}: {}", peer, err);
                // A malformed CON is answered with a reset carrying its
                // message id; everything else is silently discarded.
                if bytes.len() >= 4 {
                    let msg_type = MsgType::try_from((bytes[0] >> 4) & 0b11);
                    let msg_id = ((bytes[2] as u16) << 8) | bytes[3] as u16;
                    if msg_type == Some(MsgType::Con) {
                        let mut state = self.state.lock().expect("lock failure");
                        let rst = encode_reset(msg_id);
                        state.outbound.push(Transmit { peer, bytes: rst });
                    }
                }
                return;
            }
        };

        log::debug!("Broker <- {}: {}", peer, MessageDisplay(&msg));

        let mut state = self.state.lock().expect("lock failure");
        let state = &mut *state;

        if msg.msg_code().is_method() {
            match msg.msg_type() {
                MsgType::Con | MsgType::Non => {
                    self.handle_request(state, &msg, peer, now);
                }
                _ => {
                    // A method in an ACK or RST is nonsense; ignore.
                }
            }
            return;
        }

        if msg.msg_code().is_empty() {
            match msg.msg_type() {
                MsgType::Con => {
                    // CoAP ping: answer with a reset ("pong").
                    state.outbound.push(Transmit {
                        peer,
                        bytes: encode_reset(msg.msg_id()),
                    });
                }
                MsgType::Ack => {
                    if let Some((_, promoted)) =
                        state.retransmitter.acknowledge(peer, msg.msg_id(), now)
                    {
                        state.outbound.extend(promoted);
                    }
                }
                MsgType::Res => {
                    // A reset of a notification cancels the subscription.
                    if let Some((confirmed, promoted)) =
                        state.retransmitter.reject(peer, msg.msg_id(), now)
                    {
                        state.manager.drop_subscription(peer, confirmed.token);
                        state.retransmitter.cancel_token(peer, confirmed.token, now);
                        state.outbound.extend(promoted);
                    }
                }
                MsgType::Non => {}
            }
        }
    }

    /// Handles one request: dedup, block reassembly, resource dispatch,
    /// response assembly.
    fn handle_request(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        now: Instant,
    ) {
        match state.dedup.check(peer, msg.msg_id(), now) {
            DedupDisposition::New => {}
            DedupDisposition::DuplicateCached(bytes) => {
                log::debug!("Duplicate {:04X} from {}; replaying response", msg.msg_id(), peer);
                state.outbound.push(Transmit { peer, bytes });
                return;
            }
            DedupDisposition::DuplicatePending => {
                log::debug!("Duplicate {:04X} from {}; dropping", msg.msg_id(), peer);
                return;
            }
        }

        let response = self.process_request(state, msg, peer, now);

        let Some(response) = response else {
            return; // Reassembly consumed the block without a final answer.
        };

        let bytes = self.finalize_response(state, msg, peer, response, now);

        state.dedup.store_response(peer, msg.msg_id(), bytes.clone());
        state.outbound.push(Transmit { peer, bytes });
    }

    /// Produces the logical response for a request, running block
    /// reassembly first when needed.
    fn process_request(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        now: Instant,
    ) -> Option<Response> {
        if let Some(unknown) = msg.unknown_critical_option() {
            log::debug!("Unknown critical option {} from {}", unknown, peer);
            return Some(Response::code(MsgCode::ClientErrorBadOption));
        }

        let path = match msg.uri_path_string() {
            Ok(path) => path,
            Err(_) => return Some(Response::code(MsgCode::ClientErrorBadRequest)),
        };
        let queries = match msg.uri_queries() {
            Ok(queries) => queries,
            Err(_) => return Some(Response::code(MsgCode::ClientErrorBadRequest)),
        };

        // Block1: reassemble the request payload.
        let mut payload = msg.payload().to_vec();
        let mut block1_echo = None;

        if let Some(block1) = msg.block1() {
            let key = (peer, msg.msg_token());

            let transfer = state.uploads.entry(key).or_insert_with(|| InboundTransfer {
                reconstructor: BlockReconstructor::new(block1.szx().min(DEFAULT_BLOCK_SZX)),
                last_activity: now,
            });
            transfer.last_activity = now;

            if block1.szx() > transfer.reconstructor.next_block().szx() {
                state.uploads.remove(&key);
                return Some(Response::code(MsgCode::ClientErrorRequestEntityTooLarge));
            }

            if let Some(size1) = msg.size1() {
                transfer.reconstructor.set_size_hint(size1);
            }

            match transfer.reconstructor.feed(block1, msg.payload()) {
                Ok(BlockFeed::More) | Ok(BlockFeed::Duplicate) => {
                    return Some(Response {
                        code: MsgCode::SuccessContinue,
                        block1: Some(block1.with_more_flag()),
                        ..Default::default()
                    });
                }
                Ok(BlockFeed::Finished) => {
                    let transfer = state.uploads.remove(&key).unwrap();
                    payload = transfer.reconstructor.into_payload();
                    block1_echo = Some(block1.without_more_flag());
                }
                Err(Error::TransferTooLarge) => {
                    state.uploads.remove(&key);
                    return Some(Response::code(MsgCode::ClientErrorRequestEntityTooLarge));
                }
                Err(_) => {
                    state.uploads.remove(&key);
                    return Some(Response::code(MsgCode::ClientErrorRequestEntityIncomplete));
                }
            }
        }

        let entry = match state.manager.tree().lookup(&path) {
            Some(entry) => entry.clone(),
            None => return Some(Response::code(MsgCode::ClientErrorNotFound)),
        };

        if !entry.methods.contains(msg.msg_code()) {
            return Some(Response::code(MsgCode::ClientErrorMethodNotAllowed));
        }

        let mut response = match entry.kind {
            ResourceKind::WellKnownCore => self.handle_well_known(state, &queries),
            ResourceKind::TopicCollection => {
                self.handle_collection(state, msg, &path, &queries, &payload)
            }
            ResourceKind::TopicConfig(id) => self.handle_config(state, msg, id, &payload),
            ResourceKind::TopicData(id) => {
                self.handle_data(state, msg, id, peer, &queries, payload, now)
            }
        };

        if response.code.is_success() {
            response.block1 = block1_echo;
        }

        Some(response)
    }

    fn handle_well_known(
        &self,
        state: &mut BrokerState<S::PeerId>,
        queries: &[String],
    ) -> Response {
        let filter = LinkFilter::from_queries(queries.iter().map(String::as_str));
        let listing = state.manager.discovery_listing(&filter);
        Response::content(
            listing.into_bytes(),
            ContentFormat::APPLICATION_LINK_FORMAT,
        )
    }

    fn handle_collection(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        path: &str,
        queries: &[String],
        payload: &[u8],
    ) -> Response {
        match msg.msg_code() {
            MsgCode::MethodGet => {
                let mut filter = LinkFilter::from_queries(queries.iter().map(String::as_str));

                let listing = if filter.is_all() {
                    state.manager.config_listing()
                } else {
                    // Subtree discovery (e.g. `?rt=core.ps.data`): restrict
                    // to resources under the requested path.
                    if filter.href_prefix.is_none() {
                        filter.href_prefix = Some(path.to_string());
                    }
                    state.manager.discovery_listing(&filter)
                };

                Response::content(
                    listing.into_bytes(),
                    ContentFormat::APPLICATION_LINK_FORMAT,
                )
            }
            MsgCode::MethodPost => {
                let props = match PropValue::decode(payload, msg.content_format()) {
                    Ok(props) => props,
                    Err(_) => return Response::code(MsgCode::ClientErrorBadRequest),
                };

                match state.manager.create_topic(&props) {
                    Ok(id) => {
                        let topic = state.manager.topic(id).unwrap();
                        let echo_format = msg
                            .content_format()
                            .filter(|format| format.is_json())
                            .unwrap_or(ContentFormat::APPLICATION_CBOR);
                        let body = topic
                            .cfg
                            .to_props()
                            .encode(echo_format)
                            .unwrap_or_default();

                        log::info!(
                            "Created topic '{}' cfg:{} data:{}",
                            topic.cfg.name,
                            topic.cfg_path,
                            topic.cfg.data_path
                        );

                        Response {
                            code: MsgCode::SuccessCreated,
                            location_path: Some(topic.cfg_path.clone()),
                            content_format: Some(echo_format),
                            payload: body,
                            ..Default::default()
                        }
                    }
                    Err(code) => Response::code(code),
                }
            }
            MsgCode::MethodFetch => {
                let props = match PropValue::decode(payload, msg.content_format()) {
                    Ok(props) => props,
                    Err(_) => return Response::code(MsgCode::ClientErrorBadRequest),
                };

                match state.manager.fetch_collection(&props) {
                    Ok(listing) => Response::content(
                        listing.into_bytes(),
                        ContentFormat::APPLICATION_LINK_FORMAT,
                    ),
                    Err(code) => Response::code(code),
                }
            }
            _ => Response::code(MsgCode::ClientErrorMethodNotAllowed),
        }
    }

    fn handle_config(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        id: TopicId,
        payload: &[u8],
    ) -> Response {
        match msg.msg_code() {
            MsgCode::MethodGet => match state.manager.topic(id) {
                Some(topic) => {
                    let body = topic.cfg.to_props().to_cbor().unwrap_or_default();
                    Response::content(body, ContentFormat::APPLICATION_CBOR)
                }
                None => Response::code(MsgCode::ClientErrorNotFound),
            },
            MsgCode::MethodFetch => {
                let props = match PropValue::decode(payload, msg.content_format()) {
                    Ok(props) => props,
                    Err(_) => return Response::code(MsgCode::ClientErrorBadRequest),
                };

                match state.manager.fetch_cfg(id, &props) {
                    Ok(projection) => Response::content(
                        projection.to_cbor().unwrap_or_default(),
                        ContentFormat::APPLICATION_CBOR,
                    ),
                    Err(code) => Response::code(code),
                }
            }
            MsgCode::MethodIPatch => {
                let props = match PropValue::decode(payload, msg.content_format()) {
                    Ok(props) => props,
                    Err(_) => return Response::code(MsgCode::ClientErrorBadRequest),
                };

                match state.manager.ipatch_cfg(id, &props) {
                    Ok(updated) => Response {
                        code: MsgCode::SuccessChanged,
                        content_format: Some(ContentFormat::APPLICATION_CBOR),
                        payload: updated.to_cbor().unwrap_or_default(),
                        ..Default::default()
                    },
                    Err(code) => Response::code(code),
                }
            }
            MsgCode::MethodDelete => match state.manager.delete_topic(id) {
                Some(topic) => {
                    log::info!("Deleted topic '{}'", topic.cfg.name);
                    Response::code(MsgCode::SuccessDeleted)
                }
                None => Response::code(MsgCode::ClientErrorNotFound),
            },
            _ => Response::code(MsgCode::ClientErrorMethodNotAllowed),
        }
    }

    fn handle_data(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        id: TopicId,
        peer: S::PeerId,
        queries: &[String],
        payload: Vec<u8>,
        now: Instant,
    ) -> Response {
        let topic_type = queries
            .iter()
            .find_map(|query| query.strip_prefix("topic-type=").map(str::to_string));

        match msg.msg_code() {
            MsgCode::MethodPut => {
                match state.manager.publish(
                    id,
                    payload,
                    msg.content_format(),
                    topic_type.as_deref(),
                    now,
                ) {
                    Ok(notifications) => {
                        for notification in notifications {
                            Self::push_notification(state, notification, now);
                        }
                        Response::code(MsgCode::SuccessChanged)
                    }
                    Err(code) => Response::code(code),
                }
            }
            MsgCode::MethodGet => {
                // Continuation of a block-wise notification download: serve
                // the pinned representation.
                if let Some(block2) = msg.block2() {
                    if block2.num() > 0 {
                        if let Some(pinned) =
                            state.manager.topic(id).and_then(|topic| topic.pinned.clone())
                        {
                            return Response {
                                code: MsgCode::SuccessContent,
                                content_format: pinned.content_format,
                                etag: Some(pinned.etag),
                                payload: pinned.payload,
                                ..Default::default()
                            };
                        }
                    }
                }

                match msg.observe() {
                    Some(OBSERVE_REGISTER) => {
                        match state.manager.subscribe(
                            id,
                            peer,
                            msg.msg_token(),
                            topic_type,
                            now,
                        ) {
                            Ok((seq, data)) => {
                                log::info!("Subscribed {} to topic {}", peer, id);
                                let mut response = Response {
                                    code: MsgCode::SuccessContent,
                                    observe: Some(seq.value()),
                                    ..Default::default()
                                };
                                if let Some(data) = data {
                                    response.content_format = data.content_format;
                                    response.etag = Some(data.etag);
                                    response.payload = data.payload;
                                }
                                response
                            }
                            Err(code) => {
                                let mut response = Response::code(code);
                                if code == MsgCode::ServerErrorServiceUnavailable {
                                    response.max_age = Some(RETRY_AFTER_SECS);
                                }
                                response
                            }
                        }
                    }
                    Some(OBSERVE_DEREGISTER) => {
                        match state.manager.unsubscribe(id, peer, msg.msg_token()) {
                            Some((_, data)) => {
                                log::info!("Unsubscribed {} from topic {}", peer, id);
                                let mut response = Response::code(MsgCode::SuccessContent);
                                if let Some(data) = data {
                                    response.content_format = data.content_format;
                                    response.etag = Some(data.etag);
                                    response.payload = data.payload;
                                }
                                response
                            }
                            None => Response::code(MsgCode::ClientErrorNotFound),
                        }
                    }
                    _ => match state.manager.topic(id).and_then(|topic| topic.data.clone()) {
                        Some(data) => Response {
                            code: MsgCode::SuccessContent,
                            content_format: data.content_format,
                            etag: Some(data.etag),
                            payload: data.payload,
                            ..Default::default()
                        },
                        None => Response::code(MsgCode::ClientErrorNotFound),
                    },
                }
            }
            _ => Response::code(MsgCode::ClientErrorMethodNotAllowed),
        }
    }

    /// Applies Block2 segmentation and encodes the final response bytes.
    fn finalize_response(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        mut response: Response,
        now: Instant,
    ) -> Vec<u8> {
        let key = (peer, msg.msg_token());
        let requested = msg.block2();
        let szx = requested
            .map(|block| block.szx())
            .unwrap_or(DEFAULT_BLOCK_SZX)
            .min(DEFAULT_BLOCK_SZX);
        let block_len = 1usize << (szx as usize + 4);

        let needs_blocks = response.payload.len() > block_len
            || requested.map(|block| block.num() > 0).unwrap_or(false);

        if response.code.is_success() && needs_blocks {
            let num = requested.map(|block| block.num()).unwrap_or(0);

            // Resume from the stored transfer when the follow-up request
            // arrives; otherwise pin this (complete) representation.
            if num == 0 || !state.downloads.contains_key(&key) {
                match BlockSegmenter::new(std::mem::take(&mut response.payload), szx) {
                    Ok(segmenter) => {
                        state.downloads.insert(
                            key,
                            OutboundTransfer {
                                segmenter,
                                content_format: response.content_format,
                                etag: response.etag,
                                created: now,
                            },
                        );
                    }
                    Err(_) => {
                        response = Response::code(MsgCode::ServerErrorInternalServerError);
                        return self.encode_response(state, msg, peer, response);
                    }
                }
            }

            let served = state.downloads.get(&key).and_then(|transfer| {
                transfer.segmenter.block_at_szx(num, szx).map(|(block, slice)| {
                    (
                        block,
                        slice.to_vec(),
                        transfer.content_format,
                        transfer.etag,
                        transfer.segmenter.total_len(),
                    )
                })
            });

            match served {
                Some((block, slice, content_format, etag, total_len)) => {
                    response.payload = slice;
                    response.block2 = Some(block);
                    response.content_format = content_format;
                    response.etag = etag;
                    if num == 0 {
                        response.size2 = Some(total_len as u32);
                    }

                    if !block.more_flag() {
                        state.downloads.remove(&key);
                    }
                }
                None => {
                    state.downloads.remove(&key);
                    response = Response::code(MsgCode::ClientErrorBadOption);
                }
            }
        }

        self.encode_response(state, msg, peer, response)
    }

    /// Encodes a response: piggy-backed ACK for CON requests, NON for NON.
    fn encode_response(
        &self,
        state: &mut BrokerState<S::PeerId>,
        msg: &MessageParser<'_>,
        _peer: S::PeerId,
        response: Response,
    ) -> Vec<u8> {
        let mut builder = VecMessageEncoder::new();

        if msg.msg_type().is_con() {
            builder.set_msg_type(MsgType::Ack);
            builder.set_msg_id(msg.msg_id());
        } else {
            builder.set_msg_type(MsgType::Non);
            let msg_id = state.alloc_msg_id();
            builder.set_msg_id(msg_id);
        }

        builder.set_msg_code(response.code);
        builder.set_msg_token(msg.msg_token());

        encode_response_options(&mut builder, &response);

        let _ = builder.append_payload_bytes(&response.payload);

        builder.into()
    }

    /// Builds and queues one notification, confirmable or not.
    fn push_notification(
        state: &mut BrokerState<S::PeerId>,
        notification: Notification<S::PeerId>,
        now: Instant,
    ) {
        let msg_id = state.alloc_msg_id();

        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(if notification.confirmable {
            MsgType::Con
        } else {
            MsgType::Non
        });
        builder.set_msg_id(msg_id);
        builder.set_msg_code(MsgCode::SuccessContent);
        builder.set_msg_token(notification.token);

        let _ = builder.insert_option(option::ETAG, notification.etag);
        let _ = builder.insert_option(option::OBSERVE, notification.seq.value());
        if let Some(format) = notification.content_format {
            let _ = builder.insert_option(option::CONTENT_FORMAT, format);
        }

        let block_len = 1usize << (DEFAULT_BLOCK_SZX as usize + 4);
        if notification.payload.len() > block_len {
            // Oversized notification: send block zero and pin the
            // representation; the subscriber fetches the rest with Block2
            // requests.
            let block = BlockInfo::new(0, true, DEFAULT_BLOCK_SZX).unwrap();
            let _ = builder.insert_option(option::BLOCK2, block);
            let _ = builder.insert_option(option::SIZE2, notification.payload.len() as u32);
            let _ = builder.append_payload_bytes(&notification.payload[..block_len]);
            state.manager.pin_representation(notification.topic, now);
        } else {
            let _ = builder.append_payload_bytes(&notification.payload);
        }

        let bytes: Vec<u8> = builder.into();

        if notification.confirmable {
            match state.retransmitter.enqueue(
                notification.peer,
                msg_id,
                notification.token,
                bytes,
                now,
            ) {
                Ok((_, Some(transmit))) => state.outbound.push(transmit),
                Ok((_, None)) => {}
                Err(err) => {
                    log::warn!(
                        "Dropping notification to {}: {}",
                        notification.peer,
                        err
                    );
                }
            }
        } else {
            state.outbound.push(Transmit {
                peer: notification.peer,
                bytes,
            });
        }
    }
}

/// Encodes the response options in ascending option-number order.
fn encode_response_options(builder: &mut VecMessageEncoder, response: &Response) {
    if let Some(etag) = response.etag {
        let _ = builder.insert_option(option::ETAG, etag);
    }
    if let Some(observe) = response.observe {
        let _ = builder.insert_option(option::OBSERVE, observe);
    }
    if let Some(location) = &response.location_path {
        for segment in location.split('/').filter(|segment| !segment.is_empty()) {
            let _ = builder.insert_option_with_str(option::OptionNumber::LOCATION_PATH, segment);
        }
    }
    if let Some(format) = response.content_format {
        let _ = builder.insert_option(option::CONTENT_FORMAT, format);
    }
    if let Some(max_age) = response.max_age {
        let _ = builder.insert_option(option::MAX_AGE, max_age);
    }
    if let Some(block2) = response.block2 {
        let _ = builder.insert_option(option::BLOCK2, block2);
    }
    if let Some(block1) = response.block1 {
        let _ = builder.insert_option(option::BLOCK1, block1);
    }
    if let Some(size2) = response.size2 {
        let _ = builder.insert_option(option::SIZE2, size2);
    }
}

/// Encodes an empty reset message echoing `msg_id`.
fn encode_reset(msg_id: MsgId) -> Vec<u8> {
    super::message::encode_empty(MsgType::Res, msg_id)
}
