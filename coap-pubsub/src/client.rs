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

//! The pub/sub client.
//!
//! Operations are continuation-based: each one registers a token-keyed
//! exchange and returns immediately; the event loop ([`Client::run`])
//! correlates responses by (peer, token) and invokes the continuation with
//! `(status, response)`. Subscriptions are long-lived exchanges whose
//! continuation fires once per notification.

use super::block::{BlockFeed, BlockInfo, BlockReconstructor, BlockSegmenter};
use super::config::{NetCoapSettings, PropTree};
use super::consts::{
    DEFAULT_BLOCK_SZX, DEFAULT_COLLECTION_PATH, OBSERVE_DEREGISTER, OBSERVE_REGISTER,
    RT_CORE_PS_COLL, RT_CORE_PS_CONF, RT_CORE_PS_DATA, WELL_KNOWN_CORE_PATH,
};
use super::dedup::{DedupDisposition, MessageCache};
use super::exchange::{
    BlockUpload, ClientStatus, Exchange, ExchangeKind, ExchangeTable, RequestTemplate,
    ResponseHandler,
};
use super::message::{
    encode_empty, MessageDisplay, MessageParser, MessageRead, MessageWrite, MsgCode, MsgId,
    MsgToken, MsgType, OwnedMessage, VecMessageEncoder,
};
use super::observe::ObserveSeq;
use super::option::{self, OptionInsert, OptionInsertExt};
use super::props::PropValue;
use super::pubsub::TopicCfg;
use super::retransmit::{Retransmitter, Transmit};
use super::trans_params::TransParams;
use super::transport::{SecureClientSession, SecureDatagramSocket, SocketEvent};
use super::{ContentFormat, Error};
use futures::prelude::*;
use futures::task::AtomicWaker;
use futures_timer::Delay;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Interval of the client's housekeeping tick.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on CON messages queued behind the in-flight one.
const MAX_BACKLOG: usize = 32;

/// Connection state of the client, in the manner of the original
/// `Client::STATE`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    /// No session; operations fail with [`Error::NotConnected`].
    None,

    /// Session established; operations are accepted.
    Connected,
}

/// Wakes the event loop when an operation queues outbound work from
/// outside of it.
#[derive(Debug, Default)]
struct Wakeup {
    flag: AtomicBool,
    waker: AtomicWaker,
}

impl Wakeup {
    fn notify(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    fn wait(&self) -> WakeupFuture<'_> {
        WakeupFuture(self)
    }
}

struct WakeupFuture<'a>(&'a Wakeup);

impl<'a> Future for WakeupFuture<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.flag.swap(false, Ordering::SeqCst) {
            return Poll::Ready(());
        }

        self.0.waker.register(cx.waker());

        if self.0.flag.swap(false, Ordering::SeqCst) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// A continuation invocation deferred until the state lock is released.
enum Invocation<P> {
    Owned {
        handler: ResponseHandler,
        status: ClientStatus,
        msg: Option<OwnedMessage>,
    },
    Observation {
        peer: P,
        token: MsgToken,
        status: ClientStatus,
        msg: Option<OwnedMessage>,
    },
}

struct ClientInner<P> {
    state: ClientState,
    server: Option<P>,
    exchanges: ExchangeTable<P>,
    pings: HashMap<MsgId, ResponseHandler>,
    retransmitter: Retransmitter<P>,
    dedup: MessageCache<P>,
    outbound: Vec<Transmit<P>>,
    next_msg_id: MsgId,
    collection_path: String,
    closed: bool,
}

impl<P: Copy + Eq + std::hash::Hash> ClientInner<P> {
    fn alloc_msg_id(&mut self) -> MsgId {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }

    fn fresh_token(&self, peer: P) -> MsgToken {
        loop {
            let token = MsgToken::generate();
            if !self.exchanges.contains(peer, token) {
                return token;
            }
        }
    }
}

/// Everything needed to serialize one request.
struct RequestSpec {
    code: MsgCode,
    path: String,
    queries: Vec<String>,
    content_format: Option<ContentFormat>,
    payload: Vec<u8>,
    confirmable: bool,
    observe: Option<u32>,
}

/// A CoAP pub/sub client bound to one secure session.
///
/// Cheap to clone; all clones share the session and exchange state.
pub struct Client<S: SecureClientSession> {
    socket: Arc<S>,
    inner: Arc<Mutex<ClientInner<S::PeerId>>>,
    wakeup: Arc<Wakeup>,
    params: TransParams,
    settings: NetCoapSettings,
}

impl<S: SecureClientSession> Clone for Client<S> {
    fn clone(&self) -> Self {
        Client {
            socket: self.socket.clone(),
            inner: self.inner.clone(),
            wakeup: self.wakeup.clone(),
            params: self.params,
            settings: self.settings.clone(),
        }
    }
}

impl<S: SecureClientSession> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<S: SecureClientSession> Client<S> {
    /// Creates a client from a configuration tree and a session socket.
    pub fn new(cfg: &PropTree, socket: S) -> Result<Client<S>, Error> {
        let settings = NetCoapSettings::from_tree(cfg)?;
        let params = TransParams::default();

        let inner = ClientInner {
            state: ClientState::None,
            server: None,
            exchanges: ExchangeTable::new(params.exchange_lifetime()),
            pings: HashMap::new(),
            retransmitter: Retransmitter::new(params, MAX_BACKLOG),
            dedup: MessageCache::new(params.cache_timeout()),
            outbound: Vec::new(),
            next_msg_id: rand::random::<MsgId>(),
            collection_path: DEFAULT_COLLECTION_PATH.to_string(),
            closed: false,
        };

        Ok(Client {
            socket: Arc::new(socket),
            inner: Arc::new(Mutex::new(inner)),
            wakeup: Arc::new(Wakeup::default()),
            params,
            settings,
        })
    }

    /// The client-side settings parsed from the configuration tree.
    pub fn settings(&self) -> &NetCoapSettings {
        &self.settings
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.inner.lock().expect("lock failure").state
    }

    /// Path of the broker's topic collection used by the discovery helpers.
    pub fn collection_path(&self) -> String {
        self.inner
            .lock()
            .expect("lock failure")
            .collection_path
            .clone()
    }

    /// Overrides the topic collection path (default `/www/topic/ps`).
    pub fn set_collection_path(&self, path: &str) {
        self.inner.lock().expect("lock failure").collection_path = path.to_string();
    }

    /// Establishes the secure session. Must complete before any operation.
    pub async fn connect(&self) -> Result<(), Error> {
        let peer = self
            .socket
            .connect_session()
            .await
            .map_err(|err| {
                log::warn!("Session handshake failed: {}", err);
                Error::IOError
            })?;

        let mut inner = self.inner.lock().expect("lock failure");
        inner.server = Some(peer);
        inner.state = ClientState::Connected;
        inner.closed = false;

        log::info!("Connected to {}", peer);
        Ok(())
    }

    /// Tears the session down: every outstanding exchange completes with
    /// [`ClientStatus::Failed`] and the event loop exits. State returns to
    /// [`ClientState::None`] before this method returns.
    pub fn disconnect(&self) {
        let invocations = {
            let mut inner = self.inner.lock().expect("lock failure");
            inner.closed = true;
            inner.state = ClientState::None;

            if let Some(server) = inner.server.take() {
                inner.retransmitter.remove_peer(server);
                inner.dedup.remove_peer(server);
            }

            let mut invocations: Vec<Invocation<S::PeerId>> = Vec::new();
            for exchange in inner.exchanges.drain_all() {
                invocations.push(Invocation::Owned {
                    handler: exchange.handler,
                    status: ClientStatus::Failed,
                    msg: None,
                });
            }
            for (_, handler) in inner.pings.drain() {
                invocations.push(Invocation::Owned {
                    handler,
                    status: ClientStatus::Failed,
                    msg: None,
                });
            }
            invocations
        };

        self.invoke(invocations);
        self.wakeup.notify();
    }

    /// Publishes `payload` on a topic data resource with a PUT.
    ///
    /// Payloads larger than the block size are uploaded block-wise with
    /// Block1. `topic_type`, when given, travels as a `topic-type`
    /// Uri-Query for broker-side validation and subscriber filtering.
    pub fn publish<F>(
        &self,
        data_uri: &str,
        payload: &[u8],
        content_format: ContentFormat,
        confirmable: bool,
        topic_type: Option<&str>,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let queries = topic_type
            .map(|t| vec![format!("topic-type={}", t)])
            .unwrap_or_default();

        self.start_request(
            RequestSpec {
                code: MsgCode::MethodPut,
                path: data_uri.to_string(),
                queries,
                content_format: Some(content_format),
                payload: payload.to_vec(),
                confirmable,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// Subscribes to a topic data resource (GET with Observe=0).
    ///
    /// The continuation fires with the immediate response and then once per
    /// accepted notification, in delivery order.
    pub fn subscribe<F>(
        &self,
        data_uri: &str,
        topic_type: Option<&str>,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let queries = topic_type
            .map(|t| vec![format!("topic-type={}", t)])
            .unwrap_or_default();

        self.start_request(
            RequestSpec {
                code: MsgCode::MethodGet,
                path: data_uri.to_string(),
                queries,
                content_format: None,
                payload: Vec::new(),
                confirmable: true,
                observe: Some(OBSERVE_REGISTER),
            },
            ExchangeKind::Observation,
            topic_type.map(str::to_string),
            Box::new(handler),
        )
    }

    /// Cancels the subscription on `data_uri` (GET with Observe=1, reusing
    /// the subscription's token). The continuation fires with the closing
    /// response.
    pub fn unsubscribe<F>(&self, data_uri: &str, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("lock failure");
        let server = inner.server.ok_or(Error::NotConnected)?;

        // The observation's token is reused so the broker can match the
        // registration being cancelled.
        let observation = inner
            .exchanges
            .take_observation_by_path(server, data_uri)
            .ok_or(Error::ResourceNotFound)?;
        let token = observation.token;

        let msg_id = inner.alloc_msg_id();
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_id(msg_id);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_token(token);
        let _ = builder.insert_option(option::OBSERVE, OBSERVE_DEREGISTER);
        insert_path(&mut builder, data_uri);
        let bytes: Vec<u8> = builder.into();

        inner.exchanges.insert(Exchange {
            peer: server,
            token,
            kind: ExchangeKind::Request,
            handler: Box::new(handler),
            template: RequestTemplate {
                code: MsgCode::MethodGet,
                uri_path: data_uri.to_string(),
                queries: Vec::new(),
                confirmable: true,
            },
            reassembly: None,
            upload: None,
            filter: None,
            last_observe: None,
            created: Instant::now(),
        });

        Self::queue_con(&mut inner, server, msg_id, token, bytes, Instant::now());
        drop(inner);
        self.wakeup.notify();
        Ok(())
    }

    /// Creates a topic: POSTs a CBOR configuration document to the
    /// collection. The response carries the configuration echo and its
    /// Location-Path.
    pub fn create_topic<F>(
        &self,
        name: &str,
        collection_uri: &str,
        data_uri: &str,
        topic_type: &str,
        media_type: ContentFormat,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let mut map = BTreeMap::new();
        map.insert(TopicCfg::TOPIC_NAME.to_string(), PropValue::from(name));
        map.insert(TopicCfg::TOPIC_DATA.to_string(), PropValue::from(data_uri));
        map.insert(
            TopicCfg::TOPIC_TYPE.to_string(),
            PropValue::from(topic_type),
        );
        map.insert(
            TopicCfg::TOPIC_MEDIA_TYPE.to_string(),
            PropValue::from(media_type.0 as u32),
        );

        let payload = PropValue::Map(map).to_cbor()?;

        self.start_request(
            RequestSpec {
                code: MsgCode::MethodPost,
                path: collection_uri.to_string(),
                queries: Vec::new(),
                content_format: Some(ContentFormat::APPLICATION_CBOR),
                payload,
                confirmable: true,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// Discovers topic collections: GET `/.well-known/core?rt=core.ps.coll`.
    pub fn get_all_topic_collection<F>(&self, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.discovery_get(
            WELL_KNOWN_CORE_PATH,
            vec![format!("rt={}", RT_CORE_PS_COLL)],
            handler,
        )
    }

    /// Lists the configuration resources in the collection.
    pub fn get_all_topic_cfg_from_collection<F>(&self, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let path = self.collection_path();
        self.discovery_get(&path, Vec::new(), handler)
    }

    /// Discovers topic data resources under `path`.
    pub fn get_all_topic_data<F>(&self, path: &str, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.discovery_get(path, vec![format!("rt={}", RT_CORE_PS_DATA)], handler)
    }

    /// Discovers topic configuration resources under `path`.
    pub fn get_all_topic_cfg<F>(&self, path: &str, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.discovery_get(path, vec![format!("rt={}", RT_CORE_PS_CONF)], handler)
    }

    /// FETCHes the collection with a property map; the broker answers with
    /// a link-format listing of the matching configurations.
    pub fn get_all_topic_cfg_by_prop<F>(
        &self,
        path: &str,
        props: &PropValue,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.start_request(
            RequestSpec {
                code: MsgCode::MethodFetch,
                path: path.to_string(),
                queries: Vec::new(),
                content_format: Some(ContentFormat::APPLICATION_CBOR),
                payload: props.to_cbor()?,
                confirmable: true,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// GETs a topic configuration document.
    pub fn get_topic_cfg<F>(&self, cfg_uri: &str, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.discovery_get(cfg_uri, Vec::new(), handler)
    }

    /// FETCHes a projection of a topic configuration: `props` should hold a
    /// `config-filter` list naming the wanted properties.
    pub fn get_topic_cfg_by_prop<F>(
        &self,
        cfg_uri: &str,
        props: &PropValue,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.start_request(
            RequestSpec {
                code: MsgCode::MethodFetch,
                path: cfg_uri.to_string(),
                queries: Vec::new(),
                content_format: Some(ContentFormat::APPLICATION_CBOR),
                payload: props.to_cbor()?,
                confirmable: true,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// iPATCHes properties into a topic configuration.
    pub fn set_topic_cfg_by_prop<F>(
        &self,
        cfg_uri: &str,
        props: &PropValue,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.start_request(
            RequestSpec {
                code: MsgCode::MethodIPatch,
                path: cfg_uri.to_string(),
                queries: Vec::new(),
                content_format: Some(ContentFormat::APPLICATION_CBOR),
                payload: props.to_cbor()?,
                confirmable: true,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// Sends a CoAP ping (empty CON); the continuation fires when the
    /// reset ("pong") or acknowledgement arrives.
    pub fn ping<F>(&self, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("lock failure");
        let server = inner.server.ok_or(Error::NotConnected)?;

        let msg_id = inner.alloc_msg_id();
        let bytes = encode_empty(MsgType::Con, msg_id);

        inner.pings.insert(msg_id, Box::new(handler));
        Self::queue_con(&mut inner, server, msg_id, MsgToken::EMPTY, bytes, Instant::now());

        drop(inner);
        self.wakeup.notify();
        Ok(())
    }

    fn discovery_get<F>(&self, path: &str, queries: Vec<String>, handler: F) -> Result<(), Error>
    where
        F: FnMut(ClientStatus, Option<&OwnedMessage>) + Send + 'static,
    {
        self.start_request(
            RequestSpec {
                code: MsgCode::MethodGet,
                path: path.to_string(),
                queries,
                content_format: None,
                payload: Vec::new(),
                confirmable: true,
                observe: None,
            },
            ExchangeKind::Request,
            None,
            Box::new(handler),
        )
    }

    /// Registers an exchange and queues the (first) request message.
    fn start_request(
        &self,
        spec: RequestSpec,
        kind: ExchangeKind,
        filter: Option<String>,
        handler: ResponseHandler,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("lock failure");

        if inner.state != ClientState::Connected {
            return Err(Error::NotConnected);
        }
        let server = inner.server.ok_or(Error::NotConnected)?;

        let token = inner.fresh_token(server);
        let msg_id = inner.alloc_msg_id();

        let block_len = 1usize << (DEFAULT_BLOCK_SZX as usize + 4);
        let mut upload = None;

        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(if spec.confirmable {
            MsgType::Con
        } else {
            MsgType::Non
        });
        builder.set_msg_id(msg_id);
        builder.set_msg_code(spec.code);
        builder.set_msg_token(token);

        if let Some(observe) = spec.observe {
            let _ = builder.insert_option(option::OBSERVE, observe);
        }
        insert_path(&mut builder, &spec.path);
        if let Some(format) = spec.content_format {
            let _ = builder.insert_option(option::CONTENT_FORMAT, format);
        }
        for query in &spec.queries {
            let _ = builder.insert_option_with_str(option::OptionNumber::URI_QUERY, query);
        }

        if spec.payload.len() > block_len {
            // Block-wise upload: first block now, the rest driven by the
            // 2.31 Continue responses.
            let segmenter = BlockSegmenter::new(spec.payload.clone(), DEFAULT_BLOCK_SZX)?;
            let (block, slice) = segmenter.block_at(0).ok_or(Error::InvalidArgument)?;

            let _ = builder.insert_option(option::BLOCK1, block);
            let _ = builder.insert_option(option::SIZE1, segmenter.total_len() as u32);
            builder.append_payload_bytes(slice)?;

            upload = Some(BlockUpload {
                segmenter,
                next_num: 1,
                content_format: spec.content_format.unwrap_or(ContentFormat::APPLICATION_OCTET_STREAM),
            });
        } else {
            builder.append_payload_bytes(&spec.payload)?;
        }

        let bytes: Vec<u8> = builder.into();

        inner.exchanges.insert(Exchange {
            peer: server,
            token,
            kind,
            handler,
            template: RequestTemplate {
                code: spec.code,
                uri_path: spec.path.clone(),
                queries: spec.queries.clone(),
                confirmable: spec.confirmable,
            },
            reassembly: None,
            upload,
            filter,
            last_observe: None,
            created: now,
        });

        if spec.confirmable {
            Self::queue_con(&mut inner, server, msg_id, token, bytes, now);
        } else {
            inner.outbound.push(Transmit {
                peer: server,
                bytes,
            });
        }

        drop(inner);
        self.wakeup.notify();
        Ok(())
    }

    /// Hands a CON to the retransmitter, queueing whatever it wants sent.
    fn queue_con(
        inner: &mut ClientInner<S::PeerId>,
        server: S::PeerId,
        msg_id: MsgId,
        token: MsgToken,
        bytes: Vec<u8>,
        now: Instant,
    ) {
        match inner.retransmitter.enqueue(server, msg_id, token, bytes, now) {
            Ok((_, Some(transmit))) => inner.outbound.push(transmit),
            Ok((_, None)) => {}
            Err(err) => {
                log::warn!("Outbound queue full: {}", err);
            }
        }
    }

    /// Runs the client event loop until [`Client::disconnect`].
    pub async fn run(self) -> Result<(), Error> {
        let mut buf = vec![0u8; self.socket.max_datagram_size()];

        loop {
            self.flush().await?;

            if self.inner.lock().expect("lock failure").closed {
                return Ok(());
            }

            let event = {
                let mut recv = self.socket.recv_event(&mut buf).fuse();
                let mut tick = Delay::new(TICK_INTERVAL).fuse();
                let mut wake = self.wakeup.wait().fuse();

                futures::select! {
                    event = recv => Some(event),
                    _ = tick => None,
                    _ = wake => None,
                }
            };

            match event {
                Some(Ok(SocketEvent::Datagram { len, peer })) => {
                    self.handle_datagram(&buf[..len], peer, Instant::now());
                }
                Some(Ok(SocketEvent::SessionClosed { peer })) => {
                    log::info!("Session with {} closed by peer", peer);
                    self.disconnect();
                }
                Some(Err(err)) => {
                    log::warn!("Client socket error: {}", err);
                    self.disconnect();
                    return Err(Error::IOError);
                }
                None => {
                    self.tick(Instant::now());
                }
            }
        }
    }

    async fn flush(&self) -> Result<(), Error> {
        loop {
            let pending: Vec<Transmit<S::PeerId>> = {
                let mut inner = self.inner.lock().expect("lock failure");
                std::mem::take(&mut inner.outbound)
            };

            if pending.is_empty() {
                return Ok(());
            }

            for transmit in pending {
                if let Err(err) = self.socket.send_to(&transmit.bytes, transmit.peer).await {
                    log::warn!("Client send failed: {}", err);
                }
            }
        }
    }

    fn tick(&self, now: Instant) {
        let mut invocations = Vec::new();

        {
            let mut inner = self.inner.lock().expect("lock failure");
            let inner = &mut *inner;

            let (transmits, exhausted) = inner.retransmitter.poll_due(now);
            inner.outbound.extend(transmits);

            for entry in exhausted {
                if entry.token.is_empty() {
                    if let Some(handler) = inner.pings.remove(&entry.msg_id) {
                        invocations.push(Invocation::Owned {
                            handler,
                            status: ClientStatus::Timeout,
                            msg: None,
                        });
                    }
                    continue;
                }

                if let Some(exchange) = inner.exchanges.remove(entry.peer, entry.token) {
                    log::info!("Request {} timed out", exchange.token);
                    invocations.push(Invocation::Owned {
                        handler: exchange.handler,
                        status: ClientStatus::Timeout,
                        msg: None,
                    });
                }
            }

            for exchange in inner.exchanges.expire(now) {
                invocations.push(Invocation::Owned {
                    handler: exchange.handler,
                    status: ClientStatus::Timeout,
                    msg: None,
                });
            }

            inner.dedup.expire(now);
        }

        self.invoke(invocations);
    }

    fn handle_datagram(&self, bytes: &[u8], peer: S::PeerId, now: Instant) {
        let Ok(msg) = MessageParser::new(bytes) else {
            log::debug!("Malformed datagram from {}", peer);
            return;
        };

        log::debug!("Client <- {}: {}", peer, MessageDisplay(&msg));

        let mut invocations = Vec::new();

        {
            let mut inner = self.inner.lock().expect("lock failure");
            let inner = &mut *inner;

            if msg.msg_code().is_empty() {
                match msg.msg_type() {
                    MsgType::Ack => {
                        Self::on_transport_ack(inner, peer, msg.msg_id(), now, &mut invocations, ClientStatus::Ok);
                    }
                    MsgType::Res => {
                        Self::on_reset(inner, peer, msg.msg_id(), now, &mut invocations);
                    }
                    MsgType::Con => {
                        // Ping from the broker; answer with a reset.
                        inner.outbound.push(Transmit {
                            peer,
                            bytes: encode_empty(MsgType::Res, msg.msg_id()),
                        });
                    }
                    MsgType::Non => {}
                }
            } else if msg.msg_code().is_response() {
                self.handle_response(inner, &msg, peer, now, &mut invocations);
            } else if msg.msg_code().is_method() && msg.msg_type().is_con() {
                // The client serves nothing.
                inner.outbound.push(Transmit {
                    peer,
                    bytes: encode_empty(MsgType::Res, msg.msg_id()),
                });
            }
        }

        self.invoke(invocations);
    }

    /// An empty ACK: transport-level confirmation only.
    fn on_transport_ack(
        inner: &mut ClientInner<S::PeerId>,
        peer: S::PeerId,
        msg_id: MsgId,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
        ping_status: ClientStatus,
    ) {
        if let Some((_, promoted)) = inner.retransmitter.acknowledge(peer, msg_id, now) {
            inner.outbound.extend(promoted);
        }

        if let Some(handler) = inner.pings.remove(&msg_id) {
            invocations.push(Invocation::Owned {
                handler,
                status: ping_status,
                msg: None,
            });
        }
    }

    /// A reset: the peer rejected our confirmable message.
    fn on_reset(
        inner: &mut ClientInner<S::PeerId>,
        peer: S::PeerId,
        msg_id: MsgId,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
    ) {
        // A reset of a ping is the expected "pong".
        if let Some(handler) = inner.pings.remove(&msg_id) {
            if let Some((_, promoted)) = inner.retransmitter.reject(peer, msg_id, now) {
                inner.outbound.extend(promoted);
            }
            invocations.push(Invocation::Owned {
                handler,
                status: ClientStatus::Ok,
                msg: None,
            });
            return;
        }

        if let Some((confirmed, promoted)) = inner.retransmitter.reject(peer, msg_id, now) {
            inner.outbound.extend(promoted);

            if let Some(exchange) = inner.exchanges.remove(peer, confirmed.token) {
                log::info!("Request {} was reset by the peer", exchange.token);
                invocations.push(Invocation::Owned {
                    handler: exchange.handler,
                    status: ClientStatus::Failed,
                    msg: None,
                });
            }
        }
    }

    /// Correlates a response (piggy-backed, separate, or notification) and
    /// advances the exchange it belongs to.
    fn handle_response(
        &self,
        inner: &mut ClientInner<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
    ) {
        let token = msg.msg_token();

        if msg.msg_type().is_con() {
            // Separate response or confirmable notification: acknowledge,
            // and suppress duplicates.
            let ack = encode_empty(MsgType::Ack, msg.msg_id());
            match inner.dedup.check(peer, msg.msg_id(), now) {
                DedupDisposition::New => {
                    inner.dedup.store_response(peer, msg.msg_id(), ack.clone());
                    inner.outbound.push(Transmit { peer, bytes: ack });
                }
                DedupDisposition::DuplicateCached(cached) => {
                    inner.outbound.push(Transmit { peer, bytes: cached });
                    return;
                }
                DedupDisposition::DuplicatePending => return,
            }
        } else if msg.msg_type().is_ack() {
            // Piggy-backed response: confirm the transport layer first.
            if let Some((_, promoted)) = inner.retransmitter.acknowledge(peer, msg.msg_id(), now) {
                inner.outbound.extend(promoted);
            }
        }

        if !inner.exchanges.contains(peer, token) {
            if msg.msg_type().is_con() {
                // Unsolicited notification: reject so the broker drops the
                // stale observation.
                inner.outbound.push(Transmit {
                    peer,
                    bytes: encode_empty(MsgType::Res, msg.msg_id()),
                });
            }
            return;
        }

        if msg.unknown_critical_option().is_some() {
            inner.outbound.push(Transmit {
                peer,
                bytes: encode_empty(MsgType::Res, msg.msg_id()),
            });
            if let Some(exchange) = inner.exchanges.remove(peer, token) {
                invocations.push(Invocation::Owned {
                    handler: exchange.handler,
                    status: ClientStatus::Failed,
                    msg: None,
                });
            }
            return;
        }

        // Error responses complete (and end) any exchange.
        if msg.msg_code().is_error() {
            let exchange = inner.exchanges.remove(peer, token).unwrap();
            invocations.push(Invocation::Owned {
                handler: exchange.handler,
                status: ClientStatus::Failed,
                msg: Some(msg.to_owned_message()),
            });
            return;
        }

        // Block1 upload in progress: 2.31 asks for the next block.
        if msg.msg_code() == MsgCode::SuccessContinue {
            self.continue_upload(inner, msg, peer, token, now, invocations);
            return;
        }

        // Block2 segmented response: feed the reassembly buffer and fetch
        // the next block until the transfer completes.
        if let Some(block2) = msg.block2() {
            self.continue_download(inner, msg, peer, token, block2, now, invocations);
            return;
        }

        self.deliver(inner, msg.to_owned_message(), peer, token, now, invocations);
    }

    /// Sends the next Block1 chunk of an upload.
    fn continue_upload(
        &self,
        inner: &mut ClientInner<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        token: MsgToken,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
    ) {
        // Copy everything needed for the next block out of the exchange, so
        // nothing borrows the table while the new message is queued.
        let next = inner.exchanges.get_mut(peer, token).and_then(|exchange| {
            let upload = exchange.upload.as_mut()?;
            let num = upload.next_num;
            let (block, slice) = upload.segmenter.block_at(num)?;
            let slice = slice.to_vec();
            upload.next_num += 1;
            Some((
                block,
                slice,
                upload.content_format,
                exchange.template.clone(),
            ))
        });

        let Some((block, slice, content_format, template)) = next else {
            // A 2.31 with no upload in progress (or past the final block)
            // is a broken response.
            let exchange = inner.exchanges.remove(peer, token).unwrap();
            invocations.push(Invocation::Owned {
                handler: exchange.handler,
                status: ClientStatus::Failed,
                msg: Some(msg.to_owned_message()),
            });
            return;
        };

        let msg_id = inner.alloc_msg_id();
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_id(msg_id);
        builder.set_msg_code(template.code);
        builder.set_msg_token(token);
        insert_path(&mut builder, &template.uri_path);
        let _ = builder.insert_option(option::CONTENT_FORMAT, content_format);
        for query in &template.queries {
            let _ = builder.insert_option_with_str(option::OptionNumber::URI_QUERY, query);
        }
        let _ = builder.insert_option(option::BLOCK1, block);
        let _ = builder.append_payload_bytes(&slice);

        Self::queue_con(inner, peer, msg_id, token, builder.into(), now);
    }

    /// Feeds one Block2 response block, requesting the next when more
    /// remain.
    fn continue_download(
        &self,
        inner: &mut ClientInner<S::PeerId>,
        msg: &MessageParser<'_>,
        peer: S::PeerId,
        token: MsgToken,
        block2: BlockInfo,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
    ) {
        let exchange = inner.exchanges.get_mut(peer, token).unwrap();

        // A fresh notification (Observe present) or first block restarts
        // the buffer.
        if msg.observe().is_some() || exchange.reassembly.is_none() {
            let mut reconstructor = BlockReconstructor::new(block2.szx());
            if let Some(size2) = msg.size2() {
                reconstructor.set_size_hint(size2);
            }
            exchange.reassembly = Some(reconstructor);
        }

        let reconstructor = exchange.reassembly.as_mut().unwrap();

        match reconstructor.feed(block2, msg.payload()) {
            Ok(BlockFeed::More) | Ok(BlockFeed::Duplicate) => {
                let next = reconstructor.next_block();
                let template = exchange.template.clone();

                let msg_id = inner.alloc_msg_id();
                let mut builder = VecMessageEncoder::new();
                builder.set_msg_type(MsgType::Con);
                builder.set_msg_id(msg_id);
                builder.set_msg_code(MsgCode::MethodGet);
                builder.set_msg_token(token);
                insert_path(&mut builder, &template.uri_path);
                let _ = builder.insert_option(option::BLOCK2, next);

                Self::queue_con(inner, peer, msg_id, token, builder.into(), now);
            }
            Ok(BlockFeed::Finished) => {
                let payload = exchange.reassembly.take().unwrap().into_payload();
                let assembled = synthesize_response(msg, token, payload);
                self.deliver(inner, assembled, peer, token, now, invocations);
            }
            Err(_) => {
                exchange.reassembly = None;
                let kind = exchange.kind;
                if kind == ExchangeKind::Request {
                    let exchange = inner.exchanges.remove(peer, token).unwrap();
                    invocations.push(Invocation::Owned {
                        handler: exchange.handler,
                        status: ClientStatus::Failed,
                        msg: None,
                    });
                }
            }
        }
    }

    /// Delivers a complete response to its exchange's continuation.
    fn deliver(
        &self,
        inner: &mut ClientInner<S::PeerId>,
        msg: OwnedMessage,
        peer: S::PeerId,
        token: MsgToken,
        now: Instant,
        invocations: &mut Vec<Invocation<S::PeerId>>,
    ) {
        let exchange = inner.exchanges.get_mut(peer, token).unwrap();
        let status = if msg.msg_code().is_success() {
            ClientStatus::Ok
        } else {
            ClientStatus::Failed
        };

        match exchange.kind {
            ExchangeKind::Request => {
                let exchange = inner.exchanges.remove(peer, token).unwrap();
                invocations.push(Invocation::Owned {
                    handler: exchange.handler,
                    status,
                    msg: Some(msg),
                });
            }
            ExchangeKind::Observation => {
                // Apply the 24-bit freshness rule before delivering.
                if let Some(observe) = msg.observe() {
                    let seq = ObserveSeq::new(observe);
                    if let Some((last, last_time)) = exchange.last_observe {
                        if !seq.is_newer_than(last, last_time, now) {
                            log::debug!("Dropping stale notification {}", seq);
                            return;
                        }
                    }
                    exchange.last_observe = Some((seq, now));
                }

                invocations.push(Invocation::Observation {
                    peer,
                    token,
                    status,
                    msg: Some(msg),
                });
            }
        }
    }

    /// Invokes continuations outside the state lock.
    fn invoke(&self, invocations: Vec<Invocation<S::PeerId>>) {
        for invocation in invocations {
            match invocation {
                Invocation::Owned {
                    mut handler,
                    status,
                    msg,
                } => {
                    handler(status, msg.as_ref());
                }
                Invocation::Observation {
                    peer,
                    token,
                    status,
                    msg,
                } => {
                    // Borrow the handler out of the table for the call; the
                    // event loop is single-threaded, so nothing observes the
                    // placeholder.
                    let taken = {
                        let mut inner = self.inner.lock().expect("lock failure");
                        inner
                            .exchanges
                            .get_mut(peer, token)
                            .map(|exchange| {
                                std::mem::replace(&mut exchange.handler, Box::new(|_, _| {}))
                            })
                    };

                    if let Some(mut handler) = taken {
                        handler(status, msg.as_ref());

                        let mut inner = self.inner.lock().expect("lock failure");
                        if let Some(exchange) = inner.exchanges.get_mut(peer, token) {
                            exchange.handler = handler;
                        }
                    }
                }
            }
        }
    }
}

/// Inserts the path segments of `path` as repeated Uri-Path options.
fn insert_path(builder: &mut VecMessageEncoder, path: &str) {
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        let _ = builder.insert_option_with_str(option::OptionNumber::URI_PATH, segment);
    }
}

/// Builds the logical (reassembled) response message handed to a
/// continuation after a block-wise transfer.
fn synthesize_response(msg: &MessageParser<'_>, token: MsgToken, payload: Vec<u8>) -> OwnedMessage {
    let mut builder = VecMessageEncoder::new();
    builder.set_msg_type(MsgType::Non);
    builder.set_msg_id(msg.msg_id());
    builder.set_msg_code(msg.msg_code());
    builder.set_msg_token(token);

    if let Some(etag) = find_etag(msg) {
        let _ = builder.insert_option(option::ETAG, etag);
    }
    if let Some(format) = msg.content_format() {
        let _ = builder.insert_option(option::CONTENT_FORMAT, format);
    }
    let _ = builder.append_payload_bytes(&payload);

    builder.into()
}

fn find_etag(msg: &MessageParser<'_>) -> Option<super::ETag> {
    use super::option::OptionIteratorExt;
    msg.options().find_next_of(option::ETAG)?.ok()
}
