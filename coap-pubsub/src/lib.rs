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

//! An asynchronous CoAP-over-DTLS publish/subscribe broker and client.
//!
//! This library implements the CoAP base protocol ([RFC7252]) with observe
//! ([RFC7641]) and block-wise transfers ([RFC7959]), plus the pub/sub topic
//! model: a topic collection resource, per-topic configuration resources,
//! and topic data resources delivering publications to observers.
//!
//! Both the [`Broker`] and the [`Client`] are single-threaded cooperative
//! event loops around one datagram socket. DTLS itself is a collaborator:
//! anything implementing [`transport::SecureDatagramSocket`], which yields
//! plaintext datagrams tied to a stable peer identity, can carry the
//! protocol. A Tokio-based UDP backend lives in the sibling
//! `coap-pubsub-tokio` crate, and an in-process loopback pair
//! ([`transport::LoopbackSocket`]) is provided for tests.
//!
//! ## Broker
//!
//! ```no_run
//! use coap_pubsub::{Broker, PropTree};
//! use coap_pubsub::transport::LoopbackSocket;
//!
//! # fn main() -> Result<(), coap_pubsub::Error> {
//! let cfg = PropTree::from_json_file("NetCoap.cfg")?;
//! let (broker_socket, _client_socket) = LoopbackSocket::pair();
//!
//! let broker = Broker::new(&cfg, broker_socket)?;
//! futures::executor::block_on(broker.run())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use coap_pubsub::{Client, ClientStatus, ContentFormat, PropTree};
//! use coap_pubsub::message::MessageRead;
//! use coap_pubsub::transport::LoopbackSocket;
//!
//! # fn main() -> Result<(), coap_pubsub::Error> {
//! # let (_broker_socket, client_socket) = LoopbackSocket::pair();
//! let cfg = PropTree::new();
//! let client = Client::new(&cfg, client_socket)?;
//!
//! futures::executor::block_on(client.connect())?;
//!
//! client.subscribe("/www/topic/ps/weather", Some("temperature"), |status, msg| {
//!     if status == ClientStatus::Ok {
//!         if let Some(msg) = msg {
//!             println!("notified: {:?}", msg.payload_as_str());
//!         }
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! [RFC7252]: https://tools.ietf.org/html/rfc7252
//! [RFC7641]: https://tools.ietf.org/html/rfc7641
//! [RFC7959]: https://tools.ietf.org/html/rfc7959

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod message;
pub mod option;

mod content_format;
pub use content_format::ContentFormat;

mod block;
pub use block::*;

mod etag;
pub use etag::ETag;

mod observe;
pub use observe::ObserveSeq;

mod trans_params;
pub use trans_params::TransParams;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::*;

mod util;
use util::*;

pub mod link_format;

mod props;
pub use props::PropValue;

mod config;
pub use config::{DtlsSettings, EndpointSettings, NetCoapSettings, PropTree};

pub mod transport;

mod dedup;
pub use dedup::{DedupDisposition, MessageCache};

mod retransmit;
pub use retransmit::{Confirmed, Exhausted, RetransId, Retransmitter, Transmit};

mod exchange;
pub use exchange::{
    BlockUpload, ClientStatus, Exchange, ExchangeKind, ExchangeTable, RequestTemplate,
    ResponseHandler,
};

mod resource;
pub use resource::{
    LinkFilter, MethodSet, ResourceAttrs, ResourceEntry, ResourceKind, ResourceTree, TopicId,
};

pub mod pubsub;
pub use pubsub::{PubSubManager, TopicCfg};

mod broker;
pub use broker::Broker;

mod client;
pub use client::{Client, ClientState};

#[doc(hidden)]
pub mod prelude {
    pub use super::message::MessageRead;
    pub use super::message::MessageWrite;
    pub use super::message::MsgCode;
    pub use super::message::MsgCodeClass;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;

    pub use super::option;
    pub use option::OptionInsert;
    pub use option::OptionInsertExt;
    pub use option::OptionIterator;
    pub use option::OptionIteratorExt;
    pub use option::OptionKey;
    pub use option::OptionNumber;

    pub use super::transport::SecureClientSession;
    pub use super::transport::SecureDatagramSocket;

    pub use super::Broker;
    pub use super::Client;
    pub use super::ClientStatus;
    pub use super::ContentFormat;
    pub use super::Error;
    pub use super::PropTree;
    pub use super::PropValue;
}

use prelude::*;
