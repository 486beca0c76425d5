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

//! This crate provides [`TokioUdpSocket`]\: an asynchronous, [Tokio][]-based
//! implementation of [`SecureDatagramSocket`] for use with the
//! `coap-pubsub` [`Broker`] and [`Client`].
//!
//! Peers are identified by their UDP socket address. This backend carries
//! plaintext CoAP; to speak `coaps`, wrap a DTLS implementation around a
//! datagram transport and implement [`SecureDatagramSocket`] on it the same
//! way, deriving the peer identity from the DTLS session.
//!
//! # Example
//!
//! ```no_run
//! use coap_pubsub::{Broker, PropTree};
//! use coap_pubsub_tokio::TokioUdpSocket;
//!
//! #[tokio::main]
//! async fn main() {
//!     let socket = TokioUdpSocket::bind("127.0.0.1:5683")
//!         .await
//!         .expect("UDP bind failed");
//!
//!     let cfg = PropTree::new();
//!     let broker = Broker::new(&cfg, socket).expect("Broker setup failed");
//!
//!     broker.run().await.expect("Broker terminated");
//! }
//! ```
//!
//! [`SecureDatagramSocket`]: coap_pubsub::transport::SecureDatagramSocket
//! [`Broker`]: coap_pubsub::Broker
//! [`Client`]: coap_pubsub::Client
//! [Tokio]: https://tokio.rs/

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod tokio_udp_socket;
pub use tokio_udp_socket::TokioUdpSocket;
