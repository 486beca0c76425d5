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

//! Datagram socket abstraction with peer identity.
//!
//! The broker and client do not perform DTLS themselves; they talk to a
//! collaborator implementing [`SecureDatagramSocket`], which yields
//! plaintext datagrams tied to a stable peer identity derived from the
//! secure session. Any datagram layer (DTLS, plain UDP, or the in-process
//! [`LoopbackSocket`]) can sit behind this trait.

use super::consts::MAX_DATAGRAM_SIZE;
use super::Error;
use futures::channel::mpsc;
use futures::prelude::*;
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Mutex;

/// One event yielded by [`SecureDatagramSocket::poll_recv_event`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SocketEvent<P> {
    /// A datagram arrived from `peer`; the first `len` bytes of the receive
    /// buffer hold its plaintext.
    Datagram {
        /// Number of payload bytes written into the receive buffer.
        len: usize,
        /// Identity of the sending peer.
        peer: P,
    },

    /// The secure session with `peer` has been torn down. All protocol
    /// state referencing the peer must be released.
    SessionClosed {
        /// Identity of the peer whose session ended.
        peer: P,
    },
}

/// A datagram socket whose peers are identified by a stable session
/// identity rather than a transport address.
///
/// For a DTLS backend the identity is derived from the session and remains
/// stable for the session lifetime; every message-cache, subscription, and
/// token table in this library keys on it.
pub trait SecureDatagramSocket: Send + Sync + Unpin {
    /// The peer identity type.
    type PeerId: Copy + Eq + Hash + Debug + Display + Send + Sync + Unpin + 'static;

    /// The error type for errors emitted from this socket.
    type Error: Debug + Display;

    /// A non-blocking, `poll_*`-style send of one datagram to `peer`.
    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        peer: Self::PeerId,
    ) -> Poll<Result<usize, Self::Error>>;

    /// A non-blocking, `poll_*`-style receive of the next socket event.
    fn poll_recv_event(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<SocketEvent<Self::PeerId>, Self::Error>>;

    /// Returns a future that uses [`SecureDatagramSocket::poll_send_to`].
    fn send_to<'a, 'b>(&'a self, buf: &'b [u8], peer: Self::PeerId) -> SendToFuture<'a, 'b, Self> {
        SendToFuture {
            socket: self,
            buffer: buf,
            peer,
        }
    }

    /// Returns a future that uses [`SecureDatagramSocket::poll_recv_event`].
    fn recv_event<'a, 'b>(&'a self, buf: &'b mut [u8]) -> RecvEventFuture<'a, 'b, Self> {
        RecvEventFuture {
            socket: self,
            buffer: buf,
        }
    }

    /// The largest datagram this socket can carry.
    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }
}

/// Client-side extension of [`SecureDatagramSocket`]: establishing the
/// secure session with the (single) remote broker.
pub trait SecureClientSession: SecureDatagramSocket {
    /// Drives the session handshake; resolves with the broker's peer
    /// identity once the session is established.
    fn poll_connect(&self, cx: &mut Context<'_>) -> Poll<Result<Self::PeerId, Self::Error>>;

    /// Returns a future that uses [`SecureClientSession::poll_connect`].
    fn connect_session(&self) -> ConnectFuture<'_, Self> {
        ConnectFuture { socket: self }
    }
}

/// Future returned from [`SecureDatagramSocket::send_to`].
#[derive(Debug)]
pub struct SendToFuture<'a, 'b, T: SecureDatagramSocket + ?Sized> {
    socket: &'a T,
    buffer: &'b [u8],
    peer: T::PeerId,
}

impl<'a, 'b, T: SecureDatagramSocket + ?Sized> Future for SendToFuture<'a, 'b, T> {
    type Output = Result<usize, T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.socket.poll_send_to(cx, this.buffer, this.peer)
    }
}

/// Future returned from [`SecureDatagramSocket::recv_event`].
#[derive(Debug)]
pub struct RecvEventFuture<'a, 'b, T: SecureDatagramSocket + ?Sized> {
    socket: &'a T,
    buffer: &'b mut [u8],
}

impl<'a, 'b, T: SecureDatagramSocket + ?Sized> Future for RecvEventFuture<'a, 'b, T> {
    type Output = Result<SocketEvent<T::PeerId>, T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.socket.poll_recv_event(cx, this.buffer)
    }
}

/// Future returned from [`SecureClientSession::connect_session`].
#[derive(Debug)]
pub struct ConnectFuture<'a, T: SecureClientSession + ?Sized> {
    socket: &'a T,
}

impl<'a, T: SecureClientSession + ?Sized> Future for ConnectFuture<'a, T> {
    type Output = Result<T::PeerId, T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().socket.poll_connect(cx)
    }
}

/// Peer identity used by [`LoopbackSocket`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LoopbackPeer(pub &'static str);

impl Display for LoopbackPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug)]
enum LoopbackFrame {
    Datagram(Vec<u8>),
    Closed,
}

type LoopbackInbox = mpsc::UnboundedReceiver<(LoopbackFrame, LoopbackPeer)>;
type LoopbackOutbox = mpsc::UnboundedSender<(LoopbackFrame, LoopbackPeer)>;

/// An in-process [`SecureDatagramSocket`] used by tests to drive a broker
/// and any number of clients against each other without a network or DTLS
/// stack.
///
/// Sockets are point-to-multipoint: [`LoopbackSocket::connect_to`] plumbs
/// a bidirectional route between two endpoints, and a broker-side socket
/// can be routed to several client sockets at once, each appearing as a
/// distinct peer identity.
#[derive(Debug)]
pub struct LoopbackSocket {
    local: LoopbackPeer,
    inbox: Mutex<LoopbackInbox>,
    inbox_handle: LoopbackOutbox,
    routes: Mutex<Vec<(LoopbackPeer, LoopbackOutbox)>>,
}

impl LoopbackSocket {
    /// Creates an unconnected endpoint named `name`.
    pub fn new(name: &'static str) -> LoopbackSocket {
        let (inbox_handle, inbox) = mpsc::unbounded();
        LoopbackSocket {
            local: LoopbackPeer(name),
            inbox: Mutex::new(inbox),
            inbox_handle,
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Creates a connected ("broker", "client") socket pair.
    pub fn pair() -> (LoopbackSocket, LoopbackSocket) {
        let broker_side = LoopbackSocket::new("broker");
        let client_side = LoopbackSocket::new("client");
        broker_side.connect_to(&client_side);
        (broker_side, client_side)
    }

    /// Establishes a bidirectional route between this endpoint and `other`.
    pub fn connect_to(&self, other: &LoopbackSocket) {
        self.routes
            .lock()
            .expect("lock failure")
            .push((other.local, other.inbox_handle.clone()));
        other
            .routes
            .lock()
            .expect("lock failure")
            .push((self.local, self.inbox_handle.clone()));
    }

    /// The identity this endpoint presents to its peers.
    pub fn local_peer(&self) -> LoopbackPeer {
        self.local
    }

    /// Simulates a session teardown: every routed peer observes a
    /// [`SocketEvent::SessionClosed`] event.
    pub fn close_session(&self) {
        for (_, outbox) in self.routes.lock().expect("lock failure").iter() {
            let _ = outbox.unbounded_send((LoopbackFrame::Closed, self.local));
        }
    }
}

impl SecureDatagramSocket for LoopbackSocket {
    type PeerId = LoopbackPeer;
    type Error = Error;

    fn poll_send_to(
        &self,
        _cx: &mut Context<'_>,
        buf: &[u8],
        peer: Self::PeerId,
    ) -> Poll<Result<usize, Self::Error>> {
        let routes = self.routes.lock().expect("lock failure");
        let Some((_, outbox)) = routes.iter().find(|(route_peer, _)| *route_peer == peer)
        else {
            return Poll::Ready(Err(Error::SessionClosed));
        };

        match outbox.unbounded_send((LoopbackFrame::Datagram(buf.to_vec()), self.local)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(Error::SessionClosed)),
        }
    }

    fn poll_recv_event(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<SocketEvent<Self::PeerId>, Self::Error>> {
        let mut inbox = self.inbox.lock().expect("lock failure");

        match inbox.poll_next_unpin(cx) {
            Poll::Ready(Some((LoopbackFrame::Datagram(packet), peer))) => {
                if packet.len() > buf.len() {
                    return Poll::Ready(Err(Error::OutOfSpace));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Poll::Ready(Ok(SocketEvent::Datagram {
                    len: packet.len(),
                    peer,
                }))
            }
            Poll::Ready(Some((LoopbackFrame::Closed, peer))) => {
                Poll::Ready(Ok(SocketEvent::SessionClosed { peer }))
            }
            Poll::Ready(None) => Poll::Ready(Err(Error::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl SecureClientSession for LoopbackSocket {
    fn poll_connect(&self, _cx: &mut Context<'_>) -> Poll<Result<Self::PeerId, Self::Error>> {
        let routes = self.routes.lock().expect("lock failure");
        match routes.as_slice() {
            [(peer, _)] => Poll::Ready(Ok(*peer)),
            _ => Poll::Ready(Err(Error::NotConnected)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn loopback_round_trip() {
        let (broker_side, client_side) = LoopbackSocket::pair();

        block_on(async {
            client_side
                .send_to(b"hello", broker_side.local_peer())
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            let event = broker_side.recv_event(&mut buf).await.unwrap();
            assert_eq!(
                event,
                SocketEvent::Datagram {
                    len: 5,
                    peer: LoopbackPeer("client")
                }
            );
            assert_eq!(&buf[..5], b"hello");
        });
    }

    #[test]
    fn hub_routes_multiple_clients() {
        let hub = LoopbackSocket::new("hub");
        let a = LoopbackSocket::new("a");
        let b = LoopbackSocket::new("b");
        hub.connect_to(&a);
        hub.connect_to(&b);

        block_on(async {
            a.send_to(b"from-a", hub.local_peer()).await.unwrap();
            b.send_to(b"from-b", hub.local_peer()).await.unwrap();

            let mut buf = [0u8; 64];
            let first = hub.recv_event(&mut buf).await.unwrap();
            assert_eq!(
                first,
                SocketEvent::Datagram {
                    len: 6,
                    peer: LoopbackPeer("a")
                }
            );

            let second = hub.recv_event(&mut buf).await.unwrap();
            assert_eq!(
                second,
                SocketEvent::Datagram {
                    len: 6,
                    peer: LoopbackPeer("b")
                }
            );

            // The hub can answer each client individually.
            hub.send_to(b"to-b", LoopbackPeer("b")).await.unwrap();
            let event = b.recv_event(&mut buf).await.unwrap();
            assert_eq!(
                event,
                SocketEvent::Datagram {
                    len: 4,
                    peer: LoopbackPeer("hub")
                }
            );
        });
    }

    #[test]
    fn session_close_is_visible_to_peer() {
        let (broker_side, client_side) = LoopbackSocket::pair();

        client_side.close_session();

        block_on(async {
            let mut buf = [0u8; 16];
            let event = broker_side.recv_event(&mut buf).await.unwrap();
            assert_eq!(
                event,
                SocketEvent::SessionClosed {
                    peer: LoopbackPeer("client")
                }
            );
        });
    }
}
