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

use coap_pubsub::transport::{SecureClientSession, SecureDatagramSocket, SocketEvent};
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

/// An asynchronous [`SecureDatagramSocket`] implementation based on
/// [`tokio::net::UdpSocket`].
///
/// Plain UDP has no session layer, so the peer identity is simply the
/// remote socket address and session-teardown events are never emitted.
#[derive(Debug)]
pub struct TokioUdpSocket {
    socket: UdpSocket,
    remote: Option<SocketAddr>,
}

impl TokioUdpSocket {
    /// Binds a broker-side socket to `addr`.
    pub async fn bind(addr: &str) -> io::Result<TokioUdpSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(TokioUdpSocket {
            socket,
            remote: None,
        })
    }

    /// Binds a client-side socket on an ephemeral local port, directed at
    /// the broker at `remote`.
    pub async fn connect(remote: SocketAddr) -> io::Result<TokioUdpSocket> {
        let local = if remote.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(TokioUdpSocket {
            socket,
            remote: Some(remote),
        })
    }

    /// Returns the local address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl SecureDatagramSocket for TokioUdpSocket {
    type PeerId = SocketAddr;
    type Error = io::Error;

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        peer: Self::PeerId,
    ) -> Poll<Result<usize, Self::Error>> {
        self.socket.poll_send_to(cx, buf, peer)
    }

    fn poll_recv_event(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<SocketEvent<Self::PeerId>, Self::Error>> {
        let mut read_buf = ReadBuf::new(buf);

        match self.socket.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(peer)) => Poll::Ready(Ok(SocketEvent::Datagram {
                len: read_buf.filled().len(),
                peer,
            })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl SecureClientSession for TokioUdpSocket {
    fn poll_connect(&self, _cx: &mut Context<'_>) -> Poll<Result<Self::PeerId, Self::Error>> {
        match self.remote {
            Some(remote) => Poll::Ready(Ok(remote)),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket was bound without a remote address",
            ))),
        }
    }
}
