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

use std::time::Duration;

/// [CoAP transmission parameters][tp], with the defaults recommended by
/// [IETF-RFC7252 Section 4.8].
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
/// [IETF-RFC7252 Section 4.8]: https://tools.ietf.org/html/rfc7252#section-4.8
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransParams {
    /// `ACK_TIMEOUT`: lower bound of the initial retransmission timeout.
    pub ack_timeout: Duration,

    /// `ACK_RANDOM_FACTOR`: multiplier for the upper bound of the initial
    /// retransmission timeout.
    pub ack_random_factor: f32,

    /// `MAX_RETRANSMIT`: number of retransmissions after the initial send.
    pub max_retransmit: u32,

    /// `NSTART`: maximum number of simultaneous outstanding confirmable
    /// messages per peer.
    pub nstart: u32,

    /// `MAX_LATENCY`: worst-case one-way datagram latency assumed by the
    /// protocol (100 seconds per RFC7252).
    pub max_latency: Duration,
}

impl TransParams {
    /// `PROCESSING_DELAY`: the time a node takes to turn a confirmable
    /// message into an acknowledgement. RFC7252 sets it equal to
    /// `ACK_TIMEOUT`.
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// `MAX_TRANSMIT_SPAN`: maximum time from the first transmission of a
    /// confirmable message to its last retransmission:
    ///
    /// > `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`
    ///
    /// 45 seconds with the default parameters.
    pub fn max_transmit_span(&self) -> Duration {
        self.ack_timeout
            .mul_f32(((1u64 << self.max_retransmit) - 1) as f32 * self.ack_random_factor)
    }

    /// `MAX_TRANSMIT_WAIT`: maximum time from the first transmission of a
    /// confirmable message to the time the sender gives up:
    ///
    /// > `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`
    ///
    /// 93 seconds with the default parameters.
    pub fn max_transmit_wait(&self) -> Duration {
        self.ack_timeout
            .mul_f32(((1u64 << (self.max_retransmit + 1)) - 1) as f32 * self.ack_random_factor)
    }

    /// `EXCHANGE_LIFETIME`: time from starting to send a confirmable message
    /// to the time message-layer state about the exchange can be purged:
    ///
    /// > `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`
    ///
    /// 247 seconds with the default parameters.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// `CACHE_TIMEOUT`: how long a (peer, message-id) entry is retained for
    /// duplicate detection: `MAX_RETRANSMIT * ACK_TIMEOUT`, 8 seconds with
    /// the default parameters.
    pub fn cache_timeout(&self) -> Duration {
        self.max_retransmit * self.ack_timeout
    }

    /// Draws an initial retransmission timeout, uniformly distributed in
    /// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`.
    pub fn initial_retransmit_timeout(&self) -> Duration {
        let base = self.ack_timeout.as_millis() as u64;
        let span = (base as f32 * (self.ack_random_factor - 1.0)) as u64;
        let jitter = if span == 0 {
            0
        } else {
            rand::random::<u64>() % (span + 1)
        };

        Duration::from_millis(base + jitter)
    }
}

impl Default for TransParams {
    fn default() -> Self {
        TransParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            max_latency: Duration::from_secs(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_defaults() {
        let params = TransParams::default();
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(247));
        assert_eq!(params.cache_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn initial_timeout_in_range() {
        let params = TransParams::default();
        for _ in 0..100 {
            let timeout = params.initial_retransmit_timeout();
            assert!(timeout >= Duration::from_secs(2));
            assert!(timeout <= Duration::from_secs(3));
        }
    }
}
