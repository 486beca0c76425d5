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

use std::time::{Duration, Instant};

/// A 24-bit observe sequence number, as carried in the Observe option of
/// notifications ([IETF-RFC7641] section 3.4).
///
/// Sequence values are strictly monotonic per (resource, subscriber)
/// modulo 2^24. [`ObserveSeq::is_newer_than`] implements the freshness
/// rule receivers use to reorder notifications.
///
/// [IETF-RFC7641]: https://tools.ietf.org/html/rfc7641
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObserveSeq(u32);

impl ObserveSeq {
    /// Sequence numbers wrap modulo 2^24.
    pub const MODULO: u32 = 1 << 24;

    /// Half the sequence space; the pivot of the serial-number comparison.
    const HALF: u32 = 1 << 23;

    /// Reordering window: a value received more than 128 seconds after the
    /// previous one is considered newer regardless of sequence arithmetic.
    pub const REORDER_WINDOW: Duration = Duration::from_secs(128);

    /// Creates a sequence value, truncating to 24 bits.
    pub fn new(value: u32) -> ObserveSeq {
        ObserveSeq(value % Self::MODULO)
    }

    /// Returns the raw 24-bit value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Advances to the next sequence value, wrapping modulo 2^24.
    pub fn increment(&mut self) -> ObserveSeq {
        self.0 = (self.0 + 1) % Self::MODULO;
        *self
    }

    /// Returns true if `self` (V2, received at `rx_time`) is newer than
    /// `prev` (V1, received at `prev_time`):
    ///
    /// > (V1 < V2 ≤ V1 + 2^23) ∨ (V2 < V1 ∧ V1 > V2 + 2^23) ∨
    /// > (rx_time − prev_time > 128 s)
    pub fn is_newer_than(&self, prev: ObserveSeq, prev_time: Instant, rx_time: Instant) -> bool {
        let v1 = prev.0;
        let v2 = self.0;

        if v1 < v2 && v2 <= v1 + Self::HALF {
            return true;
        }

        if v2 < v1 && v1 > v2 + Self::HALF {
            return true;
        }

        rx_time.duration_since(prev_time) > Self::REORDER_WINDOW
    }
}

impl Default for ObserveSeq {
    fn default() -> Self {
        ObserveSeq(0)
    }
}

impl From<u32> for ObserveSeq {
    fn from(x: u32) -> Self {
        ObserveSeq::new(x)
    }
}

impl std::fmt::Display for ObserveSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_within_window() {
        let now = Instant::now();
        assert!(ObserveSeq::new(2).is_newer_than(ObserveSeq::new(1), now, now));
        assert!(!ObserveSeq::new(1).is_newer_than(ObserveSeq::new(2), now, now));
        assert!(!ObserveSeq::new(5).is_newer_than(ObserveSeq::new(5), now, now));
    }

    #[test]
    fn wrap_around() {
        let now = Instant::now();
        let near_wrap = ObserveSeq::new(ObserveSeq::MODULO - 1);

        // 0 comes "after" 2^24-1.
        assert!(ObserveSeq::new(0).is_newer_than(near_wrap, now, now));
        assert!(!near_wrap.is_newer_than(ObserveSeq::new(0), now, now));
    }

    #[test]
    fn stale_after_reorder_window() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(129);

        // Sequence arithmetic says "older", but too much time has passed.
        assert!(ObserveSeq::new(1).is_newer_than(ObserveSeq::new(2), t0, t1));
    }

    #[test]
    fn increment_wraps() {
        let mut seq = ObserveSeq::new(ObserveSeq::MODULO - 1);
        assert_eq!(seq.increment(), ObserveSeq::new(0));
    }
}
