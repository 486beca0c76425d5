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

//! Module defining various CoAP- and pub/sub-related constants.

/// The standard default IP port number used for CoAP-over-UDP.
pub const DEFAULT_PORT_COAP_UDP: u16 = 5683;

/// The standard default IP port number used for CoAP-over-DTLS.
pub const DEFAULT_PORT_COAP_DTLS: u16 = 5684;

/// The standard URI scheme for vanilla CoAP-over-UDP on IP networks.
pub const URI_SCHEME_COAP: &str = "coap";

/// The standard URI scheme for CoAP-over-DTLS on IP networks.
pub const URI_SCHEME_COAPS: &str = "coaps";

/// The largest datagram this library will send or accept:
/// 1500 bytes (MTU) - 20 bytes (IP header) - 8 bytes (UDP header).
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// The largest block size used for block-wise transfers, corresponding
/// to an SZX value of [`DEFAULT_BLOCK_SZX`].
pub const MAX_BLOCK_SIZE: usize = 1024;

/// The default block size exponent: block size = 2^(SZX+4) = 1024 bytes.
pub const DEFAULT_BLOCK_SZX: u8 = 6;

/// The maximum number of bytes a single block-wise transfer may carry:
/// 2^20 blocks of 1024 bytes each.
pub const MAX_BLOCK_BYTES_XFER: usize = (1 << 20) * 1024;

/// Value for the Observe option when registering an observer.
///
/// Note that this is only for requests, replies have entirely different semantics.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_REGISTER: u32 = 0;

/// Value for the Observe option when deregistering an observer.
///
/// Note that this is only for requests, replies have entirely different semantics.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Path of the CoRE resource discovery resource, per RFC6690.
pub const WELL_KNOWN_CORE_PATH: &str = "/.well-known/core";

/// Resource type of a pub/sub topic collection resource.
pub const RT_CORE_PS_COLL: &str = "core.ps.coll";

/// Resource type of a pub/sub topic configuration resource.
pub const RT_CORE_PS_CONF: &str = "core.ps.conf";

/// Resource type of a pub/sub topic data resource.
pub const RT_CORE_PS_DATA: &str = "core.ps.data";

/// Default path of the broker's topic collection resource.
pub const DEFAULT_COLLECTION_PATH: &str = "/www/topic/ps";

/// The longest a subscriber may go without receiving a confirmable
/// notification, per RFC7641 section 4.5: at least once every 24 hours.
pub const MAX_NOTIFY_CON_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// The configuration namespace all recognized property-tree keys live under.
pub const CONFIG_NAMESPACE: &str = "netcoap";
