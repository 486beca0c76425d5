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

//! Types related to parsing and encoding CoAP messages.

use super::*;

/// Type for representing a CoAP message id.
pub type MsgId = u16;

mod read;
pub use read::AckMessage;
pub use read::MessageRead;
pub use read::ResetMessage;

mod write;
pub use write::MessageWrite;

mod msg_code;
pub use msg_code::MsgCode;
pub use msg_code::MsgCodeClass;

mod msg_type;
pub use msg_type::MsgType;

mod display;
pub use display::MessageDisplay;

mod encoder;
pub use encoder::BufferMessageEncoder;
pub use encoder::VecMessageEncoder;

mod parser;
pub use parser::MessageParser;
pub use parser::OwnedMessage;

mod token;
pub use token::*;

pub mod codec;

pub(crate) const COAP_MSG_VER_MASK: u8 = 0b11000000;
pub(crate) const COAP_MSG_VER_1: u8 = 0b01000000;
pub(crate) const COAP_MSG_T_MASK: u8 = 0b00110000;
pub(crate) const COAP_MSG_T_OFFS: u8 = 4;
pub(crate) const COAP_MSG_TKL_MASK: u8 = 0b00001111;

/// Encodes a token-less empty message (reset, empty acknowledgement, or
/// ping) echoing `msg_id`.
pub(crate) fn encode_empty(msg_type: MsgType, msg_id: MsgId) -> Vec<u8> {
    let mut builder = VecMessageEncoder::new();
    builder.set_msg_type(msg_type);
    builder.set_msg_code(MsgCode::Empty);
    builder.set_msg_id(msg_id);
    builder.into()
}
