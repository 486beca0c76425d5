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

use super::*;
use crate::option::{OptionIterator, OptionNumber};
use std::borrow::Borrow;

/// Pre-parsed summary of a message buffer, shared by [`MessageParser`] and
/// [`OwnedMessage`].
///
/// The options the protocol engine consults on every dispatch are cached
/// here; everything else stays in the buffer and is reachable through the
/// option iterator.
#[derive(Debug, Clone, Eq, PartialEq)]
struct MessageInfo {
    msg_code: MsgCode,
    msg_type: MsgType,
    msg_id: MsgId,
    token: MsgToken,
    content_format: Option<ContentFormat>,
    accept: Option<ContentFormat>,
    observe: Option<u32>,
    block2: Option<BlockInfo>,
    block1: Option<BlockInfo>,
    size1: Option<u32>,
    size2: Option<u32>,
    unknown_critical: Option<OptionNumber>,
    option_start: usize,
    payload_start: usize,
}

impl MessageInfo {
    /// The minimum buffer size that constitutes a valid message header.
    const MIN_MESSAGE_BUFFER_LEN: usize = 4;

    fn parse(buffer: &[u8]) -> Result<MessageInfo, Error> {
        if buffer.len() < Self::MIN_MESSAGE_BUFFER_LEN {
            return Err(Error::ParseFailure);
        }

        if buffer[0] & COAP_MSG_VER_MASK != COAP_MSG_VER_1 {
            return Err(Error::ParseFailure);
        }

        let msg_code = MsgCode::try_from(buffer[1]).ok_or(Error::UnknownMessageCode)?;
        let msg_type = MsgType::from((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS);
        let msg_id = ((buffer[2] as u16) << 8) | buffer[3] as u16;

        let token_len = (buffer[0] & COAP_MSG_TKL_MASK) as usize;
        if token_len > 8 || buffer.len() < 4 + token_len {
            return Err(Error::ParseFailure);
        }
        let token = MsgToken::new(&buffer[4..4 + token_len]);

        let mut info = MessageInfo {
            msg_code,
            msg_type,
            msg_id,
            token,
            content_format: None,
            accept: None,
            observe: None,
            block2: None,
            block1: None,
            size1: None,
            size2: None,
            unknown_critical: None,
            option_start: 4 + token_len,
            payload_start: buffer.len(),
        };

        let mut iter = OptionIterator::new(&buffer[info.option_start..]);

        for result in &mut iter {
            let (key, value) = result?;

            match key {
                OptionNumber::CONTENT_FORMAT => {
                    info.content_format =
                        Some(ContentFormat(try_decode_u16(value).ok_or(Error::ParseFailure)?));
                }
                OptionNumber::ACCEPT => {
                    info.accept =
                        Some(ContentFormat(try_decode_u16(value).ok_or(Error::ParseFailure)?));
                }
                OptionNumber::OBSERVE => {
                    info.observe = Some(try_decode_u32(value).ok_or(Error::ParseFailure)?);
                }
                OptionNumber::BLOCK2 => {
                    let raw = try_decode_u32(value).ok_or(Error::ParseFailure)?;
                    info.block2 = Some(BlockInfo(raw).valid().ok_or(Error::ParseFailure)?);
                }
                OptionNumber::BLOCK1 => {
                    let raw = try_decode_u32(value).ok_or(Error::ParseFailure)?;
                    info.block1 = Some(BlockInfo(raw).valid().ok_or(Error::ParseFailure)?);
                }
                OptionNumber::SIZE1 => {
                    info.size1 = Some(try_decode_u32(value).ok_or(Error::ParseFailure)?);
                }
                OptionNumber::SIZE2 => {
                    info.size2 = Some(try_decode_u32(value).ok_or(Error::ParseFailure)?);
                }
                key if !key.is_recognized() && key.is_critical() => {
                    if info.unknown_critical.is_none() {
                        info.unknown_critical = Some(key);
                    }
                }
                _ => {
                    // Elective or handled elsewhere through the iterator.
                }
            }
        }

        info.payload_start = buffer.len() - iter.as_slice().len();

        Ok(info)
    }
}

/// A class for parsing a stand-alone UDP CoAP message from a borrowed buffer.
#[derive(Debug)]
pub struct MessageParser<'buf> {
    buffer: &'buf [u8],
    info: MessageInfo,
}

impl<'buf> MessageParser<'buf> {
    /// Creates a new `MessageParser` instance with the given `buffer`.
    pub fn new(buffer: &'buf [u8]) -> Result<MessageParser<'buf>, Error> {
        let info = MessageInfo::parse(buffer)?;
        Ok(MessageParser { buffer, info })
    }

    /// Returns a byte slice containing the encoded message.
    pub fn as_bytes(&self) -> &'buf [u8] {
        self.buffer
    }

    /// Copies this message into an [`OwnedMessage`].
    pub fn to_owned_message(&self) -> OwnedMessage {
        OwnedMessage {
            buffer: self.buffer.to_vec(),
            info: self.info.clone(),
        }
    }
}

impl<'buf> std::fmt::Display for MessageParser<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        MessageDisplay(self).fmt(f)
    }
}

/// A class representing an immutable heap-allocated UDP CoAP message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OwnedMessage {
    buffer: Vec<u8>,
    info: MessageInfo,
}

impl OwnedMessage {
    /// Creates a new `OwnedMessage` instance with the given `buffer`.
    pub fn new(buffer: Vec<u8>) -> Result<OwnedMessage, Error> {
        let info = MessageInfo::parse(&buffer)?;
        Ok(OwnedMessage { buffer, info })
    }

    /// Returns a byte slice containing the encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::fmt::Display for OwnedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        MessageDisplay(self).fmt(f)
    }
}

impl<'a> Borrow<dyn MessageRead + 'a> for OwnedMessage {
    fn borrow(&self) -> &(dyn MessageRead + 'a) {
        self
    }
}

macro_rules! impl_message_read {
    ($type:ty) => {
        impl MessageRead for $type {
            fn msg_code(&self) -> MsgCode {
                self.info.msg_code
            }

            fn msg_type(&self) -> MsgType {
                self.info.msg_type
            }

            fn msg_id(&self) -> MsgId {
                self.info.msg_id
            }

            fn msg_token(&self) -> MsgToken {
                self.info.token
            }

            fn payload(&self) -> &[u8] {
                &self.buffer[self.info.payload_start..]
            }

            fn content_format(&self) -> Option<ContentFormat> {
                self.info.content_format
            }

            fn accept(&self) -> Option<ContentFormat> {
                self.info.accept
            }

            fn observe(&self) -> Option<u32> {
                self.info.observe
            }

            fn block2(&self) -> Option<BlockInfo> {
                self.info.block2
            }

            fn block1(&self) -> Option<BlockInfo> {
                self.info.block1
            }

            fn size1(&self) -> Option<u32> {
                self.info.size1
            }

            fn size2(&self) -> Option<u32> {
                self.info.size2
            }

            fn unknown_critical_option(&self) -> Option<OptionNumber> {
                self.info.unknown_critical
            }

            fn options(&self) -> OptionIterator<'_> {
                OptionIterator::new(&self.buffer[self.info.option_start..])
            }
        }
    };
}

impl_message_read!(MessageParser<'_>);
impl_message_read!(OwnedMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::*;

    #[test]
    fn parse_rfc7252_fig_17_request() {
        let packet = &[
            0b01000001u8,
            0x01,
            0x7d,
            0x34,
            0x20,
            0xbb,
            b't',
            b'e',
            b'm',
            b'p',
            b'e',
            b'r',
            b'a',
            b't',
            b'u',
            b'r',
            b'e',
        ];

        let parser = MessageParser::new(packet).unwrap();
        assert_eq!(parser.msg_type(), MsgType::Con);
        assert_eq!(parser.msg_code(), MsgCode::MethodGet);
        assert_eq!(parser.msg_id(), 0x7d34);
        assert_eq!(parser.msg_token(), MsgToken::from(0x20u32));
        assert_eq!(parser.uri_path_string().unwrap(), "/temperature");
        assert!(parser.payload().is_empty());
        assert_eq!(parser.unknown_critical_option(), None);
    }

    #[test]
    fn rejects_bad_version() {
        let packet = &[0b10000000u8, 0x01, 0x00, 0x01];
        assert_eq!(MessageParser::new(packet).err(), Some(Error::ParseFailure));
    }

    #[test]
    fn rejects_unknown_code() {
        let packet = &[0b01000000u8, 0x1F, 0x00, 0x01];
        assert_eq!(
            MessageParser::new(packet).err(),
            Some(Error::UnknownMessageCode)
        );
    }

    #[test]
    fn rejects_truncated_token() {
        let packet = &[0b01000100u8, 0x01, 0x00, 0x01, 0xAA];
        assert_eq!(MessageParser::new(packet).err(), Some(Error::ParseFailure));
    }

    #[test]
    fn caches_engine_options() {
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_id(0x1234);
        builder.set_msg_token(MsgToken::from(0xBEEFu32));
        builder.insert_option(OBSERVE, 0u32).unwrap();
        builder.insert_option(URI_PATH, "www").unwrap();
        builder.insert_option(URI_PATH, "topic").unwrap();
        builder
            .insert_option(BLOCK2, BlockInfo::new(2, true, 6).unwrap())
            .unwrap();
        let bytes: Vec<u8> = builder.into();

        let msg = OwnedMessage::new(bytes).unwrap();
        assert_eq!(msg.observe(), Some(0));
        assert_eq!(msg.block2(), BlockInfo::new(2, true, 6));
        assert_eq!(msg.uri_path_string().unwrap(), "/www/topic");
    }

    #[test]
    fn flags_unknown_critical_option() {
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_id(1);
        // Option 9001 has the critical bit set and is not recognized.
        builder
            .insert_option_with_bytes(OptionNumber(9001), b"x")
            .unwrap();
        let msg = OwnedMessage::new(builder.into()).unwrap();
        assert_eq!(msg.unknown_critical_option(), Some(OptionNumber(9001)));

        // Option 9002 is unknown but elective.
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_id(2);
        builder
            .insert_option_with_bytes(OptionNumber(9002), b"x")
            .unwrap();
        let msg = OwnedMessage::new(builder.into()).unwrap();
        assert_eq!(msg.unknown_critical_option(), None);
    }
}
