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

/// Helper for rendering a one-line human-readable summary of any type that
/// implements [`MessageRead`]. Intended for log lines.
#[derive(Debug)]
pub struct MessageDisplay<'a, T: MessageRead + ?Sized>(pub &'a T);

impl<'a, T: MessageRead + ?Sized> std::fmt::Display for MessageDisplay<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = self.0;

        let type_str = match msg.msg_type() {
            MsgType::Con => "CON",
            MsgType::Non => "NON",
            MsgType::Ack => "ACK",
            MsgType::Res => "RST",
        };

        write!(f, "{} {} MID:{:04X}", type_str, msg.msg_code(), msg.msg_id())?;

        if !msg.msg_token().is_empty() {
            write!(f, " TOK:{}", msg.msg_token())?;
        }

        for opt in msg.options() {
            match opt {
                Ok((key, value)) => {
                    f.write_str(" ")?;
                    key.fmt_with_value(f, value)?;
                }
                Err(_) => {
                    f.write_str(" <option-parse-error>")?;
                    break;
                }
            }
        }

        if !msg.payload().is_empty() {
            write!(f, " [{} byte payload]", msg.payload().len())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::*;

    #[test]
    fn summary_line() {
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_id(0x1234);
        builder.insert_option(URI_PATH, "sensors").unwrap();
        builder.append_payload_string("x").unwrap();

        let msg: OwnedMessage = builder.into();
        let line = format!("{}", MessageDisplay(&msg));
        assert!(line.starts_with("CON 0.01 MID:1234"));
        assert!(line.contains("Uri-Path"));
        assert!(line.contains("[1 byte payload]"));
    }
}
