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

//! Read-only configuration property tree.
//!
//! Configuration is a JSON document whose recognized keys live under the
//! `netcoap` namespace:
//!
//! ```json
//! {
//!   "netcoap": {
//!     "server": {
//!       "host": "::",
//!       "port": 5684,
//!       "dtls": { "psk-identity": "...", "psk-key": "AABBCC" }
//!     },
//!     "client": { "host": "broker.example", "port": 5684 }
//!   }
//! }
//! ```
//!
//! The DTLS keys are handed to the session collaborator untouched; this
//! library never opens certificate or key files itself.

use super::consts::{CONFIG_NAMESPACE, DEFAULT_PORT_COAP_DTLS};
use super::Error;
use serde::Deserialize;

/// A read-only key/value tree loaded from a JSON configuration file.
///
/// Values are addressed with dotted paths, e.g.
/// `netcoap.server.dtls.psk-identity`.
#[derive(Debug, Clone)]
pub struct PropTree {
    root: serde_json::Value,
}

impl PropTree {
    /// Creates an empty property tree.
    pub fn new() -> PropTree {
        PropTree {
            root: serde_json::Value::Null,
        }
    }

    /// Parses a property tree from a JSON string.
    pub fn from_json_str(json: &str) -> Result<PropTree, Error> {
        Ok(PropTree {
            root: serde_json::from_str(json).map_err(|_| Error::ParseFailure)?,
        })
    }

    /// Loads a property tree from a JSON file.
    pub fn from_json_file(path: &str) -> Result<PropTree, Error> {
        let contents = std::fs::read_to_string(path)?;
        PropTree::from_json_str(&contents)
    }

    /// Looks up a value by dotted path.
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        let mut value = &self.root;
        for segment in path.split('.') {
            value = value.get(segment)?;
        }
        Some(value)
    }

    /// Looks up a string value by dotted path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    /// Looks up an unsigned integer value by dotted path.
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path)?.as_u64()
    }

    /// Looks up a port-sized integer value by dotted path.
    pub fn get_u16(&self, path: &str) -> Option<u16> {
        u16::try_from(self.get_u64(path)?).ok()
    }
}

impl Default for PropTree {
    fn default() -> Self {
        PropTree::new()
    }
}

/// DTLS credential settings, passed through to the session collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DtlsSettings {
    /// Pre-shared-key identity.
    #[serde(rename = "psk-identity")]
    pub psk_identity: Option<String>,

    /// Pre-shared key, hex encoded.
    #[serde(rename = "psk-key")]
    pub psk_key: Option<String>,

    /// Path to a PEM certificate file.
    #[serde(rename = "cert-file")]
    pub cert_file: Option<String>,

    /// Path to a PEM private key file.
    #[serde(rename = "key-file")]
    pub key_file: Option<String>,

    /// Path to a PEM CA bundle file.
    #[serde(rename = "ca-file")]
    pub ca_file: Option<String>,
}

impl DtlsSettings {
    /// Decodes the hex-encoded `psk-key` value into bytes.
    pub fn psk_key_bytes(&self) -> Result<Option<Vec<u8>>, Error> {
        let Some(hex) = self.psk_key.as_deref() else {
            return Ok(None);
        };

        if hex.len() % 2 != 0 {
            return Err(Error::ParseFailure);
        }

        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte =
                u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| Error::ParseFailure)?;
            bytes.push(byte);
        }

        Ok(Some(bytes))
    }
}

/// Network settings for one side of the connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    /// Host name or address to bind (server) or connect to (client).
    pub host: Option<String>,

    /// UDP port; defaults to the `coaps` port 5684.
    pub port: Option<u16>,

    /// DTLS credentials.
    #[serde(default)]
    pub dtls: DtlsSettings,
}

impl EndpointSettings {
    /// The configured port, or the `coaps` default.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT_COAP_DTLS)
    }
}

/// All recognized settings under the `netcoap` namespace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetCoapSettings {
    /// Broker-side settings.
    #[serde(default)]
    pub server: EndpointSettings,

    /// Client-side settings.
    #[serde(default)]
    pub client: EndpointSettings,
}

impl NetCoapSettings {
    /// Extracts the typed settings from a property tree.
    ///
    /// A tree without a `netcoap` section yields all-default settings.
    pub fn from_tree(tree: &PropTree) -> Result<NetCoapSettings, Error> {
        match tree.get(CONFIG_NAMESPACE) {
            Some(section) => {
                serde_json::from_value(section.clone()).map_err(|_| Error::ParseFailure)
            }
            None => Ok(NetCoapSettings::default()),
        }
    }
}
