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

//! CBOR/JSON-interoperable property maps.
//!
//! Topic configuration documents and FETCH filters travel as maps that may
//! be encoded as either CBOR (`application/cbor`) or JSON
//! (`application/json`). [`PropValue`] is the common in-memory form; the
//! broker parses payloads into it and renders responses from it.

use super::{ContentFormat, Error};
use std::collections::BTreeMap;

/// A property tree value, the common denominator of the CBOR and JSON data
/// models used by the pub/sub extension.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Absent/null value.
    Null,

    /// Boolean value.
    Bool(bool),

    /// Integer value.
    Int(i64),

    /// Floating point value.
    Float(f64),

    /// UTF8 string value.
    Str(String),

    /// Ordered list of values.
    Array(Vec<PropValue>),

    /// String-keyed map of values, ordered by key.
    Map(BTreeMap<String, PropValue>),
}

impl PropValue {
    /// Creates an empty map value.
    pub fn empty_map() -> PropValue {
        PropValue::Map(BTreeMap::new())
    }

    /// Decodes a property map from `payload` according to `format`.
    ///
    /// CBOR is assumed when no content format is given, matching the
    /// `application/cbor` default of the pub/sub drafts.
    pub fn decode(payload: &[u8], format: Option<ContentFormat>) -> Result<PropValue, Error> {
        match format {
            Some(fmt) if fmt.is_json() => PropValue::from_json_slice(payload),
            Some(fmt) if fmt.is_cbor() => PropValue::from_cbor(payload),
            None => PropValue::from_cbor(payload),
            Some(_) => Err(Error::InvalidArgument),
        }
    }

    /// Parses a CBOR-encoded property tree.
    pub fn from_cbor(payload: &[u8]) -> Result<PropValue, Error> {
        let value: ciborium::value::Value =
            ciborium::de::from_reader(payload).map_err(|_| Error::ParseFailure)?;
        PropValue::from_cbor_value(value)
    }

    /// Serializes this property tree as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor_value(), &mut out)
            .map_err(|_| Error::Unspecified)?;
        Ok(out)
    }

    /// Parses a JSON-encoded property tree.
    pub fn from_json_slice(payload: &[u8]) -> Result<PropValue, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|_| Error::ParseFailure)?;
        Ok(PropValue::from_json_value(value))
    }

    /// Serializes this property tree as JSON.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(&self.to_json_value()).map_err(|_| Error::Unspecified)
    }

    /// Serializes this property tree with the given content format.
    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>, Error> {
        if format.is_json() {
            self.to_json_vec()
        } else if format.is_cbor() {
            self.to_cbor()
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn from_cbor_value(value: ciborium::value::Value) -> Result<PropValue, Error> {
        use ciborium::value::Value;

        Ok(match value {
            Value::Null => PropValue::Null,
            Value::Bool(b) => PropValue::Bool(b),
            Value::Integer(i) => {
                let i: i128 = i.into();
                PropValue::Int(i64::try_from(i).map_err(|_| Error::ParseFailure)?)
            }
            Value::Float(f) => PropValue::Float(f),
            Value::Text(s) => PropValue::Str(s),
            Value::Bytes(_) => return Err(Error::ParseFailure),
            Value::Array(values) => PropValue::Array(
                values
                    .into_iter()
                    .map(PropValue::from_cbor_value)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match key {
                        Value::Text(s) => s,
                        _ => return Err(Error::ParseFailure),
                    };
                    map.insert(key, PropValue::from_cbor_value(value)?);
                }
                PropValue::Map(map)
            }
            _ => return Err(Error::ParseFailure),
        })
    }

    fn to_cbor_value(&self) -> ciborium::value::Value {
        use ciborium::value::Value;

        match self {
            PropValue::Null => Value::Null,
            PropValue::Bool(b) => Value::Bool(*b),
            PropValue::Int(i) => Value::Integer((*i).into()),
            PropValue::Float(f) => Value::Float(*f),
            PropValue::Str(s) => Value::Text(s.clone()),
            PropValue::Array(values) => {
                Value::Array(values.iter().map(PropValue::to_cbor_value).collect())
            }
            PropValue::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (Value::Text(k.clone()), v.to_cbor_value()))
                    .collect(),
            ),
        }
    }

    fn from_json_value(value: serde_json::Value) -> PropValue {
        use serde_json::Value;

        match value {
            Value::Null => PropValue::Null,
            Value::Bool(b) => PropValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropValue::Int(i)
                } else {
                    PropValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => PropValue::Str(s),
            Value::Array(values) => {
                PropValue::Array(values.into_iter().map(PropValue::from_json_value).collect())
            }
            Value::Object(map) => PropValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PropValue::from_json_value(v)))
                    .collect(),
            ),
        }
    }

    fn to_json_value(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            PropValue::Null => Value::Null,
            PropValue::Bool(b) => Value::Bool(*b),
            PropValue::Int(i) => Value::Number((*i).into()),
            PropValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropValue::Str(s) => Value::String(s.clone()),
            PropValue::Array(values) => {
                Value::Array(values.iter().map(PropValue::to_json_value).collect())
            }
            PropValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
        }
    }

    /// Returns the string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the integer value as a `u32`, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|i| u32::try_from(i).ok())
    }

    /// Returns the float value, also accepting integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            PropValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns a reference to the underlying map, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, PropValue>> {
        match self {
            PropValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns a mutable reference to the underlying map, if this is a map.
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, PropValue>> {
        match self {
            PropValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the array items, if this is an array.
    pub fn as_array(&self) -> Option<&[PropValue]> {
        match self {
            PropValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Looks up a key, if this is a map.
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.as_map()?.get(key)
    }

    /// Returns true if every key/value pair of `filter` is present in this
    /// map with an equal value. Non-map values never match.
    pub fn matches_all(&self, filter: &BTreeMap<String, PropValue>) -> bool {
        match self.as_map() {
            Some(map) => filter
                .iter()
                .all(|(key, expected)| map.get(key) == Some(expected)),
            None => false,
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Str(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::Str(s)
    }
}

impl From<i64> for PropValue {
    fn from(i: i64) -> Self {
        PropValue::Int(i)
    }
}

impl From<u32> for PropValue {
    fn from(i: u32) -> Self {
        PropValue::Int(i as i64)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_map() -> PropValue {
        let mut map = BTreeMap::new();
        map.insert("topic-name".to_string(), PropValue::from("Weather"));
        map.insert(
            "topic-data".to_string(),
            PropValue::from("/www/topic/ps/weather"),
        );
        map.insert("topic-media-type".to_string(), PropValue::Int(50));
        PropValue::Map(map)
    }

    #[test]
    fn cbor_round_trip() {
        let value = weather_map();
        let bytes = value.to_cbor().unwrap();
        assert_eq!(PropValue::from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn json_round_trip() {
        let value = weather_map();
        let bytes = value.to_json_vec().unwrap();
        assert_eq!(PropValue::from_json_slice(&bytes).unwrap(), value);
    }

    #[test]
    fn json_and_cbor_agree() {
        let json = br#"{"topic-name":"Weather","topic-media-type":50,"nested":{"a":[1,2,3]}}"#;
        let from_json = PropValue::from_json_slice(json).unwrap();
        let cbor_bytes = from_json.to_cbor().unwrap();
        assert_eq!(PropValue::from_cbor(&cbor_bytes).unwrap(), from_json);
    }

    #[test]
    fn decode_respects_content_format() {
        let value = weather_map();

        let json = value.to_json_vec().unwrap();
        assert_eq!(
            PropValue::decode(&json, Some(ContentFormat::APPLICATION_JSON)).unwrap(),
            value
        );

        let cbor = value.to_cbor().unwrap();
        assert_eq!(
            PropValue::decode(&cbor, Some(ContentFormat::APPLICATION_CBOR)).unwrap(),
            value
        );

        assert!(PropValue::decode(&cbor, Some(ContentFormat::TEXT_PLAIN_UTF8)).is_err());
    }

    #[test]
    fn filter_matching() {
        let value = weather_map();

        let mut filter = BTreeMap::new();
        filter.insert("topic-media-type".to_string(), PropValue::Int(50));
        assert!(value.matches_all(&filter));

        filter.insert("topic-name".to_string(), PropValue::from("Humidity"));
        assert!(!value.matches_all(&filter));
    }

    #[test]
    fn malformed_input_is_parse_failure() {
        assert_eq!(
            PropValue::from_json_slice(b"{not json").err(),
            Some(Error::ParseFailure)
        );
        assert_eq!(
            PropValue::from_cbor(&[0xFF, 0xFF]).err(),
            Some(Error::ParseFailure)
        );
    }
}
