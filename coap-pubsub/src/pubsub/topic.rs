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

use super::super::consts::RT_CORE_PS_CONF;
use super::super::props::PropValue;
use super::super::Error;
use std::collections::BTreeMap;

/// A topic's configuration document.
///
/// The recognized properties are CBOR/JSON interoperable and travel in
/// topic-create requests, configuration representations, FETCH filters,
/// and iPATCH merges.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicCfg {
    /// Human-readable topic name (`topic-name`).
    pub name: String,

    /// URI path of the topic data resource (`topic-data`).
    pub data_path: String,

    /// CoAP content format id of publications (`topic-media-type`).
    pub media_type: Option<u32>,

    /// Free-form classifier (`topic-type`).
    pub topic_type: Option<String>,

    /// RFC3339 expiration timestamp (`expiration-date`).
    pub expiration_date: Option<String>,

    /// Subscriber limit (`max-subscribers`).
    pub max_subscribers: Option<u32>,

    /// Interval, in seconds, between confirmable notification refreshes
    /// (`observer-check`).
    pub observer_check: Option<u32>,
}

impl TopicCfg {
    /// Property key of the topic name.
    pub const TOPIC_NAME: &'static str = "topic-name";

    /// Property key of the data resource path.
    pub const TOPIC_DATA: &'static str = "topic-data";

    /// Property key of the publication content format.
    pub const TOPIC_MEDIA_TYPE: &'static str = "topic-media-type";

    /// Property key of the free-form classifier.
    pub const TOPIC_TYPE: &'static str = "topic-type";

    /// Property key of the expiration timestamp.
    pub const EXPIRATION_DATE: &'static str = "expiration-date";

    /// Property key of the subscriber limit.
    pub const MAX_SUBSCRIBERS: &'static str = "max-subscribers";

    /// Property key of the confirmable-refresh interval.
    pub const OBSERVER_CHECK: &'static str = "observer-check";

    /// Property key of the resource type.
    pub const RESOURCE_TYPE: &'static str = "resource-type";

    /// Property key naming a FETCH projection list.
    pub const CONFIG_FILTER: &'static str = "config-filter";

    /// Parses a topic-create document. `topic-name` and `topic-data` are
    /// required; everything else is optional.
    pub fn from_props(props: &PropValue) -> Result<TopicCfg, Error> {
        let map = props.as_map().ok_or(Error::InvalidArgument)?;

        let name = map
            .get(Self::TOPIC_NAME)
            .and_then(PropValue::as_str)
            .ok_or(Error::InvalidArgument)?
            .to_string();

        let data_path = map
            .get(Self::TOPIC_DATA)
            .and_then(PropValue::as_str)
            .ok_or(Error::InvalidArgument)?
            .to_string();

        if !data_path.starts_with('/') {
            return Err(Error::InvalidArgument);
        }

        let mut cfg = TopicCfg {
            name,
            data_path,
            media_type: None,
            topic_type: None,
            expiration_date: None,
            max_subscribers: None,
            observer_check: None,
        };

        cfg.apply(map, false)?;

        Ok(cfg)
    }

    /// Merges an iPATCH property map into this configuration.
    ///
    /// The data path is structural (it names a live resource) and cannot be
    /// changed after creation.
    pub fn merge_props(&mut self, props: &PropValue) -> Result<(), Error> {
        let map = props.as_map().ok_or(Error::InvalidArgument)?;

        if map.contains_key(Self::TOPIC_DATA) {
            return Err(Error::InvalidArgument);
        }

        if let Some(name) = map.get(Self::TOPIC_NAME) {
            self.name = name.as_str().ok_or(Error::InvalidArgument)?.to_string();
        }

        self.apply(map, true)
    }

    fn apply(
        &mut self,
        map: &BTreeMap<String, PropValue>,
        strict_keys: bool,
    ) -> Result<(), Error> {
        for (key, value) in map {
            match key.as_str() {
                Self::TOPIC_NAME | Self::TOPIC_DATA => {}
                Self::TOPIC_MEDIA_TYPE => {
                    self.media_type = Some(value.as_u32().ok_or(Error::InvalidArgument)?);
                }
                Self::TOPIC_TYPE => {
                    self.topic_type =
                        Some(value.as_str().ok_or(Error::InvalidArgument)?.to_string());
                }
                Self::EXPIRATION_DATE => {
                    self.expiration_date =
                        Some(value.as_str().ok_or(Error::InvalidArgument)?.to_string());
                }
                Self::MAX_SUBSCRIBERS => {
                    self.max_subscribers = Some(value.as_u32().ok_or(Error::InvalidArgument)?);
                }
                Self::OBSERVER_CHECK => {
                    self.observer_check = Some(value.as_u32().ok_or(Error::InvalidArgument)?);
                }
                Self::RESOURCE_TYPE => {
                    // Accepted on input, always rendered as core.ps.conf.
                }
                _ if strict_keys => return Err(Error::InvalidArgument),
                _ => {}
            }
        }

        Ok(())
    }

    /// Renders the full configuration document.
    pub fn to_props(&self) -> PropValue {
        let mut map = BTreeMap::new();

        map.insert(Self::TOPIC_NAME.to_string(), PropValue::from(self.name.clone()));
        map.insert(
            Self::TOPIC_DATA.to_string(),
            PropValue::from(self.data_path.clone()),
        );
        map.insert(
            Self::RESOURCE_TYPE.to_string(),
            PropValue::from(RT_CORE_PS_CONF),
        );

        if let Some(media_type) = self.media_type {
            map.insert(Self::TOPIC_MEDIA_TYPE.to_string(), PropValue::from(media_type));
        }
        if let Some(topic_type) = &self.topic_type {
            map.insert(Self::TOPIC_TYPE.to_string(), PropValue::from(topic_type.clone()));
        }
        if let Some(expiration) = &self.expiration_date {
            map.insert(
                Self::EXPIRATION_DATE.to_string(),
                PropValue::from(expiration.clone()),
            );
        }
        if let Some(max_subscribers) = self.max_subscribers {
            map.insert(
                Self::MAX_SUBSCRIBERS.to_string(),
                PropValue::from(max_subscribers),
            );
        }
        if let Some(observer_check) = self.observer_check {
            map.insert(
                Self::OBSERVER_CHECK.to_string(),
                PropValue::from(observer_check),
            );
        }

        PropValue::Map(map)
    }

    /// Renders only the properties named in a `config-filter` projection
    /// list. Unknown names yield no entry.
    pub fn projection(&self, names: &[PropValue]) -> PropValue {
        let full = self.to_props();
        let full_map = full.as_map().unwrap();

        let mut out = BTreeMap::new();
        for name in names {
            if let Some(name) = name.as_str() {
                if let Some(value) = full_map.get(name) {
                    out.insert(name.to_string(), value.clone());
                }
            }
        }

        PropValue::Map(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_props() -> PropValue {
        let mut map = BTreeMap::new();
        map.insert("topic-name".to_string(), PropValue::from("Weather"));
        map.insert(
            "topic-data".to_string(),
            PropValue::from("/www/topic/ps/weather"),
        );
        map.insert("topic-type".to_string(), PropValue::from("temperature"));
        map.insert("topic-media-type".to_string(), PropValue::Int(50));
        PropValue::Map(map)
    }

    #[test]
    fn parse_create_document() {
        let cfg = TopicCfg::from_props(&create_props()).unwrap();
        assert_eq!(cfg.name, "Weather");
        assert_eq!(cfg.data_path, "/www/topic/ps/weather");
        assert_eq!(cfg.topic_type.as_deref(), Some("temperature"));
        assert_eq!(cfg.media_type, Some(50));
        assert_eq!(cfg.max_subscribers, None);
    }

    #[test]
    fn missing_required_property() {
        let mut map = BTreeMap::new();
        map.insert("topic-name".to_string(), PropValue::from("NoData"));
        assert!(TopicCfg::from_props(&PropValue::Map(map)).is_err());
    }

    #[test]
    fn relative_data_path_rejected() {
        let mut map = BTreeMap::new();
        map.insert("topic-name".to_string(), PropValue::from("Bad"));
        map.insert("topic-data".to_string(), PropValue::from("no/leading/slash"));
        assert!(TopicCfg::from_props(&PropValue::Map(map)).is_err());
    }

    #[test]
    fn render_includes_resource_type() {
        let cfg = TopicCfg::from_props(&create_props()).unwrap();
        let props = cfg.to_props();
        assert_eq!(
            props.get(TopicCfg::RESOURCE_TYPE).and_then(PropValue::as_str),
            Some(RT_CORE_PS_CONF)
        );
        assert_eq!(
            props.get(TopicCfg::TOPIC_NAME).and_then(PropValue::as_str),
            Some("Weather")
        );
    }

    #[test]
    fn merge_updates_allowed_properties() {
        let mut cfg = TopicCfg::from_props(&create_props()).unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("max-subscribers".to_string(), PropValue::Int(100));
        cfg.merge_props(&PropValue::Map(patch)).unwrap();
        assert_eq!(cfg.max_subscribers, Some(100));

        // The data path is immutable.
        let mut patch = BTreeMap::new();
        patch.insert("topic-data".to_string(), PropValue::from("/elsewhere"));
        assert!(cfg.merge_props(&PropValue::Map(patch)).is_err());

        // Unknown keys are rejected on merge.
        let mut patch = BTreeMap::new();
        patch.insert("bogus".to_string(), PropValue::Int(1));
        assert!(cfg.merge_props(&PropValue::Map(patch)).is_err());
    }

    #[test]
    fn projection_selects_named_properties() {
        let cfg = TopicCfg::from_props(&create_props()).unwrap();

        let names = vec![
            PropValue::from("topic-data"),
            PropValue::from("topic-media-type"),
            PropValue::from("no-such-property"),
        ];
        let projection = cfg.projection(&names);
        let map = projection.as_map().unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("topic-data").and_then(PropValue::as_str),
            Some("/www/topic/ps/weather")
        );
    }
}
