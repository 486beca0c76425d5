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

use super::super::consts::{
    MAX_NOTIFY_CON_INTERVAL_SECS, RT_CORE_PS_COLL, RT_CORE_PS_CONF, RT_CORE_PS_DATA,
};
use super::super::message::{MsgCode, MsgToken};
use super::super::observe::ObserveSeq;
use super::super::props::PropValue;
use super::super::resource::{
    LinkFilter, MethodSet, ResourceAttrs, ResourceEntry, ResourceKind, ResourceTree, TopicId,
};
use super::super::{ContentFormat, ETag};
use super::TopicCfg;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// One registered observer of a topic data resource.
#[derive(Debug, Clone)]
pub struct Subscription<P> {
    /// Observing peer.
    pub peer: P,

    /// Token the observer registered with; every notification carries it.
    pub token: MsgToken,

    /// Optional `topic-type` filter: only publications carrying a matching
    /// `topic-type` Uri-Query are delivered.
    pub filter: Option<String>,

    /// When the last confirmable notification was sent.
    pub last_con: Instant,
}

/// The current representation of a topic data resource.
#[derive(Debug, Clone)]
pub struct TopicData {
    /// Published payload bytes.
    pub payload: Vec<u8>,

    /// Content format the payload was published with.
    pub content_format: Option<ContentFormat>,

    /// Version identifier of this representation.
    pub etag: ETag,

    /// When the payload was last replaced.
    pub last_modified: Instant,
}

/// A representation pinned for an in-progress block-wise download.
///
/// When a notification exceeds the block size, only the first block is sent;
/// the subscriber fetches the rest with Block2 requests. The pinned copy
/// keeps those follow-up reads consistent even if a newer publication
/// arrives meanwhile.
#[derive(Debug, Clone)]
pub struct PinnedRep {
    /// The complete representation.
    pub payload: Vec<u8>,

    /// Content format of the representation.
    pub content_format: Option<ContentFormat>,

    /// ETag of the representation.
    pub etag: ETag,

    /// When the representation was pinned.
    pub created: Instant,
}

/// A topic: configuration, data, and subscriber set.
#[derive(Debug)]
pub struct Topic<P> {
    /// Configuration document.
    pub cfg: TopicCfg,

    /// Path of the configuration resource.
    pub cfg_path: String,

    /// Observe sequence number of the data resource.
    pub seq: ObserveSeq,

    /// Last published representation, if any.
    pub data: Option<TopicData>,

    /// Subscribers in registration order; fan-out iterates this order.
    pub subs: Vec<Subscription<P>>,

    /// Representation pinned for a block-wise download, if any.
    pub pinned: Option<PinnedRep>,
}

impl<P> Topic<P> {
    /// The confirmable-refresh interval for this topic: `observer-check`
    /// seconds, capped at 24 hours.
    pub fn con_refresh_interval(&self) -> Duration {
        let secs = self
            .cfg
            .observer_check
            .map(u64::from)
            .unwrap_or(MAX_NOTIFY_CON_INTERVAL_SECS)
            .min(MAX_NOTIFY_CON_INTERVAL_SECS);
        Duration::from_secs(secs)
    }
}

/// One notification to deliver to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<P> {
    /// Destination peer.
    pub peer: P,

    /// Token of the subscription.
    pub token: MsgToken,

    /// Observe sequence value to carry.
    pub seq: ObserveSeq,

    /// Payload of the publication.
    pub payload: Vec<u8>,

    /// Content format of the payload.
    pub content_format: Option<ContentFormat>,

    /// ETag of the representation.
    pub etag: ETag,

    /// Whether to send confirmable (true) or non-confirmable (false).
    pub confirmable: bool,

    /// Topic the notification belongs to.
    pub topic: TopicId,
}

/// Owner of the topic collection, all topics, and the resource tree.
#[derive(Debug)]
pub struct PubSubManager<P> {
    tree: ResourceTree,
    topics: Vec<Option<Topic<P>>>,
    collection_path: String,
    next_cfg_id: u32,
    next_etag: u32,
}

impl<P: Copy + Eq + Hash> PubSubManager<P> {
    /// Creates a manager whose topic collection lives at `collection_path`.
    pub fn new(collection_path: &str) -> PubSubManager<P> {
        let mut tree = ResourceTree::new();

        tree.insert(
            collection_path,
            ResourceEntry {
                kind: ResourceKind::TopicCollection,
                attrs: ResourceAttrs {
                    resource_type: Some(RT_CORE_PS_COLL.to_string()),
                    content_format: Some(ContentFormat::APPLICATION_LINK_FORMAT.0),
                    ..Default::default()
                },
                methods: MethodSet::none()
                    .with(MsgCode::MethodGet)
                    .with(MsgCode::MethodPost)
                    .with(MsgCode::MethodFetch),
            },
        );

        PubSubManager {
            tree,
            topics: Vec::new(),
            collection_path: collection_path.to_string(),
            next_cfg_id: 1,
            next_etag: 1,
        }
    }

    /// Path of the topic collection resource.
    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    /// The resource tree (for lookup and discovery listings).
    pub fn tree(&self) -> &ResourceTree {
        &self.tree
    }

    /// Looks up a live topic.
    pub fn topic(&self, id: TopicId) -> Option<&Topic<P>> {
        self.topics.get(id)?.as_ref()
    }

    /// Looks up a live topic mutably.
    pub fn topic_mut(&mut self, id: TopicId) -> Option<&mut Topic<P>> {
        self.topics.get_mut(id)?.as_mut()
    }

    /// Creates a topic from a configuration document. Returns the new
    /// topic id, or the error response code.
    pub fn create_topic(&mut self, props: &PropValue) -> Result<TopicId, MsgCode> {
        let cfg =
            TopicCfg::from_props(props).map_err(|_| MsgCode::ClientErrorBadRequest)?;

        // The data path must not collide with any live resource.
        if self.tree.lookup(&cfg.data_path).is_some() {
            return Err(MsgCode::ClientErrorBadRequest);
        }

        let id = self.topics.len();
        let cfg_path = format!("{}/conf/{}", self.collection_path, self.next_cfg_id);
        self.next_cfg_id += 1;

        self.tree.insert(
            &cfg_path,
            ResourceEntry {
                kind: ResourceKind::TopicConfig(id),
                attrs: ResourceAttrs {
                    resource_type: Some(RT_CORE_PS_CONF.to_string()),
                    content_format: Some(ContentFormat::APPLICATION_CBOR.0),
                    title: Some(cfg.name.clone()),
                    ..Default::default()
                },
                methods: MethodSet::none()
                    .with(MsgCode::MethodGet)
                    .with(MsgCode::MethodFetch)
                    .with(MsgCode::MethodIPatch)
                    .with(MsgCode::MethodDelete),
            },
        );

        self.tree.insert(
            &cfg.data_path,
            ResourceEntry {
                kind: ResourceKind::TopicData(id),
                attrs: ResourceAttrs {
                    resource_type: Some(RT_CORE_PS_DATA.to_string()),
                    content_format: cfg.media_type.and_then(|ct| u16::try_from(ct).ok()),
                    observable: true,
                    ..Default::default()
                },
                methods: MethodSet::none()
                    .with(MsgCode::MethodGet)
                    .with(MsgCode::MethodPut),
            },
        );

        self.topics.push(Some(Topic {
            cfg,
            cfg_path,
            seq: ObserveSeq::default(),
            data: None,
            subs: Vec::new(),
            pinned: None,
        }));

        Ok(id)
    }

    /// Deletes a topic, removing both its resources. Returns the removed
    /// topic (with its subscriber set, so the caller can notify).
    pub fn delete_topic(&mut self, id: TopicId) -> Option<Topic<P>> {
        let topic = self.topics.get_mut(id)?.take()?;

        self.tree.remove(&topic.cfg_path);
        self.tree.remove(&topic.cfg.data_path);

        Some(topic)
    }

    /// Renders the collection's GET representation: a link-format listing
    /// of the contained configuration resources.
    pub fn config_listing(&self) -> String {
        let mut out = String::new();
        self.tree.write_link_format(
            &LinkFilter {
                resource_type: Some(RT_CORE_PS_CONF.to_string()),
                content_format: None,
                href_prefix: Some(self.collection_path.clone()),
            },
            &mut out,
        );
        out
    }

    /// Renders a discovery listing for an arbitrary filter.
    pub fn discovery_listing(&self, filter: &LinkFilter) -> String {
        let mut out = String::new();
        self.tree.write_link_format(filter, &mut out);
        out
    }

    /// Handles FETCH on the collection: returns a link-format listing of
    /// the configurations matching every property of `filter`.
    pub fn fetch_collection(&self, filter: &PropValue) -> Result<String, MsgCode> {
        let filter_map = filter
            .as_map()
            .ok_or(MsgCode::ClientErrorBadRequest)?;

        let mut out = String::new();
        let mut write = super::super::link_format::LinkFormatWrite::new(&mut out);

        for topic in self.topics.iter().flatten() {
            if topic.cfg.to_props().matches_all(filter_map) {
                write
                    .link(&topic.cfg_path)
                    .attr_quoted(
                        super::super::link_format::LINK_ATTR_RESOURCE_TYPE,
                        RT_CORE_PS_CONF,
                    )
                    .finish()
                    .ok();
            }
        }

        write.finish().ok();
        Ok(out)
    }

    /// Handles FETCH on a configuration resource: a projection of the
    /// properties named by the `config-filter` list.
    pub fn fetch_cfg(&self, id: TopicId, filter: &PropValue) -> Result<PropValue, MsgCode> {
        let topic = self.topic(id).ok_or(MsgCode::ClientErrorNotFound)?;

        let names = filter
            .get(TopicCfg::CONFIG_FILTER)
            .and_then(PropValue::as_array)
            .ok_or(MsgCode::ClientErrorBadRequest)?;

        Ok(topic.cfg.projection(names))
    }

    /// Handles iPATCH on a configuration resource: merges properties and
    /// returns the updated document.
    pub fn ipatch_cfg(&mut self, id: TopicId, props: &PropValue) -> Result<PropValue, MsgCode> {
        let topic = self.topic_mut(id).ok_or(MsgCode::ClientErrorNotFound)?;

        topic
            .cfg
            .merge_props(props)
            .map_err(|_| MsgCode::ClientErrorBadRequest)?;

        Ok(topic.cfg.to_props())
    }

    /// Registers (or refreshes) a subscription. On success returns the
    /// current observe sequence and representation for the immediate
    /// response. Enforces `max-subscribers` with 5.03.
    pub fn subscribe(
        &mut self,
        id: TopicId,
        peer: P,
        token: MsgToken,
        filter: Option<String>,
        now: Instant,
    ) -> Result<(ObserveSeq, Option<TopicData>), MsgCode> {
        let topic = self.topic_mut(id).ok_or(MsgCode::ClientErrorNotFound)?;

        if let Some(existing) = topic
            .subs
            .iter_mut()
            .find(|sub| sub.peer == peer && sub.token == token)
        {
            existing.filter = filter;
            return Ok((topic.seq, topic.data.clone()));
        }

        if let Some(limit) = topic.cfg.max_subscribers {
            if topic.subs.len() as u32 >= limit {
                return Err(MsgCode::ServerErrorServiceUnavailable);
            }
        }

        topic.subs.push(Subscription {
            peer,
            token,
            filter,
            last_con: now,
        });

        Ok((topic.seq, topic.data.clone()))
    }

    /// Removes a subscription (Observe=1 deregistration). Returns the
    /// current sequence and representation for the closing response, or
    /// `None` if no such subscription existed.
    pub fn unsubscribe(
        &mut self,
        id: TopicId,
        peer: P,
        token: MsgToken,
    ) -> Option<(ObserveSeq, Option<TopicData>)> {
        let topic = self.topic_mut(id)?;
        let before = topic.subs.len();
        topic.subs.retain(|sub| !(sub.peer == peer && sub.token == token));

        if topic.subs.len() < before {
            Some((topic.seq, topic.data.clone()))
        } else {
            None
        }
    }

    /// Removes whatever subscription `(peer, token)` names, regardless of
    /// topic. Used when a notification is rejected with RST.
    pub fn drop_subscription(&mut self, peer: P, token: MsgToken) -> Option<TopicId> {
        for (id, topic) in self.topics.iter_mut().enumerate() {
            let Some(topic) = topic else { continue };
            let before = topic.subs.len();
            topic.subs.retain(|sub| !(sub.peer == peer && sub.token == token));
            if topic.subs.len() < before {
                return Some(id);
            }
        }
        None
    }

    /// Removes every subscription held by `peer` (session teardown).
    pub fn remove_peer(&mut self, peer: P) {
        for topic in self.topics.iter_mut().flatten() {
            topic.subs.retain(|sub| sub.peer != peer);
        }
    }

    /// Stores a publication on a topic data resource.
    ///
    /// Validates the content format against `topic-media-type` (4.15) and a
    /// `topic-type` query against the configured classifier (4.00), bumps
    /// the ETag and observe sequence, and returns the notifications to
    /// fan out. The subscriber iteration order is the registration order,
    /// frozen for this publication.
    pub fn publish(
        &mut self,
        id: TopicId,
        payload: Vec<u8>,
        content_format: Option<ContentFormat>,
        topic_type: Option<&str>,
        now: Instant,
    ) -> Result<Vec<Notification<P>>, MsgCode> {
        let etag = ETag::from(self.next_etag);
        self.next_etag = self.next_etag.wrapping_add(1).max(1);

        let topic = self.topic_mut(id).ok_or(MsgCode::ClientErrorNotFound)?;

        if let (Some(expected), Some(ContentFormat(actual))) =
            (topic.cfg.media_type, content_format)
        {
            if expected != actual as u32 {
                return Err(MsgCode::ClientErrorUnsupportedMediaType);
            }
        }

        if let (Some(configured), Some(published)) =
            (topic.cfg.topic_type.as_deref(), topic_type)
        {
            if configured != published {
                return Err(MsgCode::ClientErrorBadRequest);
            }
        }

        topic.data = Some(TopicData {
            payload: payload.clone(),
            content_format,
            etag,
            last_modified: now,
        });

        let seq = topic.seq.increment();
        let refresh = topic.con_refresh_interval();

        let mut notifications = Vec::new();
        for sub in topic.subs.iter_mut() {
            let matches = match (&sub.filter, topic_type) {
                (None, _) => true,
                (Some(filter), Some(published)) => filter == published,
                (Some(_), None) => false,
            };

            if !matches {
                continue;
            }

            let confirmable = now.duration_since(sub.last_con) >= refresh;
            if confirmable {
                sub.last_con = now;
            }

            notifications.push(Notification {
                peer: sub.peer,
                token: sub.token,
                seq,
                payload: payload.clone(),
                content_format,
                etag,
                confirmable,
                topic: id,
            });
        }

        Ok(notifications)
    }

    /// Produces confirmable refresh notifications for subscriptions whose
    /// `observer-check` interval has elapsed without a CON.
    pub fn due_con_refresh(&mut self, now: Instant) -> Vec<Notification<P>> {
        let mut notifications = Vec::new();

        for (id, topic) in self.topics.iter_mut().enumerate() {
            let Some(topic) = topic else { continue };
            let Some(data) = topic.data.clone() else { continue };
            let refresh = topic.con_refresh_interval();
            let seq = topic.seq;

            for sub in topic.subs.iter_mut() {
                if now.duration_since(sub.last_con) < refresh {
                    continue;
                }
                sub.last_con = now;

                notifications.push(Notification {
                    peer: sub.peer,
                    token: sub.token,
                    seq,
                    payload: data.payload.clone(),
                    content_format: data.content_format,
                    etag: data.etag,
                    confirmable: true,
                    topic: id,
                });
            }
        }

        notifications
    }

    /// Pins the current representation of a topic for a block-wise
    /// download.
    pub fn pin_representation(&mut self, id: TopicId, now: Instant) {
        if let Some(topic) = self.topic_mut(id) {
            if let Some(data) = &topic.data {
                topic.pinned = Some(PinnedRep {
                    payload: data.payload.clone(),
                    content_format: data.content_format,
                    etag: data.etag,
                    created: now,
                });
            }
        }
    }

    /// Drops pinned representations older than `lifetime`
    /// (EXCHANGE_LIFETIME).
    pub fn expire_pinned(&mut self, now: Instant, lifetime: Duration) {
        for topic in self.topics.iter_mut().flatten() {
            if let Some(pinned) = &topic.pinned {
                if now.duration_since(pinned.created) >= lifetime {
                    topic.pinned = None;
                }
            }
        }
    }

    /// Total number of live subscriptions across all topics.
    pub fn subscription_count(&self) -> usize {
        self.topics
            .iter()
            .flatten()
            .map(|topic| topic.subs.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_props(name: &str, data_path: &str, topic_type: Option<&str>) -> PropValue {
        let mut map = BTreeMap::new();
        map.insert("topic-name".to_string(), PropValue::from(name));
        map.insert("topic-data".to_string(), PropValue::from(data_path));
        if let Some(t) = topic_type {
            map.insert("topic-type".to_string(), PropValue::from(t));
        }
        PropValue::Map(map)
    }

    fn manager_with_weather() -> (PubSubManager<&'static str>, TopicId) {
        let mut manager = PubSubManager::new("/www/topic/ps");
        let id = manager
            .create_topic(&create_props(
                "Weather",
                "/www/topic/ps/weather",
                Some("temperature"),
            ))
            .unwrap();
        (manager, id)
    }

    #[test]
    fn create_registers_both_resources() {
        let (manager, id) = manager_with_weather();

        let topic = manager.topic(id).unwrap();
        assert_eq!(topic.cfg_path, "/www/topic/ps/conf/1");

        let cfg_entry = manager.tree().lookup("/www/topic/ps/conf/1").unwrap();
        assert_eq!(cfg_entry.kind, ResourceKind::TopicConfig(id));

        let data_entry = manager.tree().lookup("/www/topic/ps/weather").unwrap();
        assert_eq!(data_entry.kind, ResourceKind::TopicData(id));
        assert!(data_entry.attrs.observable);
    }

    #[test]
    fn create_rejects_colliding_data_path() {
        let (mut manager, _) = manager_with_weather();
        assert_eq!(
            manager.create_topic(&create_props("Dup", "/www/topic/ps/weather", None)),
            Err(MsgCode::ClientErrorBadRequest)
        );
    }

    #[test]
    fn delete_removes_resources() {
        let (mut manager, id) = manager_with_weather();
        assert!(manager.delete_topic(id).is_some());
        assert!(manager.tree().lookup("/www/topic/ps/weather").is_none());
        assert!(manager.tree().lookup("/www/topic/ps/conf/1").is_none());
        assert!(manager.delete_topic(id).is_none());
    }

    #[test]
    fn subscribe_then_publish_notifies_in_order() {
        let (mut manager, id) = manager_with_weather();
        let now = Instant::now();

        manager
            .subscribe(id, "sub-a", MsgToken::from(1u32), None, now)
            .unwrap();
        manager
            .subscribe(id, "sub-b", MsgToken::from(2u32), None, now)
            .unwrap();

        let notifications = manager
            .publish(id, b"21.5".to_vec(), Some(ContentFormat::TEXT_PLAIN_UTF8), None, now)
            .unwrap();

        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].peer, "sub-a");
        assert_eq!(notifications[1].peer, "sub-b");
        assert_eq!(notifications[0].seq, ObserveSeq::new(1));
        assert_eq!(notifications[0].payload, b"21.5");
    }

    #[test]
    fn topic_type_filter_gates_notifications() {
        let (mut manager, id) = manager_with_weather();
        let now = Instant::now();

        manager
            .subscribe(
                id,
                "sub",
                MsgToken::from(1u32),
                Some("temperature".to_string()),
                now,
            )
            .unwrap();

        let notifications = manager
            .publish(
                id,
                b"71.5".to_vec(),
                None,
                Some("temperature"),
                now,
            )
            .unwrap();
        assert_eq!(notifications.len(), 1);

        // A mismatching publish against the configured classifier is a bad
        // request and reaches nobody; the subscription stays.
        assert_eq!(
            manager.publish(id, b"x".to_vec(), None, Some("humidity"), now),
            Err(MsgCode::ClientErrorBadRequest)
        );
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn max_subscribers_enforced() {
        let mut manager = PubSubManager::new("/ps");
        let mut props = create_props("Limited", "/ps/limited", None);
        props
            .as_map_mut()
            .unwrap()
            .insert("max-subscribers".to_string(), PropValue::Int(1));
        let id = manager.create_topic(&props).unwrap();
        let now = Instant::now();

        manager
            .subscribe(id, "first", MsgToken::from(1u32), None, now)
            .unwrap();
        assert_eq!(
            manager
                .subscribe(id, "second", MsgToken::from(2u32), None, now)
                .err(),
            Some(MsgCode::ServerErrorServiceUnavailable)
        );
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn unsubscribe_and_rst_drop() {
        let (mut manager, id) = manager_with_weather();
        let now = Instant::now();

        manager
            .subscribe(id, "sub", MsgToken::from(1u32), None, now)
            .unwrap();
        assert!(manager.unsubscribe(id, "sub", MsgToken::from(1u32)).is_some());
        assert_eq!(manager.subscription_count(), 0);

        manager
            .subscribe(id, "sub", MsgToken::from(2u32), None, now)
            .unwrap();
        assert_eq!(
            manager.drop_subscription("sub", MsgToken::from(2u32)),
            Some(id)
        );
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn media_type_mismatch_is_unsupported() {
        let mut manager: PubSubManager<&'static str> = PubSubManager::new("/ps");
        let mut props = create_props("Typed", "/ps/typed", None);
        props
            .as_map_mut()
            .unwrap()
            .insert("topic-media-type".to_string(), PropValue::Int(60));
        let id = manager.create_topic(&props).unwrap();

        assert_eq!(
            manager.publish(
                id,
                b"{}".to_vec(),
                Some(ContentFormat::APPLICATION_JSON),
                None,
                Instant::now(),
            ),
            Err(MsgCode::ClientErrorUnsupportedMediaType)
        );
    }

    #[test]
    fn observe_sequence_increments_per_publish() {
        let (mut manager, id) = manager_with_weather();
        let now = Instant::now();

        manager
            .subscribe(id, "sub", MsgToken::from(1u32), None, now)
            .unwrap();

        for expected in 1..=3u32 {
            let notifications = manager
                .publish(id, vec![expected as u8], None, None, now)
                .unwrap();
            assert_eq!(notifications[0].seq, ObserveSeq::new(expected));
        }
    }

    #[test]
    fn con_refresh_after_observer_check() {
        let mut manager: PubSubManager<&'static str> = PubSubManager::new("/ps");
        let mut props = create_props("Fast", "/ps/fast", None);
        props
            .as_map_mut()
            .unwrap()
            .insert("observer-check".to_string(), PropValue::Int(30));
        let id = manager.create_topic(&props).unwrap();

        let t0 = Instant::now();
        manager
            .subscribe(id, "sub", MsgToken::from(1u32), None, t0)
            .unwrap();
        manager.publish(id, b"v".to_vec(), None, None, t0).unwrap();

        // Before the interval: nothing due.
        assert!(manager
            .due_con_refresh(t0 + Duration::from_secs(10))
            .is_empty());

        // After the interval: one confirmable refresh.
        let due = manager.due_con_refresh(t0 + Duration::from_secs(31));
        assert_eq!(due.len(), 1);
        assert!(due[0].confirmable);

        // The refresh resets the clock.
        assert!(manager
            .due_con_refresh(t0 + Duration::from_secs(40))
            .is_empty());
    }

    #[test]
    fn fetch_collection_filters_by_properties() {
        let (mut manager, _) = manager_with_weather();
        manager
            .create_topic(&create_props(
                "Humidity",
                "/www/topic/ps/humidity",
                Some("humidity"),
            ))
            .unwrap();

        let mut filter = BTreeMap::new();
        filter.insert("topic-type".to_string(), PropValue::from("temperature"));
        let listing = manager.fetch_collection(&PropValue::Map(filter)).unwrap();

        assert!(listing.contains("/www/topic/ps/conf/1"));
        assert!(!listing.contains("/www/topic/ps/conf/2"));
    }

    #[test]
    fn publish_first_then_subscribe_sees_current() {
        let (mut manager, id) = manager_with_weather();
        let now = Instant::now();

        manager
            .publish(id, b"init".to_vec(), None, None, now)
            .unwrap();

        let (seq, data) = manager
            .subscribe(id, "sub", MsgToken::from(1u32), None, now)
            .unwrap();
        assert_eq!(seq, ObserveSeq::new(1));
        assert_eq!(data.unwrap().payload, b"init");
    }
}
