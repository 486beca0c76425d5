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

//! End-to-end broker/client scenarios over the in-process loopback
//! transport.

use coap_pubsub::message::{
    MessageRead, MessageWrite, MsgCode, MsgToken, MsgType, VecMessageEncoder,
};
use coap_pubsub::option::{OptionInsert, OptionInsertExt, OptionNumber, OBSERVE};
use coap_pubsub::transport::{LoopbackSocket, SecureDatagramSocket, SocketEvent};
use coap_pubsub::{
    Broker, Client, ClientStatus, ContentFormat, PropTree, PropValue,
};
use futures::executor::LocalPool;
use futures::prelude::*;
use futures::task::LocalSpawnExt;
use futures_timer::Delay;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COLLECTION: &str = "/www/topic/ps";
const WEATHER_DATA: &str = "/www/topic/ps/weather";

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        Delay::new(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn setup(
    client_names: &[&'static str],
) -> (LocalPool, Broker<LoopbackSocket>, Vec<Client<LoopbackSocket>>) {
    let broker_socket = LoopbackSocket::new("broker");

    let clients: Vec<Client<LoopbackSocket>> = client_names
        .iter()
        .map(|name| {
            let socket = LoopbackSocket::new(name);
            broker_socket.connect_to(&socket);
            Client::new(&PropTree::new(), socket).expect("client setup")
        })
        .collect();

    let broker = Broker::new(&PropTree::new(), broker_socket).expect("broker setup");

    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    spawner
        .spawn_local(broker.clone().run().map(|_| ()))
        .expect("spawn broker");

    for client in &clients {
        spawner
            .spawn_local(client.clone().run().map(|_| ()))
            .expect("spawn client");
    }

    pool.run_until(async {
        for client in &clients {
            client.connect().await.expect("connect");
        }
    });

    (pool, broker, clients)
}

/// Creates the standard "Weather" topic and waits for completion.
fn create_weather_topic(pool: &mut LocalPool, client: &Client<LoopbackSocket>) {
    let done = Arc::new(AtomicBool::new(false));
    let done_cb = done.clone();

    client
        .create_topic(
            "Weather",
            COLLECTION,
            WEATHER_DATA,
            "temperature",
            ContentFormat::APPLICATION_CBOR,
            move |status, _| {
                assert_eq!(status, ClientStatus::Ok);
                done_cb.store(true, Ordering::SeqCst);
            },
        )
        .expect("create_topic");

    pool.run_until(wait_until("topic creation", || done.load(Ordering::SeqCst)));
}

#[test]
fn s1_discovery_of_collection() {
    let (mut pool, _broker, clients) = setup(&["discoverer"]);
    let client = &clients[0];

    let listing = Arc::new(Mutex::new(None::<String>));
    let listing_cb = listing.clone();

    client
        .get_all_topic_collection(move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let msg = msg.unwrap();
            assert_eq!(msg.msg_code(), MsgCode::SuccessContent);
            assert_eq!(
                msg.content_format(),
                Some(ContentFormat::APPLICATION_LINK_FORMAT)
            );
            *listing_cb.lock().unwrap() = Some(msg.payload_as_str().unwrap().to_string());
        })
        .expect("discovery");

    pool.run_until(wait_until("discovery response", || {
        listing.lock().unwrap().is_some()
    }));

    let listing = listing.lock().unwrap().take().unwrap();
    assert!(listing.contains(r#"</www/topic/ps>"#), "{}", listing);
    assert!(listing.contains(r#"rt="core.ps.coll""#), "{}", listing);
}

#[test]
fn s2_create_topic_returns_location_and_echo() {
    let (mut pool, _broker, clients) = setup(&["creator"]);
    let client = &clients[0];

    let location = Arc::new(Mutex::new(None::<String>));
    let echo = Arc::new(Mutex::new(None::<PropValue>));
    let location_cb = location.clone();
    let echo_cb = echo.clone();

    client
        .create_topic(
            "Weather",
            COLLECTION,
            WEATHER_DATA,
            "temperature",
            ContentFormat(50),
            move |status, msg| {
                assert_eq!(status, ClientStatus::Ok);
                let msg = msg.unwrap();
                assert_eq!(msg.msg_code(), MsgCode::SuccessCreated);
                *location_cb.lock().unwrap() = Some(msg.location_path_string().unwrap());
                *echo_cb.lock().unwrap() = Some(PropValue::from_cbor(msg.payload()).unwrap());
            },
        )
        .expect("create_topic");

    pool.run_until(wait_until("create response", || {
        location.lock().unwrap().is_some()
    }));

    assert_eq!(
        location.lock().unwrap().as_deref(),
        Some("/www/topic/ps/conf/1")
    );

    let echo = echo.lock().unwrap().take().unwrap();
    assert_eq!(
        echo.get("topic-name").and_then(PropValue::as_str),
        Some("Weather")
    );
    assert_eq!(
        echo.get("topic-data").and_then(PropValue::as_str),
        Some(WEATHER_DATA)
    );
    assert_eq!(
        echo.get("topic-media-type").and_then(PropValue::as_u32),
        Some(50)
    );
}

#[test]
fn s3_publish_reaches_matching_subscriber() {
    let (mut pool, _broker, clients) = setup(&["publisher", "subscriber"]);
    let publisher = clients[0].clone();
    let subscriber = clients[1].clone();

    create_weather_topic(&mut pool, &publisher);

    let mut cbor = BTreeMap::new();
    cbor.insert("Title".to_string(), PropValue::from("Weather"));
    cbor.insert("temperature".to_string(), PropValue::Float(71.5));
    let published = PropValue::Map(cbor).to_cbor().unwrap();

    let observations = Arc::new(Mutex::new(Vec::<(Option<u32>, Vec<u8>)>::new()));
    let observations_cb = observations.clone();

    subscriber
        .subscribe(WEATHER_DATA, Some("temperature"), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let msg = msg.unwrap();
            observations_cb
                .lock()
                .unwrap()
                .push((msg.observe(), msg.payload().to_vec()));
        })
        .expect("subscribe");

    pool.run_until(wait_until("registration response", || {
        !observations.lock().unwrap().is_empty()
    }));

    {
        let observations = observations.lock().unwrap();
        assert_eq!(observations[0].0, Some(0));
        assert!(observations[0].1.is_empty());
    }

    publisher
        .publish(
            WEATHER_DATA,
            &published,
            ContentFormat::APPLICATION_CBOR,
            true,
            Some("temperature"),
            |status, _| assert_eq!(status, ClientStatus::Ok),
        )
        .expect("publish");

    pool.run_until(wait_until("notification", || {
        observations.lock().unwrap().len() >= 2
    }));

    let observations = observations.lock().unwrap();
    assert_eq!(observations[1].0, Some(1));
    assert_eq!(observations[1].1, published);

    let decoded = PropValue::from_cbor(&observations[1].1).unwrap();
    assert_eq!(
        decoded.get("temperature").and_then(PropValue::as_f64),
        Some(71.5)
    );
}

#[test]
fn s4_mismatched_topic_type_reaches_nobody() {
    let (mut pool, broker, clients) = setup(&["publisher", "subscriber"]);
    let publisher = clients[0].clone();
    let subscriber = clients[1].clone();

    create_weather_topic(&mut pool, &publisher);

    let notifications = Arc::new(AtomicUsize::new(0));
    let notifications_cb = notifications.clone();

    subscriber
        .subscribe(WEATHER_DATA, Some("temperature"), move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            notifications_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

    pool.run_until(wait_until("registration response", || {
        notifications.load(Ordering::SeqCst) == 1
    }));

    // A publish whose topic-type contradicts the configuration is rejected
    // and must not produce a notification.
    let rejected = Arc::new(AtomicBool::new(false));
    let rejected_cb = rejected.clone();
    publisher
        .publish(
            WEATHER_DATA,
            b"humid",
            ContentFormat::APPLICATION_CBOR,
            true,
            Some("humidity"),
            move |status, _| {
                assert_eq!(status, ClientStatus::Failed);
                rejected_cb.store(true, Ordering::SeqCst);
            },
        )
        .expect("publish");

    pool.run_until(wait_until("rejection", || rejected.load(Ordering::SeqCst)));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    // The subscription is still live: a matching publish gets through.
    publisher
        .publish(
            WEATHER_DATA,
            b"warm",
            ContentFormat::APPLICATION_CBOR,
            true,
            Some("temperature"),
            |status, _| assert_eq!(status, ClientStatus::Ok),
        )
        .expect("publish");

    pool.run_until(wait_until("notification", || {
        notifications.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(broker.subscription_count(), 1);
}

#[test]
fn s5_block_wise_upload_and_notification() {
    let (mut pool, _broker, clients) = setup(&["publisher", "subscriber"]);
    let publisher = clients[0].clone();
    let subscriber = clients[1].clone();

    create_weather_topic(&mut pool, &publisher);

    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let received_cb = received.clone();

    subscriber
        .subscribe(WEATHER_DATA, Some("temperature"), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            received_cb
                .lock()
                .unwrap()
                .push(msg.unwrap().payload().to_vec());
        })
        .expect("subscribe");

    pool.run_until(wait_until("registration response", || {
        !received.lock().unwrap().is_empty()
    }));

    // 70000 bytes: 68 full blocks of 1024 plus a final 608-byte block.
    let payload: Vec<u8> = (0..70000u32).map(|i| (i % 251) as u8).collect();

    let uploaded = Arc::new(AtomicBool::new(false));
    let uploaded_cb = uploaded.clone();
    publisher
        .publish(
            WEATHER_DATA,
            &payload,
            ContentFormat::APPLICATION_CBOR,
            true,
            Some("temperature"),
            move |status, msg| {
                assert_eq!(status, ClientStatus::Ok);
                assert_eq!(msg.unwrap().msg_code(), MsgCode::SuccessChanged);
                uploaded_cb.store(true, Ordering::SeqCst);
            },
        )
        .expect("publish");

    pool.run_until(wait_until("upload completion", || {
        uploaded.load(Ordering::SeqCst)
    }));

    pool.run_until(wait_until("reassembled notification", || {
        received.lock().unwrap().len() >= 2
    }));

    let received = received.lock().unwrap();
    assert_eq!(received[1].len(), payload.len());
    assert_eq!(received[1], payload);
}

#[test]
fn unsubscribe_stops_notifications() {
    let (mut pool, broker, clients) = setup(&["publisher", "subscriber"]);
    let publisher = clients[0].clone();
    let subscriber = clients[1].clone();

    create_weather_topic(&mut pool, &publisher);

    let notifications = Arc::new(AtomicUsize::new(0));
    let notifications_cb = notifications.clone();

    subscriber
        .subscribe(WEATHER_DATA, None, move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            notifications_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

    pool.run_until(wait_until("registration response", || {
        notifications.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(broker.subscription_count(), 1);

    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_cb = cancelled.clone();
    subscriber
        .unsubscribe(WEATHER_DATA, move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            cancelled_cb.store(true, Ordering::SeqCst);
        })
        .expect("unsubscribe");

    pool.run_until(wait_until("cancellation", || cancelled.load(Ordering::SeqCst)));
    assert_eq!(broker.subscription_count(), 0);

    publisher
        .publish(
            WEATHER_DATA,
            b"unheard",
            ContentFormat::APPLICATION_CBOR,
            true,
            None,
            |status, _| assert_eq!(status, ClientStatus::Ok),
        )
        .expect("publish");

    // Give the loop a chance to misbehave before checking.
    pool.run_until(Delay::new(Duration::from_millis(50)));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn get_and_set_topic_configuration() {
    let (mut pool, _broker, clients) = setup(&["admin"]);
    let client = clients[0].clone();

    create_weather_topic(&mut pool, &client);
    let cfg_uri = "/www/topic/ps/conf/1";

    // GET the full document.
    let fetched = Arc::new(Mutex::new(None::<PropValue>));
    let fetched_cb = fetched.clone();
    client
        .get_topic_cfg(cfg_uri, move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            *fetched_cb.lock().unwrap() =
                Some(PropValue::from_cbor(msg.unwrap().payload()).unwrap());
        })
        .expect("get_topic_cfg");
    pool.run_until(wait_until("cfg document", || fetched.lock().unwrap().is_some()));
    assert_eq!(
        fetched
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .get("topic-type")
            .and_then(PropValue::as_str),
        Some("temperature")
    );

    // iPATCH max-subscribers, expecting the merged document back.
    let mut patch = BTreeMap::new();
    patch.insert("max-subscribers".to_string(), PropValue::Int(100));
    let patched = Arc::new(AtomicBool::new(false));
    let patched_cb = patched.clone();
    client
        .set_topic_cfg_by_prop(cfg_uri, &PropValue::Map(patch), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let merged = PropValue::from_cbor(msg.unwrap().payload()).unwrap();
            assert_eq!(
                merged.get("max-subscribers").and_then(PropValue::as_u32),
                Some(100)
            );
            patched_cb.store(true, Ordering::SeqCst);
        })
        .expect("set_topic_cfg_by_prop");
    pool.run_until(wait_until("merge response", || patched.load(Ordering::SeqCst)));

    // FETCH a projection of named properties.
    let mut filter = BTreeMap::new();
    filter.insert(
        "config-filter".to_string(),
        PropValue::Array(vec![
            PropValue::from("topic-data"),
            PropValue::from("max-subscribers"),
        ]),
    );
    let projected = Arc::new(AtomicBool::new(false));
    let projected_cb = projected.clone();
    client
        .get_topic_cfg_by_prop(cfg_uri, &PropValue::Map(filter), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let projection = PropValue::from_cbor(msg.unwrap().payload()).unwrap();
            let map = projection.as_map().unwrap();
            assert_eq!(map.len(), 2);
            assert_eq!(
                map.get("topic-data").and_then(PropValue::as_str),
                Some(WEATHER_DATA)
            );
            projected_cb.store(true, Ordering::SeqCst);
        })
        .expect("get_topic_cfg_by_prop");
    pool.run_until(wait_until("projection", || projected.load(Ordering::SeqCst)));

    // FETCH the collection by property, expecting a link to the config.
    let mut by_prop = BTreeMap::new();
    by_prop.insert("topic-type".to_string(), PropValue::from("temperature"));
    let matched = Arc::new(AtomicBool::new(false));
    let matched_cb = matched.clone();
    client
        .get_all_topic_cfg_by_prop(COLLECTION, &PropValue::Map(by_prop), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let listing = msg.unwrap().payload_as_str().unwrap().to_string();
            assert!(listing.contains("/www/topic/ps/conf/1"), "{}", listing);
            matched_cb.store(true, Ordering::SeqCst);
        })
        .expect("get_all_topic_cfg_by_prop");
    pool.run_until(wait_until("property match", || matched.load(Ordering::SeqCst)));
}

#[test]
fn max_subscribers_rejects_with_service_unavailable() {
    let (mut pool, broker, clients) = setup(&["admin", "first", "second"]);
    let admin = clients[0].clone();
    let first = clients[1].clone();
    let second = clients[2].clone();

    create_weather_topic(&mut pool, &admin);

    let mut patch = BTreeMap::new();
    patch.insert("max-subscribers".to_string(), PropValue::Int(1));
    let patched = Arc::new(AtomicBool::new(false));
    let patched_cb = patched.clone();
    admin
        .set_topic_cfg_by_prop("/www/topic/ps/conf/1", &PropValue::Map(patch), move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            patched_cb.store(true, Ordering::SeqCst);
        })
        .expect("set limit");
    pool.run_until(wait_until("limit set", || patched.load(Ordering::SeqCst)));

    let first_ok = Arc::new(AtomicBool::new(false));
    let first_cb = first_ok.clone();
    first
        .subscribe(WEATHER_DATA, None, move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            first_cb.store(true, Ordering::SeqCst);
        })
        .expect("subscribe");
    pool.run_until(wait_until("first subscription", || first_ok.load(Ordering::SeqCst)));

    let second_rejected = Arc::new(AtomicBool::new(false));
    let second_cb = second_rejected.clone();
    second
        .subscribe(WEATHER_DATA, None, move |status, msg| {
            assert_eq!(status, ClientStatus::Failed);
            let msg = msg.unwrap();
            assert_eq!(msg.msg_code(), MsgCode::ServerErrorServiceUnavailable);
            second_cb.store(true, Ordering::SeqCst);
        })
        .expect("subscribe");
    pool.run_until(wait_until("second rejection", || {
        second_rejected.load(Ordering::SeqCst)
    }));

    assert_eq!(broker.subscription_count(), 1);
}

#[test]
fn session_teardown_clears_subscriptions() {
    let broker_socket = LoopbackSocket::new("broker");
    let raw = LoopbackSocket::new("raw");
    broker_socket.connect_to(&raw);
    let broker_peer = broker_socket.local_peer();

    let broker = Broker::new(&PropTree::new(), broker_socket).expect("broker setup");

    let mut pool = LocalPool::new();
    pool.spawner()
        .spawn_local(broker.clone().run().map(|_| ()))
        .expect("spawn broker");

    // Create a topic and subscribe with hand-rolled messages.
    let mut create = VecMessageEncoder::new();
    create.set_msg_type(MsgType::Con);
    create.set_msg_code(MsgCode::MethodPost);
    create.set_msg_id(0x1001);
    create.set_msg_token(MsgToken::from(0xC0u32));
    for segment in ["www", "topic", "ps"] {
        create
            .insert_option_with_str(OptionNumber::URI_PATH, segment)
            .unwrap();
    }
    create
        .insert_option(
            coap_pubsub::option::CONTENT_FORMAT,
            ContentFormat::APPLICATION_CBOR,
        )
        .unwrap();
    let mut doc = BTreeMap::new();
    doc.insert("topic-name".to_string(), PropValue::from("Weather"));
    doc.insert("topic-data".to_string(), PropValue::from(WEATHER_DATA));
    let doc = PropValue::Map(doc).to_cbor().unwrap();
    create.append_payload_bytes(&doc).unwrap();

    let mut subscribe = VecMessageEncoder::new();
    subscribe.set_msg_type(MsgType::Con);
    subscribe.set_msg_code(MsgCode::MethodGet);
    subscribe.set_msg_id(0x1002);
    subscribe.set_msg_token(MsgToken::from(0xC1u32));
    subscribe.insert_option(OBSERVE, 0u32).unwrap();
    for segment in ["www", "topic", "ps", "weather"] {
        subscribe
            .insert_option_with_str(OptionNumber::URI_PATH, segment)
            .unwrap();
    }

    pool.run_until(async {
        let mut buf = [0u8; 2048];

        raw.send_to(create.as_bytes(), broker_peer).await.unwrap();
        let event = raw.recv_event(&mut buf).await.unwrap();
        assert!(matches!(event, SocketEvent::Datagram { .. }));

        raw.send_to(subscribe.as_bytes(), broker_peer).await.unwrap();
        let event = raw.recv_event(&mut buf).await.unwrap();
        assert!(matches!(event, SocketEvent::Datagram { .. }));
    });

    assert_eq!(broker.subscription_count(), 1);

    // Session teardown removes every subscription held by the peer.
    raw.close_session();
    pool.run_until(wait_until("teardown", || broker.subscription_count() == 0));
}
