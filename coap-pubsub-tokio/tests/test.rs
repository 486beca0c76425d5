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

use coap_pubsub::message::MessageRead;
use coap_pubsub::{Broker, Client, ClientStatus, ContentFormat, PropTree};
use coap_pubsub_tokio::TokioUdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn wait_for(flag: &AtomicBool) {
    for _ in 0..500 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for completion");
}

#[tokio::test]
async fn ping_over_udp() {
    let broker_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker_socket.local_addr().unwrap();
    let broker = Broker::new(&PropTree::new(), broker_socket).unwrap();
    tokio::spawn(broker.run());

    let client_socket = TokioUdpSocket::connect(broker_addr).await.unwrap();
    let client = Client::new(&PropTree::new(), client_socket).unwrap();
    client.connect().await.unwrap();
    tokio::spawn(client.clone().run());

    let ponged = Arc::new(AtomicBool::new(false));
    let ponged_cb = ponged.clone();
    client
        .ping(move |status, _| {
            assert_eq!(status, ClientStatus::Ok);
            ponged_cb.store(true, Ordering::SeqCst);
        })
        .unwrap();

    wait_for(&ponged).await;
    client.disconnect();
}

#[tokio::test]
async fn publish_subscribe_over_udp() {
    let broker_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker_socket.local_addr().unwrap();
    let broker = Broker::new(&PropTree::new(), broker_socket).unwrap();
    tokio::spawn(broker.run());

    let subscriber_socket = TokioUdpSocket::connect(broker_addr).await.unwrap();
    let subscriber = Client::new(&PropTree::new(), subscriber_socket).unwrap();
    subscriber.connect().await.unwrap();
    tokio::spawn(subscriber.clone().run());

    let publisher_socket = TokioUdpSocket::connect(broker_addr).await.unwrap();
    let publisher = Client::new(&PropTree::new(), publisher_socket).unwrap();
    publisher.connect().await.unwrap();
    tokio::spawn(publisher.clone().run());

    // Create the topic.
    let created = Arc::new(AtomicBool::new(false));
    let created_cb = created.clone();
    publisher
        .create_topic(
            "Weather",
            "/www/topic/ps",
            "/www/topic/ps/weather",
            "temperature",
            ContentFormat::TEXT_PLAIN_UTF8,
            move |status, _| {
                assert_eq!(status, ClientStatus::Ok);
                created_cb.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    wait_for(&created).await;

    // Subscribe, then publish; the notification must arrive.
    let subscribed = Arc::new(AtomicBool::new(false));
    let notified = Arc::new(AtomicBool::new(false));
    let subscribed_cb = subscribed.clone();
    let notified_cb = notified.clone();
    subscriber
        .subscribe("/www/topic/ps/weather", Some("temperature"), move |status, msg| {
            assert_eq!(status, ClientStatus::Ok);
            let msg = msg.unwrap();
            if !subscribed_cb.load(Ordering::SeqCst) {
                subscribed_cb.store(true, Ordering::SeqCst);
            } else {
                assert_eq!(msg.payload(), b"71.5");
                notified_cb.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
    wait_for(&subscribed).await;

    let published = Arc::new(AtomicBool::new(false));
    let published_cb = published.clone();
    publisher
        .publish(
            "/www/topic/ps/weather",
            b"71.5",
            ContentFormat::TEXT_PLAIN_UTF8,
            true,
            Some("temperature"),
            move |status, _| {
                assert_eq!(status, ClientStatus::Ok);
                published_cb.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();

    wait_for(&published).await;
    wait_for(&notified).await;

    subscriber.disconnect();
    publisher.disconnect();
}
