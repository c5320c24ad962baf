// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! End-to-end tests against a running responder: real sockets, the
//! in-memory backend, and TSIG-signed updates.

mod common;

use acmedns::config::{MemoryKeySeed, MemoryZoneSeed};
use common::{
    query, random_secret, sign, start_server, tcp_exchange, udp_exchange, update, CHALLENGE_NAME,
    ZONE,
};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{RData, RecordType};
use tokio_util::sync::CancellationToken;

/// Seed one zone plus a bound key `test` and an unbound key `notauth`,
/// both with their own secrets.
fn seeded(update_secret: &str, notauth_secret: &str) -> impl Fn(&mut acmedns::config::Config) {
    let update_secret = update_secret.to_string();
    let notauth_secret = notauth_secret.to_string();
    move |config| {
        config.memory.zones.insert(
            ZONE.to_string(),
            MemoryZoneSeed {
                serial: 0,
                acme_challenge_answers: Vec::new(),
                debug: true,
            },
        );
        config.memory.keys.insert(
            "test".to_string(),
            MemoryKeySeed {
                secret: update_secret.clone(),
                zones: vec![ZONE.to_string()],
            },
        );
        config.memory.keys.insert(
            "notauth".to_string(),
            MemoryKeySeed {
                secret: notauth_secret.clone(),
                zones: Vec::new(),
            },
        );
    }
}

async fn zone_serial(backend: &acmedns::backend::DynBackend) -> u32 {
    use acmedns::backend::Backend as _;
    let cancel = CancellationToken::new();
    backend
        .get_zone(&cancel, ZONE)
        .await
        .expect("zone must exist")
        .serial
}

#[tokio::test]
async fn test_full_challenge_flow() {
    let update_secret = random_secret();
    let invalid_secret = random_secret();
    let harness = start_server(seeded(&update_secret, &update_secret)).await;

    // SOA query on the empty zone reports serial 0.
    let response = udp_exchange(harness.addr, &query(RecordType::SOA)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    let Some(RData::SOA(soa)) = response.answers()[0].data() else {
        panic!("expected SOA rdata");
    };
    assert_eq!(soa.serial(), 0);
    assert_eq!(soa.mname().to_ascii(), "ns.example.com.");
    assert_eq!(soa.rname().to_ascii(), "nomail.ns.example.com.");
    assert_eq!(response.answers()[0].ttl(), 86_400);

    // TXT query on the empty zone has no answers.
    let response = udp_exchange(harness.addr, &query(RecordType::TXT)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());

    // Unsigned update is rejected and changes nothing.
    let response = udp_exchange(harness.addr, &update(&["test"])).await;
    assert_eq!(response.response_code(), ResponseCode::NotAuth);
    assert_eq!(zone_serial(&harness.backend).await, 0);

    // Update signed with a wrong secret is rejected.
    let mut message = update(&["test"]);
    sign(&mut message, "test.", &invalid_secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NotAuth);
    assert_eq!(zone_serial(&harness.backend).await, 0);

    // Update signed with a valid but unbound key is rejected.
    let mut message = update(&["notauth"]);
    sign(&mut message, "notauth.", &update_secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NotAuth);
    assert_eq!(zone_serial(&harness.backend).await, 0);

    // Properly signed and authorized update is accepted.
    let mut message = update(&["test"]);
    sign(&mut message, "test.", &update_secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(
        response.additionals().last().map(|record| record.record_type()),
        Some(RecordType::TSIG)
    );

    // The SOA serial moved to 1.
    let response = udp_exchange(harness.addr, &query(RecordType::SOA)).await;
    let Some(RData::SOA(soa)) = response.answers()[0].data() else {
        panic!("expected SOA rdata");
    };
    assert_eq!(soa.serial(), 1);

    // The TXT answer is served with TTL 60.
    let response = udp_exchange(harness.addr, &query(RecordType::TXT)).await;
    assert_eq!(response.answers().len(), 1);
    let record = &response.answers()[0];
    assert_eq!(record.name().to_ascii(), CHALLENGE_NAME);
    assert_eq!(record.ttl(), 60);
    let Some(RData::TXT(txt)) = record.data() else {
        panic!("expected TXT rdata");
    };
    assert_eq!(txt.txt_data().len(), 1);
    assert_eq!(txt.txt_data()[0].as_ref(), b"test");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_tcp_transport_serves_queries_and_updates() {
    let secret = random_secret();
    let harness = start_server(seeded(&secret, &secret)).await;

    let response = tcp_exchange(harness.addr, &query(RecordType::SOA)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);

    let mut message = update(&["over-tcp"]);
    sign(&mut message, "test.", &secret);
    let response = tcp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);

    let response = tcp_exchange(harness.addr, &query(RecordType::TXT)).await;
    assert_eq!(response.answers().len(), 1);
    let Some(RData::TXT(txt)) = response.answers()[0].data() else {
        panic!("expected TXT rdata");
    };
    assert_eq!(txt.txt_data()[0].as_ref(), b"over-tcp");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_update_rewrites_answers_with_empty_txt() {
    let secret = random_secret();
    let harness = start_server(seeded(&secret, &secret)).await;

    let mut message = update(&["first"]);
    sign(&mut message, "test.", &secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);

    // An empty TXT record clears the set before the new value lands.
    let name = hickory_proto::rr::Name::from_ascii(CHALLENGE_NAME).expect("valid name");
    let mut message = update(&[]);
    message.add_name_server(hickory_proto::rr::Record::from_rdata(
        name,
        3600,
        RData::TXT(hickory_proto::rr::rdata::TXT::new(vec![
            "replacement".to_string()
        ])),
    ));
    sign(&mut message, "test.", &secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);

    let response = udp_exchange(harness.addr, &query(RecordType::TXT)).await;
    assert_eq!(response.answers().len(), 1);
    let Some(RData::TXT(txt)) = response.answers()[0].data() else {
        panic!("expected TXT rdata");
    };
    assert_eq!(txt.txt_data()[0].as_ref(), b"replacement");
    assert_eq!(zone_serial(&harness.backend).await, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_queries_for_foreign_names_are_refused() {
    let secret = random_secret();
    let harness = start_server(seeded(&secret, &secret)).await;

    let mut message = hickory_proto::op::Message::new();
    message.set_id(99);
    message.set_op_code(hickory_proto::op::OpCode::Query);
    message.add_query(hickory_proto::op::Query::query(
        hickory_proto::rr::Name::from_ascii("www.example.com.").expect("valid name"),
        RecordType::TXT,
    ));
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::Refused);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_management_flow_binds_and_unbinds_keys() {
    use acmedns::backend::Backend as _;

    let secret = random_secret();
    let harness = start_server(seeded(&secret, &secret)).await;
    let cancel = CancellationToken::new();
    let backend = &harness.backend;

    // Create a fresh key, bind it, and use it for an update.
    let fresh_secret = random_secret();
    backend
        .create_key(&cancel, "fresh", &fresh_secret)
        .await
        .expect("create key");
    backend
        .bind_key(&cancel, "fresh", ZONE)
        .await
        .expect("bind key");

    let mut message = update(&["from-fresh-key"]);
    sign(&mut message, "fresh.", &fresh_secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);

    // After unbinding, the same key is rejected again.
    backend
        .unbind_key(&cancel, "fresh", ZONE)
        .await
        .expect("unbind key");
    let mut message = update(&["from-fresh-key"]);
    sign(&mut message, "fresh.", &fresh_secret);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NotAuth);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_notify_is_answered_with_notimp() {
    let secret = random_secret();
    let harness = start_server(seeded(&secret, &secret)).await;

    let mut message = query(RecordType::SOA);
    message.set_op_code(hickory_proto::op::OpCode::Notify);
    let response = udp_exchange(harness.addr, &message).await;
    assert_eq!(response.response_code(), ResponseCode::NotImp);

    harness.shutdown().await;
}
