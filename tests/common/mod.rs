// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Shared helpers for the end-to-end tests: a server harness around the
//! in-memory backend and small DNS exchange clients for both transports.

#![allow(dead_code)]

use acmedns::backend::{self, DynBackend};
use acmedns::config::Config;
use acmedns::dns::{RunningServer, Server};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

pub const ZONE: &str = "example.com";
pub const CHALLENGE_NAME: &str = "_acme-challenge.example.com.";

/// A running responder plus everything a test needs to talk to it.
pub struct Harness {
    pub addr: SocketAddr,
    pub backend: DynBackend,
    pub server: RunningServer,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Stop the server. Call at the end of every test.
    pub async fn shutdown(self) {
        self.server.stop().await.expect("server must stop cleanly");
        self.cancel.cancel();
    }
}

/// Generate a fresh base64 secret, the same shape real deployments use.
pub fn random_secret() -> String {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill(&mut secret);
    BASE64.encode(secret)
}

/// Start a responder on a free localhost port with the given seed applied
/// to the in-memory backend.
pub async fn start_server(seed: impl Fn(&mut Config)) -> Harness {
    let mut config = Config::default();
    config.nameservers = vec!["ns.example.com".to_string()];
    config.backend = Some("memory".to_string());
    seed(&mut config);

    let cancel = CancellationToken::new();
    for _attempt in 0..10 {
        let port = rand::thread_rng().gen_range(20_000..60_000);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("valid address");
        let mut attempt_config = config.clone();
        attempt_config.listen = addr;

        let backend = backend::build(&attempt_config)
            .await
            .expect("memory backend must build");
        let server = Server::new(&attempt_config, backend.clone()).expect("server must build");
        match server.start(&cancel).await {
            Ok(running) => {
                return Harness {
                    addr,
                    backend,
                    server: running,
                    cancel,
                };
            }
            Err(_) => continue,
        }
    }
    panic!("could not find a free port for the test server");
}

/// Build a query for the challenge name.
pub fn query(qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(rand::thread_rng().gen());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.add_query(Query::query(
        Name::from_ascii(CHALLENGE_NAME).expect("valid name"),
        qtype,
    ));
    message
}

/// Build an update adding the given TXT values for the challenge name. An
/// empty value list produces the "clear all answers" record form.
pub fn update(txt_values: &[&str]) -> Message {
    let name = Name::from_ascii(CHALLENGE_NAME).expect("valid name");
    let mut message = Message::new();
    message.set_id(rand::thread_rng().gen());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Update);
    message.add_query(Query::query(name.clone(), RecordType::SOA));
    message.add_name_server(Record::from_rdata(
        name,
        3600,
        RData::TXT(TXT::new(
            txt_values.iter().map(|value| (*value).to_string()).collect(),
        )),
    ));
    message
}

/// TSIG-sign a message with the given key name (with trailing dot) and
/// base64 secret.
pub fn sign(message: &mut Message, key_name: &str, secret_b64: &str) {
    let secret = BASE64.decode(secret_b64).expect("valid base64 secret");
    let signer = TSigner::new(
        secret,
        TsigAlgorithm::HmacSha256,
        Name::from_ascii(key_name).expect("valid key name"),
        300,
    )
    .expect("create signer");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default();
    message.finalize(&signer, now).expect("sign message");
}

/// Exchange a message over UDP.
pub async fn udp_exchange(addr: SocketAddr, message: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client socket");
    socket
        .send_to(&message.to_vec().expect("encode request"), addr)
        .await
        .expect("send request");
    let mut buf = vec![0u8; 65_535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("response within deadline")
        .expect("receive response");
    Message::from_vec(&buf[..len]).expect("parse response")
}

/// Exchange a message over TCP with 2-byte length framing.
pub async fn tcp_exchange(addr: SocketAddr, message: &Message) -> Message {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let encoded = message.to_vec().expect("encode request");
    let len = u16::try_from(encoded.len()).expect("request fits a TCP frame");
    stream
        .write_all(&len.to_be_bytes())
        .await
        .expect("write length");
    stream.write_all(&encoded).await.expect("write request");
    stream.flush().await.expect("flush request");

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf))
        .await
        .expect("response within deadline")
        .expect("read length");
    let mut response = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream.read_exact(&mut response).await.expect("read response");
    Message::from_vec(&response).expect("parse response")
}
