// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Unit tests for TSIG verification against the in-memory backend.

#[cfg(test)]
mod tests {
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{Backend, DynBackend};
    use crate::dns::tsig::{tsig_of, TsigProvider};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
    use hickory_proto::rr::dnssec::tsig::TSigner;
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio_util::sync::CancellationToken;

    fn now() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or_default()
    }

    async fn backend_with_key(secret: &str) -> DynBackend {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        backend.create_zone(&cancel, "example.com").await.unwrap();
        backend.create_key(&cancel, "test", secret).await.unwrap();
        backend.bind_key(&cancel, "test", "example.com").await.unwrap();
        Arc::new(backend)
    }

    fn update_message() -> Message {
        let name = Name::from_ascii("_acme-challenge.example.com.").expect("valid name");
        let mut message = Message::new();
        message.set_id(4321);
        message.set_op_code(OpCode::Update);
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(name.clone(), RecordType::SOA));
        message.add_name_server(Record::from_rdata(
            name,
            3600,
            RData::TXT(TXT::new(vec!["challenge".to_string()])),
        ));
        message
    }

    fn signed_bytes(secret_b64: &str, algorithm: TsigAlgorithm, key_name: &str) -> Vec<u8> {
        let secret = BASE64.decode(secret_b64).expect("valid base64");
        let signer = TSigner::new(
            secret,
            algorithm,
            Name::from_ascii(key_name).expect("valid key name"),
            300,
        )
        .expect("create signer");
        let mut message = update_message();
        message.finalize(&signer, now()).expect("sign message");
        message.to_vec().expect("encode message")
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_sha256_signature() {
        let secret = BASE64.encode(b"a-reasonably-long-shared-secret!");
        let backend = backend_with_key(&secret).await;
        let provider = TsigProvider::new(backend);
        let cancel = CancellationToken::new();

        let bytes = signed_bytes(&secret, TsigAlgorithm::HmacSha256, "test.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        let verified = provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect("signature must verify");
        assert_eq!(verified.key_name, "test");
        assert_eq!(verified.zones, vec!["example.com".to_string()]);
        assert!(!verified.request_mac.is_empty());
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_sha512_signature() {
        let secret = BASE64.encode(b"another-reasonably-long-secret!!");
        let backend = backend_with_key(&secret).await;
        let provider = TsigProvider::new(backend);
        let cancel = CancellationToken::new();

        let bytes = signed_bytes(&secret, TsigAlgorithm::HmacSha512, "test.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect("signature must verify");
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_secret() {
        let stored = BASE64.encode(b"the-secret-the-server-knows-----");
        let used = BASE64.encode(b"the-secret-the-client-guessed---");
        let backend = backend_with_key(&stored).await;
        let provider = TsigProvider::new(backend);
        let cancel = CancellationToken::new();

        let bytes = signed_bytes(&used, TsigAlgorithm::HmacSha256, "test.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        let err = provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect_err("wrong secret must fail");
        assert_eq!(err.code(), "TSIG_BAD_SIGNATURE");
    }

    #[tokio::test]
    async fn test_verify_rejects_unsupported_algorithm() {
        let secret = BASE64.encode(b"a-reasonably-long-shared-secret!");
        let backend = backend_with_key(&secret).await;
        let provider = TsigProvider::new(backend);
        let cancel = CancellationToken::new();

        let bytes = signed_bytes(&secret, TsigAlgorithm::HmacSha384, "test.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        let err = provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect_err("unsupported algorithm must fail");
        assert_eq!(err.code(), "UNSUPPORTED_TSIG_ALGORITHM");
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_key() {
        let secret = BASE64.encode(b"a-reasonably-long-shared-secret!");
        let backend = backend_with_key(&secret).await;
        let provider = TsigProvider::new(backend);
        let cancel = CancellationToken::new();

        let bytes = signed_bytes(&secret, TsigAlgorithm::HmacSha256, "stranger.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        let err = provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect_err("unknown key must fail");
        assert_eq!(err.code(), "KEY_NOT_IN_BACKEND");
    }

    #[tokio::test]
    async fn test_verify_rejects_undecodable_stored_secret() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        backend.create_zone(&cancel, "example.com").await.unwrap();
        backend
            .create_key(&cancel, "test", "!!! not base64 !!!")
            .await
            .unwrap();
        let provider = TsigProvider::new(Arc::new(backend));

        let secret = BASE64.encode(b"a-reasonably-long-shared-secret!");
        let bytes = signed_bytes(&secret, TsigAlgorithm::HmacSha256, "test.");
        let parsed = Message::from_vec(&bytes).expect("parse message");
        let (record, rdata) = tsig_of(&parsed).expect("message carries TSIG");

        let err = provider
            .verify(&cancel, &bytes, record, rdata)
            .await
            .expect_err("undecodable secret must fail");
        assert_eq!(err.code(), "INVALID_TSIG_KEY");
    }

    #[test]
    fn test_unsigned_message_has_no_tsig() {
        let message = update_message();
        assert!(tsig_of(&message).is_none());
    }
}
