// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! TSIG verification and response signing.
//!
//! Update keys are resolved through the backend on every request; the key
//! label in the TSIG record, minus its trailing dot, is the backend key
//! name. Only `hmac-sha256.` and `hmac-sha512.` are accepted. Secrets are
//! stored base64-encoded and decoded at use.

use crate::backend::DynBackend;
use crate::errors::{Error, TsigError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::rr::dnssec::rdata::tsig::{
    make_tsig_record, message_tbs, signed_bitmessage_to_buf, TsigAlgorithm, TSIG,
};
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of a successful TSIG verification, carrying everything needed to
/// authorize the update and to sign the response.
#[derive(Debug)]
pub(crate) struct VerifiedRequest {
    /// Backend key name: the record's owner name, lowercased, without the
    /// trailing dot.
    pub key_name: String,
    /// The record's owner name as it appeared on the wire.
    pub signer: Name,
    /// Declared and accepted algorithm.
    pub algorithm: TsigAlgorithm,
    /// Decoded HMAC secret.
    pub secret: Vec<u8>,
    /// MAC of the request, chained into the response MAC.
    pub request_mac: Vec<u8>,
    /// Fudge window from the request, reused for the response.
    pub fudge: u16,
    /// The zones the signing key is bound to.
    pub zones: Vec<String>,
}

/// Verifies request signatures and generates response signatures, keyed by
/// the backend's update keys.
pub(crate) struct TsigProvider {
    backend: DynBackend,
}

impl TsigProvider {
    pub(crate) fn new(backend: DynBackend) -> Self {
        Self { backend }
    }

    /// Verify the TSIG on a raw message.
    ///
    /// `message` is the datagram exactly as received; the to-be-verified
    /// buffer (message minus TSIG record, plus the TSIG variables) is
    /// derived from it. The MAC comparison is constant time. The signature
    /// timestamp must cover the current time within its fudge window.
    pub(crate) async fn verify(
        &self,
        cancel: &CancellationToken,
        message: &[u8],
        record: &Record,
        rdata: &TSIG,
    ) -> Result<VerifiedRequest, Error> {
        let key_name = key_label(record.name());
        let algorithm = rdata.algorithm().clone();
        if !matches!(
            algorithm,
            TsigAlgorithm::HmacSha256 | TsigAlgorithm::HmacSha512
        ) {
            return Err(TsigError::UnsupportedAlgorithm {
                algorithm: format!("{algorithm:?}"),
            }
            .into());
        }

        let key = self.backend.get_key(cancel, &key_name).await.map_err(|err| {
            debug!(key = %key_name, error = %err, "error getting update key");
            TsigError::from(err)
        })?;
        let secret = BASE64
            .decode(key.secret.as_bytes())
            .map_err(|err| TsigError::InvalidKey {
                key: key_name.clone(),
                reason: err.to_string(),
            })?;

        let (to_verify, _tsig_record) =
            signed_bitmessage_to_buf(None, message, true).map_err(|_| TsigError::BadSignature {
                key: key_name.clone(),
            })?;
        algorithm
            .verify_mac(&secret, &to_verify, rdata.mac())
            .map_err(|_| TsigError::BadSignature {
                key: key_name.clone(),
            })?;

        let now = unix_now();
        let fudge = u64::from(rdata.fudge());
        if now < rdata.time().saturating_sub(fudge) || now > rdata.time() + fudge {
            return Err(TsigError::BadTime {
                key: key_name.clone(),
            }
            .into());
        }

        Ok(VerifiedRequest {
            key_name,
            signer: record.name().clone(),
            algorithm,
            secret,
            request_mac: rdata.mac().to_vec(),
            fudge: rdata.fudge(),
            zones: key.zones,
        })
    }

    /// Sign a response to a verified request.
    ///
    /// The MAC covers the request MAC, the response message without the
    /// TSIG record, and the TSIG variables, per RFC 2845. The returned
    /// record goes last into the response's additionals.
    pub(crate) fn sign_response(
        &self,
        response: &Message,
        verified: &VerifiedRequest,
    ) -> Result<Record, TsigError> {
        let now = unix_now();
        let pre_tsig = TSIG::new(
            verified.algorithm.clone(),
            now,
            verified.fudge,
            Vec::new(),
            response.id(),
            0,
            Vec::new(),
        );
        let to_sign = message_tbs(
            Some(&verified.request_mac),
            response,
            &pre_tsig,
            &verified.signer,
        )
        .map_err(|err| TsigError::InvalidKey {
            key: verified.key_name.clone(),
            reason: err.to_string(),
        })?;
        let mac = verified
            .algorithm
            .mac_data(&verified.secret, &to_sign)
            .map_err(|err| TsigError::InvalidKey {
                key: verified.key_name.clone(),
                reason: err.to_string(),
            })?;

        let rdata = TSIG::new(
            verified.algorithm.clone(),
            now,
            verified.fudge,
            mac,
            response.id(),
            0,
            Vec::new(),
        );
        Ok(make_tsig_record(verified.signer.clone(), rdata))
    }
}

/// The TSIG record of a message, if it carries one. Per RFC 2845 the TSIG
/// record is the last record of the additionals section.
pub(crate) fn tsig_of(message: &Message) -> Option<(&Record, &TSIG)> {
    let record = message.additionals().last()?;
    if record.record_type() != RecordType::TSIG {
        return None;
    }
    match record.data() {
        Some(RData::DNSSEC(DNSSECRData::TSIG(rdata))) => Some((record, rdata)),
        _ => None,
    }
}

fn key_label(name: &Name) -> String {
    let label = name.to_ascii().to_lowercase();
    label.trim_end_matches('.').to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "tsig_tests.rs"]
mod tsig_tests;
