// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! The request handler: admission filter, opcode dispatch, and the query
//! and update state machines.
//!
//! Both listeners feed raw datagrams into [`Engine::handle`]; whatever
//! comes back (if anything) is written to the client unchanged. The engine
//! owns no sockets, which keeps the whole protocol surface testable without
//! the network.

use crate::backend::DynBackend;
use crate::constants::{
    ACME_CHALLENGE_PREFIX, INFRA_TTL, SOA_EXPIRE, SOA_MINIMUM, SOA_REFRESH, SOA_RETRY,
    TXT_CHUNK_LEN, TXT_TTL,
};
use crate::dns::tsig::{tsig_of, TsigProvider, VerifiedRequest};
use crate::errors::ConfigError;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared request handler behind both listeners. Handlers run concurrently
/// on the runtime; all state here is read-only or owned by the backend.
pub(crate) struct Engine {
    backend: DynBackend,
    tsig: TsigProvider,
    cancel: CancellationToken,
    nameservers: Vec<Name>,
    soa_mname: Name,
    soa_rname: Name,
}

impl Engine {
    pub(crate) fn new(
        nameservers: &[String],
        backend: DynBackend,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let mut parsed = Vec::with_capacity(nameservers.len());
        for (index, ns) in nameservers.iter().enumerate() {
            parsed.push(fqdn(ns).map_err(|()| ConfigError::InvalidNameserver {
                name: ns.clone(),
                index,
            })?);
        }
        let first = nameservers
            .first()
            .ok_or(ConfigError::MissingNameservers)?;
        let first = first.trim_end_matches('.');
        let soa_mname = fqdn(first).map_err(|()| ConfigError::InvalidNameserver {
            name: first.to_string(),
            index: 0,
        })?;
        let soa_rname = fqdn(&format!("nomail.{first}")).map_err(|()| {
            ConfigError::InvalidNameserver {
                name: first.to_string(),
                index: 0,
            }
        })?;
        let tsig = TsigProvider::new(backend.clone());
        Ok(Self {
            backend,
            tsig,
            cancel,
            nameservers: parsed,
            soa_mname,
            soa_rname,
        })
    }

    /// Handle one raw message. Returns the encoded response, or `None` when
    /// the message is dropped by the admission filter.
    pub(crate) async fn handle(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let message = match Message::from_vec(bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "dropping unparseable message");
                return None;
            }
        };

        // Messages with answer-side flags set are scans or amplification
        // probes, not queries. They get no response at all.
        if message.message_type() == MessageType::Response
            || message.authoritative()
            || message.recursion_available()
        {
            debug!(id = message.id(), "dropping message with response flags set");
            return None;
        }

        let response = match message.op_code() {
            OpCode::Query => self.serve_query(&message).await,
            OpCode::Update => self.serve_update(&message, bytes).await,
            OpCode::Notify => self.reply(&message, ResponseCode::NotImp),
            opcode => {
                debug!(?opcode, id = message.id(), "dropping message with unsupported opcode");
                return None;
            }
        };

        match response.to_vec() {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                warn!(error = %err, id = message.id(), "cannot encode response");
                None
            }
        }
    }

    async fn serve_query(&self, msg: &Message) -> Message {
        let echo = tsig_of(msg).map(|(record, _)| record.clone());
        let seal = |mut response: Message| {
            if let Some(record) = echo.clone() {
                response.add_additional(record);
            }
            response
        };

        if msg.queries().len() != 1 {
            return seal(self.reply(msg, ResponseCode::FormErr));
        }
        let question = &msg.queries()[0];

        let Some(zone_name) = challenge_zone(question.name()) else {
            debug!(name = %question.name(), "query name outside the ACME challenge subtree");
            return seal(self.reply(msg, ResponseCode::Refused));
        };
        let zone = match self.backend.get_zone(&self.cancel, &zone_name).await {
            Ok(zone) => zone,
            Err(err) if err.is_not_found() => {
                debug!(zone = %zone_name, "query for unknown zone");
                return seal(self.reply(msg, ResponseCode::Refused));
            }
            Err(err) => {
                warn!(zone = %zone_name, error = %err, "zone lookup failed");
                return seal(self.reply(msg, ResponseCode::ServFail));
            }
        };

        let mut response = self.reply(msg, ResponseCode::NoError);
        response.set_authoritative(true);
        match question.query_type() {
            RecordType::TXT => {
                for answer in &zone.acme_answers {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        TXT_TTL,
                        RData::TXT(TXT::new(chunk_answer(answer))),
                    ));
                }
            }
            RecordType::SOA => {
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    INFRA_TTL,
                    RData::SOA(SOA::new(
                        self.soa_mname.clone(),
                        self.soa_rname.clone(),
                        zone.serial,
                        SOA_REFRESH,
                        SOA_RETRY,
                        SOA_EXPIRE,
                        SOA_MINIMUM,
                    )),
                ));
            }
            RecordType::NS => {
                for ns in &self.nameservers {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        INFRA_TTL,
                        RData::NS(NS(ns.clone())),
                    ));
                }
            }
            _ => {}
        }
        if zone.debug {
            info!(
                zone = %zone_name,
                qtype = ?question.query_type(),
                serial = zone.serial,
                answers = response.answers().len(),
                "answering query"
            );
        }
        seal(response)
    }

    async fn serve_update(&self, msg: &Message, bytes: &[u8]) -> Message {
        if msg.queries().len() != 1 {
            let mut response = self.reply(msg, ResponseCode::FormErr);
            if let Some((record, _)) = tsig_of(msg) {
                response.add_additional(record.clone());
            }
            return response;
        }

        let Some((tsig_record, tsig_rdata)) = tsig_of(msg) else {
            debug!(id = msg.id(), "rejecting unsigned update");
            return self.reply(msg, ResponseCode::NotAuth);
        };

        let verified = match self
            .tsig
            .verify(&self.cancel, bytes, tsig_record, tsig_rdata)
            .await
        {
            Ok(verified) => verified,
            Err(err) => {
                debug!(id = msg.id(), error = %err, "update signature did not verify");
                let mut response = self.reply(msg, ResponseCode::NotAuth);
                response.add_additional(tsig_record.clone());
                return response;
            }
        };

        let question = &msg.queries()[0];
        let Some(zone_name) = challenge_zone(question.name()) else {
            debug!(name = %question.name(), "update name outside the ACME challenge subtree");
            return self.respond_signed(msg, ResponseCode::NotAuth, &verified);
        };
        let zone = match self.backend.get_zone(&self.cancel, &zone_name).await {
            Ok(zone) => zone,
            Err(err) => {
                debug!(zone = %zone_name, error = %err, "update for unavailable zone");
                return self.respond_signed(msg, ResponseCode::NotAuth, &verified);
            }
        };

        if !verified.zones.iter().any(|bound| bound == &zone_name) {
            info!(
                zone = %zone_name,
                key = %verified.key_name,
                "rejecting update signed by a key not bound to the zone"
            );
            return self.respond_signed(msg, ResponseCode::NotAuth, &verified);
        }

        let mut pending = zone.acme_answers.clone();
        for record in msg.name_servers() {
            if record.name() != question.name() {
                debug!(
                    zone = %zone_name,
                    name = %record.name(),
                    "rejecting update record whose name differs from the zone"
                );
                return self.respond_signed(msg, ResponseCode::NotAuth, &verified);
            }
            if record.record_type() != RecordType::TXT {
                debug!(
                    zone = %zone_name,
                    rtype = ?record.record_type(),
                    "rejecting non-TXT update record"
                );
                return self.respond_signed(msg, ResponseCode::Refused, &verified);
            }
            match record.data() {
                Some(RData::TXT(txt)) if !txt.txt_data().is_empty() => {
                    let mut answer = String::new();
                    for part in txt.txt_data() {
                        answer.push_str(&String::from_utf8_lossy(part));
                    }
                    pending.push(answer);
                }
                // An empty TXT resets the pending answers; later records
                // append to the fresh set.
                _ => pending.clear(),
            }
        }

        if zone.debug {
            info!(
                zone = %zone_name,
                key = %verified.key_name,
                records = msg.name_servers().len(),
                pending = pending.len(),
                "applying authorized update"
            );
        }

        if let Err(err) = self.backend.set_zone(&self.cancel, &zone_name, pending).await {
            warn!(zone = %zone_name, error = %err, "backend rejected zone update");
            return self.respond_signed(msg, ResponseCode::ServFail, &verified);
        }
        self.respond_signed(msg, ResponseCode::NoError, &verified)
    }

    /// Base response: same id and opcode, question echoed.
    fn reply(&self, msg: &Message, rcode: ResponseCode) -> Message {
        let mut response = Message::new();
        response.set_id(msg.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(msg.op_code());
        response.set_recursion_desired(msg.recursion_desired());
        response.set_response_code(rcode);
        for query in msg.queries() {
            response.add_query(query.clone());
        }
        response
    }

    /// Build a response and append a freshly computed TSIG over it. Nothing
    /// may be added to the response afterwards.
    fn respond_signed(
        &self,
        msg: &Message,
        rcode: ResponseCode,
        verified: &VerifiedRequest,
    ) -> Message {
        let mut response = self.reply(msg, rcode);
        match self.tsig.sign_response(&response, verified) {
            Ok(record) => {
                response.add_additional(record);
            }
            Err(err) => {
                debug!(key = %verified.key_name, error = %err, "cannot sign response");
            }
        }
        response
    }
}

/// Derive the backend zone name from a query name: strip the trailing dot
/// and the required `_acme-challenge.` label. Names without the label are
/// outside this responder's authority.
fn challenge_zone(name: &Name) -> Option<String> {
    let ascii = name.to_ascii().to_lowercase();
    let trimmed = ascii.strip_suffix('.').unwrap_or(&ascii);
    trimmed.strip_prefix(ACME_CHALLENGE_PREFIX).map(str::to_owned)
}

/// Split one stored answer into wire-sized TXT character-strings.
fn chunk_answer(answer: &str) -> Vec<String> {
    answer
        .as_bytes()
        .chunks(TXT_CHUNK_LEN)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

fn fqdn(name: &str) -> Result<Name, ()> {
    Name::from_ascii(format!("{}.", name.trim_end_matches('.'))).map_err(|_| ())
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod handler_tests;
