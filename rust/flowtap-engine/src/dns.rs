//! Reading name-resolution responses relayed for DNS flows

use crate::error::{EngineError, Result};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::IpAddr;

/// Address/hostname pairs answered by a DNS response.
///
/// Only successful responses yield pairs; the hostname is the first
/// question's name without its trailing dot.
pub fn parse_response(payload: &[u8]) -> Result<Vec<(IpAddr, String)>> {
    let message = Message::from_bytes(payload)
        .map_err(|e| EngineError::Dns(format!("Failed to parse DNS response: {}", e)))?;

    if message.message_type() != MessageType::Response {
        return Err(EngineError::Dns("not a response".to_string()));
    }
    if message.response_code() != ResponseCode::NoError {
        return Ok(Vec::new());
    }

    let Some(query) = message.queries().first() else {
        return Ok(Vec::new());
    };
    let name = query.name().to_utf8();
    let hostname = name.trim_end_matches('.').to_string();

    let mut pairs = Vec::new();
    for answer in message.answers() {
        match answer.data() {
            RData::A(a) => pairs.push((IpAddr::V4(a.0), hostname.clone())),
            RData::AAAA(aaaa) => pairs.push((IpAddr::V6(aaaa.0), hostname.clone())),
            _ => {}
        }
    }

    Ok(pairs)
}
