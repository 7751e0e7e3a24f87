//! JSON over HTTP transport.
//!
//! One `POST /` endpoint carries every negotiation message:
//!
//! ```text
//! → {"type": "DISCOVER", "client_id": "aa:bb:cc:dd:ee:ff"}
//! ← 200 {"status": "OFFER", "address": "10.0.0.1", "lease_duration_seconds": 3600}
//! → {"type": "REQUEST", "client_id": "aa:bb:cc:dd:ee:ff", "requested_address": "10.0.0.1"}
//! ← 200 {"status": "ACK", "address": "10.0.0.1", "lease_duration_seconds": 3600}
//! ```
//!
//! Negative outcomes are non-2xx with a plain text reason.

mod client;
mod server;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::lease::ClientId;
use crate::options::MessageType;

pub use client::HttpNegotiationClient;
pub use server::{router, serve};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestKind {
    Discover,
    Request,
    Release,
}

impl From<RequestKind> for MessageType {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Discover => MessageType::Discover,
            RequestKind::Request => MessageType::Request,
            RequestKind::Release => MessageType::Release,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(alias = "mac")]
    pub client_id: ClientId,
    #[serde(
        default,
        alias = "requested_ip",
        alias = "ip",
        skip_serializing_if = "Option::is_none"
    )]
    pub requested_address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Offer,
    Ack,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    pub lease_duration_seconds: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accepts_short_field_names() {
        let request: NegotiationRequest = serde_json::from_str(
            r#"{"type": "REQUEST", "mac": "aa:bb:cc:dd:ee:ff", "requested_ip": "10.0.0.1"}"#,
        )
        .unwrap();

        assert_eq!(request.kind, RequestKind::Request);
        assert_eq!(
            request.client_id,
            ClientId::new(vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(request.requested_address, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_request_without_address() {
        let request: NegotiationRequest =
            serde_json::from_str(r#"{"type": "DISCOVER", "client_id": "host-1"}"#).unwrap();
        assert_eq!(request.kind, RequestKind::Discover);
        assert_eq!(request.requested_address, None);
        assert_eq!(request.client_id.as_bytes(), b"host-1");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result =
            serde_json::from_str::<NegotiationRequest>(r#"{"type": "OFFER", "client_id": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_omits_missing_address() {
        let response = NegotiationResponse {
            status: ResponseStatus::Released,
            address: None,
            lease_duration_seconds: 0,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"status":"RELEASED","lease_duration_seconds":0}"#);
    }
}
