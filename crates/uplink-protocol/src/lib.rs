//! Wire-content types for the uplink tunnel session protocol.
//!
//! A session exchanges opaque *message blocks* over a transport that has
//! already resolved block boundaries; this crate only defines the content of
//! those blocks. Handshake and goodbye payloads are JSON; payload blocks are
//! uninterpreted bytes owned by the resource-catalog layer above.

use serde::{Deserialize, Serialize};

/// High-level protocol version, checked for strict equality during handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Qualifier substituted when a client sends none, so that one account can
/// hold multiple distinguishable sessions.
pub const DEFAULT_SESSION_QUALIFIER: &str = "default";

/// Number of leading characters of the account name that contribute to the
/// derived namespace id; longer names are truncated.
pub const ACCOUNT_NAME_SIGNIFICANT_CHARS: usize = 16;

/// Same limit for the client-supplied session qualifier.
pub const SESSION_QUALIFIER_SIGNIFICANT_CHARS: usize = 16;

/// Upper bound on a single block's payload, as a sanity check against
/// protocol errors and heap exhaustion.
pub const MAX_BLOCK_PAYLOAD_BYTES: usize = 256 * 1024;

/// Default bound on how long either side waits for the peer's handshake
/// message before giving up on the session.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

/// Classification of a block, routing it to the handshake coordinator, the
/// shutdown coordinator, or the payload layer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Goodbye,
    Payload,
}

/// One framed unit of traffic. Framing itself is the transport's job; a
/// block is what the transport delivers and accepts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl MessageBlock {
    /// Builds a block, rejecting oversized payloads.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Result<Self, BlockSizeError> {
        if payload.len() > MAX_BLOCK_PAYLOAD_BYTES {
            return Err(BlockSizeError {
                size: payload.len(),
            });
        }
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Announced payload size outside the accepted range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSizeError {
    pub size: usize,
}

impl std::fmt::Display for BlockSizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "message block payload of {} bytes exceeds the limit of {} bytes",
            self.size, MAX_BLOCK_PAYLOAD_BYTES
        )
    }
}

impl std::error::Error for BlockSizeError {}

/// Login credentials presented by the client; verified by the relay's
/// external authenticator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_name: String,
    pub secret: String,
}

/// First message of a session, client to relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeRequest {
    pub protocol_version: String,
    pub credentials: Credentials,
    /// Distinguishes parallel logins under the same account.
    #[serde(default)]
    pub session_qualifier: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Relay's answer to a [`HandshakeRequest`]. An explicit refusal lets the
/// client distinguish "refused" from "no response at all".
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeResponse {
    pub protocol_version: String,
    pub result: HandshakeResult,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandshakeResult {
    Accepted { assigned_namespace_id: String },
    Refused { kind: ProtocolErrorKind, message: String },
}

/// Payload of a GOODBYE block. A regular goodbye carries no error; a
/// goodbye with an error reports a fatal condition that ends the session
/// uncleanly on the receiving side.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Goodbye {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GoodbyeError>,
}

impl Goodbye {
    pub fn regular() -> Self {
        Self::default()
    }

    pub fn with_error(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(GoodbyeError {
                kind,
                message: message.into(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GoodbyeError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

/// Machine-readable reason attached to refusals and error goodbyes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorKind {
    VersionMismatch,
    InvalidHandshakeData,
    AuthenticationFailed,
    NamespaceCollision,
    HandshakeTimeout,
    ConnectionError,
    ProtocolViolation,
    InternalError,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolErrorKind::VersionMismatch => "version_mismatch",
            ProtocolErrorKind::InvalidHandshakeData => "invalid_handshake_data",
            ProtocolErrorKind::AuthenticationFailed => "authentication_failed",
            ProtocolErrorKind::NamespaceCollision => "namespace_collision",
            ProtocolErrorKind::HandshakeTimeout => "handshake_timeout",
            ProtocolErrorKind::ConnectionError => "connection_error",
            ProtocolErrorKind::ProtocolViolation => "protocol_violation",
            ProtocolErrorKind::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

macro_rules! json_block {
    ($ty:ty, $message_type:expr) => {
        impl $ty {
            /// Serializes this payload into its message block.
            pub fn encode(&self) -> Result<MessageBlock, serde_json::Error> {
                Ok(MessageBlock {
                    message_type: $message_type,
                    payload: serde_json::to_vec(self)?,
                })
            }

            /// Parses this payload out of a received block.
            pub fn decode(block: &MessageBlock) -> Result<Self, serde_json::Error> {
                serde_json::from_slice(&block.payload)
            }
        }
    };
}

json_block!(HandshakeRequest, MessageType::Handshake);
json_block!(HandshakeResponse, MessageType::Handshake);
json_block!(Goodbye, MessageType::Goodbye);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_block_is_rejected() {
        let err = MessageBlock::new(MessageType::Payload, vec![0u8; MAX_BLOCK_PAYLOAD_BYTES + 1])
            .unwrap_err();
        assert_eq!(err.size, MAX_BLOCK_PAYLOAD_BYTES + 1);
        assert!(MessageBlock::new(MessageType::Payload, vec![0u8; 16]).is_ok());
    }

    #[test]
    fn refusal_roundtrip_keeps_kind_and_message() {
        let response = HandshakeResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            result: HandshakeResult::Refused {
                kind: ProtocolErrorKind::AuthenticationFailed,
                message: "bad secret".to_string(),
            },
        };
        let block = response.encode().expect("encode");
        assert_eq!(block.message_type, MessageType::Handshake);
        let decoded = HandshakeResponse::decode(&block).expect("decode");
        match decoded.result {
            HandshakeResult::Refused { kind, message } => {
                assert_eq!(kind, ProtocolErrorKind::AuthenticationFailed);
                assert_eq!(message, "bad secret");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn goodbye_error_classification() {
        let regular = Goodbye::regular().encode().expect("encode");
        assert!(Goodbye::decode(&regular).expect("decode").error.is_none());

        let fatal = Goodbye::with_error(ProtocolErrorKind::InternalError, "boom")
            .encode()
            .expect("encode");
        let decoded = Goodbye::decode(&fatal).expect("decode");
        let error = decoded.error.expect("error payload");
        assert_eq!(error.kind, ProtocolErrorKind::InternalError);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn handshake_request_tolerates_missing_optional_fields() {
        let block = MessageBlock {
            message_type: MessageType::Handshake,
            payload: br#"{"protocol_version":"1.0","credentials":{"account_name":"a","secret":"s"}}"#
                .to_vec(),
        };
        let request = HandshakeRequest::decode(&block).expect("decode");
        assert_eq!(request.session_qualifier, None);
        assert_eq!(request.client_version, None);
    }
}
