//! Client role: the side inside the private network that opens the single
//! outbound tunnel connection and receives its namespace id from the relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use uplink_protocol::{
    Credentials, DEFAULT_HANDSHAKE_TIMEOUT_MS, HandshakeRequest, HandshakeResponse,
    HandshakeResult, MessageBlock, MessageType, PROTOCOL_VERSION, ProtocolErrorKind,
};

use crate::error::UplinkError;
use crate::session::{SessionCore, SessionEvent};
use crate::state::SessionState;
use crate::transport::MessageTransport;

/// Client-side session ids (`c1`, `c2`, ...); a separate namespace from the
/// relay's `s` ids, never compared across roles.
static CLIENT_SESSION_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

pub struct ClientSessionParameters {
    pub credentials: Credentials,
    /// Distinguishes parallel logins under the same account; the relay
    /// substitutes a default when absent.
    pub session_qualifier: Option<String>,
    pub client_version: Option<String>,
    pub handshake_timeout: Duration,
}

impl ClientSessionParameters {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            session_qualifier: None,
            client_version: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        }
    }

    pub fn with_session_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.session_qualifier = Some(qualifier.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// One client-side uplink session bound to one live transport. Inbound
/// blocks are pushed in via [`ClientSession::handle_block`] by whoever owns
/// the transport's receiving end.
pub struct ClientSession {
    core: Arc<SessionCore>,
    parameters: ClientSessionParameters,
}

impl ClientSession {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        parameters: ClientSessionParameters,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let local_session_id = format!(
            "c{}",
            CLIENT_SESSION_ID_GENERATOR.fetch_add(1, Ordering::Relaxed) + 1
        );
        Arc::new(Self {
            core: Arc::new(SessionCore::new(local_session_id, transport, events)),
            parameters,
        })
    }

    /// Sends the handshake request and arms the bounded handshake timeout.
    /// Calling this twice is a caller bug and fails with `InvalidTransition`.
    pub fn begin_handshake(&self) -> Result<(), UplinkError> {
        let mut inner = self.core.lock();
        self.core
            .transition_locked(&mut inner, SessionState::ClientHandshakeRequestReady)?;

        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            credentials: self.parameters.credentials.clone(),
            session_qualifier: self.parameters.session_qualifier.clone(),
            client_version: self.parameters.client_version.clone(),
        };
        let block = match request.encode() {
            Ok(block) => block,
            Err(e) => {
                let reason = format!("failed to encode handshake request: {e}");
                self.core
                    .fail_locked(&mut inner, ProtocolErrorKind::InternalError, reason.clone());
                return Err(UplinkError::Protocol(reason));
            }
        };
        self.core.send_block_locked(&mut inner, block)?;
        drop(inner);

        let core = Arc::clone(&self.core);
        let timeout = self.parameters.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            core.fail_if_still_pre_active(
                ProtocolErrorKind::HandshakeTimeout,
                "no handshake response within the allowed time",
            );
        });
        Ok(())
    }

    /// Push-delivery entry point for one inbound block.
    pub fn handle_block(&self, block: MessageBlock) {
        match block.message_type {
            MessageType::Handshake => self.process_handshake_response(&block),
            MessageType::Goodbye => self.core.handle_goodbye_block(&block),
            MessageType::Payload => self.core.handle_payload_block(block),
        }
    }

    /// The transport's incoming direction ended.
    pub fn handle_transport_closed(&self) {
        self.core.handle_transport_closed();
    }

    fn process_handshake_response(&self, block: &MessageBlock) {
        let mut inner = self.core.lock();
        if inner.state != SessionState::ClientHandshakeRequestReady {
            let state = inner.state;
            self.core.fail_locked(
                &mut inner,
                ProtocolErrorKind::ProtocolViolation,
                format!("unexpected handshake block in state {state}"),
            );
            return;
        }
        let _ = self
            .core
            .transition_locked(&mut inner, SessionState::ServerHandshakeResponseReady);

        let response = match HandshakeResponse::decode(block) {
            Ok(response) => response,
            Err(e) => {
                self.core.fail_locked(
                    &mut inner,
                    ProtocolErrorKind::InvalidHandshakeData,
                    format!("malformed handshake response: {e}"),
                );
                return;
            }
        };
        if response.protocol_version != PROTOCOL_VERSION {
            self.core.fail_locked(
                &mut inner,
                ProtocolErrorKind::VersionMismatch,
                format!(
                    "relay protocol version {} is incompatible with {}",
                    response.protocol_version, PROTOCOL_VERSION
                ),
            );
            return;
        }

        match response.result {
            HandshakeResult::Accepted {
                assigned_namespace_id,
            } => {
                if assigned_namespace_id.is_empty() {
                    self.core.fail_locked(
                        &mut inner,
                        ProtocolErrorKind::InvalidHandshakeData,
                        "handshake response did not include a namespace id".to_string(),
                    );
                    return;
                }
                let _ = self
                    .core
                    .set_namespace_locked(&mut inner, assigned_namespace_id);
                let _ = self.core.transition_locked(&mut inner, SessionState::Active);
                self.core.emit_activated_locked(&inner);
            }
            HandshakeResult::Refused { kind, message } => {
                self.core
                    .fail_locked(&mut inner, kind, format!("refused by relay: {message}"));
            }
        }
    }

    // ---- public session API ----

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn local_session_id(&self) -> &str {
        self.core.local_session_id()
    }

    pub fn log_descriptor(&self) -> String {
        self.core.log_descriptor()
    }

    pub fn assigned_namespace_id(&self) -> Result<String, UplinkError> {
        self.core.assigned_namespace_id()
    }

    pub fn assigned_namespace_id_if_available(&self) -> Option<String> {
        self.core.assigned_namespace_id_if_available()
    }

    pub fn destination_id_prefix(&self) -> Result<String, UplinkError> {
        self.core.destination_id_prefix()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn is_shutting_down_or_shut_down(&self) -> bool {
        self.core.is_shutting_down_or_shut_down()
    }

    pub fn initiate_clean_shutdown_if_running(&self) {
        self.core.initiate_clean_shutdown_if_running();
    }

    /// Sends one application payload block; only legal while active.
    pub fn send_payload(&self, payload: Vec<u8>) -> Result<(), UplinkError> {
        self.core.send_payload(payload)
    }
}
