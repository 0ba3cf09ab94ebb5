//! Relay role: the side reachable from outside the private network. It
//! authenticates the client, derives and claims the namespace id, and routes
//! everything after the handshake the same way the client role does.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uplink_protocol::{
    ACCOUNT_NAME_SIGNIFICANT_CHARS, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_SESSION_QUALIFIER,
    HandshakeRequest, HandshakeResponse, HandshakeResult, MessageBlock, MessageType,
    PROTOCOL_VERSION, ProtocolErrorKind, SESSION_QUALIFIER_SIGNIFICANT_CHARS,
};

use crate::auth::{AuthDecision, Authenticator};
use crate::error::UplinkError;
use crate::registry::SessionRegistry;
use crate::session::{SessionCore, SessionEvent, SessionInner};
use crate::state::SessionState;
use crate::transport::MessageTransport;

/// One relay-side uplink session bound to one accepted connection.
///
/// The handshake timeout is armed at accept time: for the relay, "handshake
/// pending" starts the moment the connection exists, not at any local call.
pub struct RelaySession {
    core: Arc<SessionCore>,
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    namespace_released: AtomicBool,
}

impl RelaySession {
    pub fn accept(
        transport: Arc<dyn MessageTransport>,
        registry: Arc<SessionRegistry>,
        authenticator: Arc<dyn Authenticator>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Self::accept_with_timeout(
            transport,
            registry,
            authenticator,
            events,
            Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }

    pub fn accept_with_timeout(
        transport: Arc<dyn MessageTransport>,
        registry: Arc<SessionRegistry>,
        authenticator: Arc<dyn Authenticator>,
        events: mpsc::UnboundedSender<SessionEvent>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        let local_session_id = registry.assign_session_id();
        let session = Arc::new(Self {
            core: Arc::new(SessionCore::new(local_session_id, transport, events)),
            registry,
            authenticator,
            namespace_released: AtomicBool::new(false),
        });

        let timeout_session = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(handshake_timeout).await;
            timeout_session.core.fail_if_still_pre_active(
                ProtocolErrorKind::HandshakeTimeout,
                "no handshake request within the allowed time",
            );
            timeout_session.release_namespace_if_terminal();
        });

        session
    }

    /// Push-delivery entry point for one inbound block.
    pub fn handle_block(&self, block: MessageBlock) {
        match block.message_type {
            MessageType::Handshake => self.process_handshake_request(&block),
            MessageType::Goodbye => self.core.handle_goodbye_block(&block),
            MessageType::Payload => self.core.handle_payload_block(block),
        }
        self.release_namespace_if_terminal();
    }

    /// The transport's incoming direction ended.
    pub fn handle_transport_closed(&self) {
        self.core.handle_transport_closed();
        self.release_namespace_if_terminal();
    }

    fn process_handshake_request(&self, block: &MessageBlock) {
        let mut inner = self.core.lock();
        if inner.state != SessionState::Initial {
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
            .transition_locked(&mut inner, SessionState::ClientHandshakeRequestReady);

        let request = match HandshakeRequest::decode(block) {
            Ok(request) => request,
            Err(e) => {
                self.refuse_locked(
                    &mut inner,
                    ProtocolErrorKind::InvalidHandshakeData,
                    format!("malformed handshake request: {e}"),
                );
                return;
            }
        };

        // strict equality, as long as no compatible version range exists
        if request.protocol_version != PROTOCOL_VERSION {
            self.refuse_locked(
                &mut inner,
                ProtocolErrorKind::VersionMismatch,
                format!(
                    "client protocol version {} is incompatible with {}; \
                     please use a matching client",
                    request.protocol_version, PROTOCOL_VERSION
                ),
            );
            return;
        }

        match self.authenticator.verify(&request.credentials) {
            AuthDecision::Accepted => {}
            AuthDecision::Rejected(reason) => {
                self.refuse_locked(&mut inner, ProtocolErrorKind::AuthenticationFailed, reason);
                return;
            }
        }

        let namespace_id = derive_namespace_id(
            &request.credentials.account_name,
            request.session_qualifier.as_deref(),
        );
        if !self
            .registry
            .attempt_assign_namespace(&namespace_id, self.core.local_session_id())
        {
            self.refuse_locked(
                &mut inner,
                ProtocolErrorKind::NamespaceCollision,
                format!(
                    "the account and client id combination '{namespace_id}' is already in use; \
                     use a distinct client id for each parallel login"
                ),
            );
            return;
        }
        let _ = self
            .core
            .set_namespace_locked(&mut inner, namespace_id.clone());

        let response = HandshakeResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            result: HandshakeResult::Accepted {
                assigned_namespace_id: namespace_id,
            },
        };
        let response_block = match response.encode() {
            Ok(block) => block,
            Err(e) => {
                self.core.fail_locked(
                    &mut inner,
                    ProtocolErrorKind::InternalError,
                    format!("failed to encode handshake response: {e}"),
                );
                return;
            }
        };
        if self.core.send_block_locked(&mut inner, response_block).is_err() {
            // already resolved into the refused state by the send funnel
            return;
        }
        let _ = self.core.transition_locked(&mut inner, SessionState::Active);
        self.core.emit_activated_locked(&inner);
    }

    /// Sends an explicit refusal response (best-effort, so the client can
    /// distinguish refusal from silence) and resolves the session locally.
    fn refuse_locked(&self, inner: &mut SessionInner, kind: ProtocolErrorKind, message: String) {
        let response = HandshakeResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            result: HandshakeResult::Refused {
                kind,
                message: message.clone(),
            },
        };
        match response.encode() {
            Ok(block) => self.core.send_block_best_effort(inner, block),
            Err(e) => debug!(error = %e, "failed to encode refusal response"),
        }
        self.core.fail_locked(inner, kind, message);
    }

    /// Releases the claimed namespace exactly once, as soon as the session
    /// has reached a terminal state. Safe to call from every entry point.
    fn release_namespace_if_terminal(&self) {
        if !self.core.state().is_terminal() {
            return;
        }
        let Some(namespace_id) = self.core.assigned_namespace_id_if_available() else {
            // a client that never completed a handshake has nothing to release
            return;
        };
        if self.namespace_released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry
            .release_namespace(&namespace_id, self.core.local_session_id());
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
        self.release_namespace_if_terminal();
    }

    /// Sends one application payload block; only legal while active.
    pub fn send_payload(&self, payload: Vec<u8>) -> Result<(), UplinkError> {
        let result = self.core.send_payload(payload);
        self.release_namespace_if_terminal();
        result
    }
}

/// Derives the namespace id from the effective account name and session
/// qualifier. Both components are truncated to their significant-character
/// limits; an absent or empty qualifier falls back to the default so one
/// account can still hold exactly one unqualified session.
fn derive_namespace_id(account_name: &str, session_qualifier: Option<&str>) -> String {
    let account = effective_component(account_name, ACCOUNT_NAME_SIGNIFICANT_CHARS, "account name");
    let qualifier = match session_qualifier {
        Some(qualifier) if !qualifier.is_empty() => {
            effective_component(qualifier, SESSION_QUALIFIER_SIGNIFICANT_CHARS, "session qualifier")
        }
        _ => DEFAULT_SESSION_QUALIFIER.to_string(),
    };
    format!("{account}/{qualifier}")
}

fn effective_component(value: &str, limit: usize, what: &str) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    warn!(
        value,
        truncated = %truncated,
        limit,
        "only the leading characters of the {what} contribute to the namespace id"
    );
    truncated
}
