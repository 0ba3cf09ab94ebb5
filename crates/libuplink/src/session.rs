//! The shared session core used by both roles: state machine ownership,
//! goodbye bookkeeping, the single outbound send funnel, and the resolution
//! of fatal conditions into exactly one terminal state.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uplink_protocol::{Goodbye, MessageBlock, MessageType, ProtocolErrorKind};

use crate::error::UplinkError;
use crate::state::SessionState;
use crate::transport::MessageTransport;

/// Notifications pushed to the session's owner. The resource-catalog layer
/// consumes `Activated` (namespace available) and `PayloadReceived`; exactly
/// one of `Refused` / `Terminated` is emitted per session that leaves
/// `Initial`.
#[derive(Debug)]
pub enum SessionEvent {
    Activated {
        namespace_id: String,
    },
    Refused {
        kind: ProtocolErrorKind,
        reason: String,
    },
    PayloadReceived(Vec<u8>),
    Terminated {
        clean: bool,
    },
}

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) assigned_namespace_id: Option<String>,
    pub(crate) local_goodbye_sent: bool,
    pub(crate) remote_goodbye_received: bool,
}

/// State shared by one role wrapper and the tasks it spawns. All mutation
/// funnels through the single `inner` lock; transitions triggered by the
/// transport's delivery task and by application API calls never race.
pub(crate) struct SessionCore {
    local_session_id: String,
    transport: Arc<dyn MessageTransport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl SessionCore {
    pub(crate) fn new(
        local_session_id: String,
        transport: Arc<dyn MessageTransport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            local_session_id,
            transport,
            events,
            inner: Mutex::new(SessionInner {
                state: SessionState::Initial,
                assigned_namespace_id: None,
                local_goodbye_sent: false,
                remote_goodbye_received: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }

    // ---- queries ----

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub(crate) fn is_shutting_down_or_shut_down(&self) -> bool {
        self.state().is_shutting_down_or_shut_down()
    }

    pub(crate) fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    /// Display string for log correlation; recomputed so it picks up the
    /// namespace id as soon as it is assigned.
    pub(crate) fn log_descriptor(&self) -> String {
        Self::descriptor(&self.local_session_id, &self.lock())
    }

    fn descriptor(local_session_id: &str, inner: &SessionInner) -> String {
        match &inner.assigned_namespace_id {
            Some(namespace_id) => format!("{local_session_id}/{namespace_id}"),
            None => local_session_id.to_string(),
        }
    }

    pub(crate) fn assigned_namespace_id(&self) -> Result<String, UplinkError> {
        self.assigned_namespace_id_if_available().ok_or_else(|| {
            UplinkError::IllegalState(format!(
                "session {} has no namespace id assigned yet",
                self.local_session_id
            ))
        })
    }

    pub(crate) fn assigned_namespace_id_if_available(&self) -> Option<String> {
        self.lock().assigned_namespace_id.clone()
    }

    /// Currently identical to the namespace id; separate accessor so the
    /// derivation rule can change without touching call sites.
    pub(crate) fn destination_id_prefix(&self) -> Result<String, UplinkError> {
        self.assigned_namespace_id()
    }

    // ---- state mutation primitives ----

    /// The sole state mutator. Fails with `InvalidTransition` when the edge
    /// does not exist, leaving the current state untouched; attempts to
    /// leave a terminal state always fail here.
    pub(crate) fn transition_locked(
        &self,
        inner: &mut SessionInner,
        to: SessionState,
    ) -> Result<SessionState, UplinkError> {
        let from = inner.state;
        if !from.permits_transition_to(to) {
            return Err(UplinkError::InvalidTransition { from, to });
        }
        inner.state = to;
        debug!(
            session = %Self::descriptor(&self.local_session_id, inner),
            %from,
            %to,
            "session state transition"
        );
        Ok(to)
    }

    /// Stores the namespace id; set exactly once, immutable thereafter.
    pub(crate) fn set_namespace_locked(
        &self,
        inner: &mut SessionInner,
        namespace_id: String,
    ) -> Result<(), UplinkError> {
        if inner.assigned_namespace_id.is_some() {
            return Err(UplinkError::IllegalState(format!(
                "session {} already has a namespace id assigned",
                self.local_session_id
            )));
        }
        inner.assigned_namespace_id = Some(namespace_id);
        Ok(())
    }

    pub(crate) fn emit_activated_locked(&self, inner: &SessionInner) {
        let namespace_id = inner
            .assigned_namespace_id
            .clone()
            .unwrap_or_default();
        info!(
            session = %Self::descriptor(&self.local_session_id, inner),
            "session active"
        );
        let _ = self.events.send(SessionEvent::Activated { namespace_id });
    }

    // ---- outbound funnel ----

    /// Sends application payload; only legal while `Active`. A transport
    /// failure here is fatal for the session.
    pub(crate) fn send_payload(&self, payload: Vec<u8>) -> Result<(), UplinkError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            return Err(UplinkError::IllegalState(format!(
                "cannot send payload in state {}",
                inner.state
            )));
        }
        let block = MessageBlock::new(MessageType::Payload, payload)
            .map_err(|e| UplinkError::Protocol(e.to_string()))?;
        if let Err(e) = self.transport.send_block(block) {
            self.fail_locked(
                &mut inner,
                ProtocolErrorKind::ConnectionError,
                format!("payload send failed: {e}"),
            );
            return Err(UplinkError::Transport(e));
        }
        Ok(())
    }

    pub(crate) fn send_block_locked(
        &self,
        inner: &mut SessionInner,
        block: MessageBlock,
    ) -> Result<(), UplinkError> {
        if let Err(e) = self.transport.send_block(block) {
            self.fail_locked(
                inner,
                ProtocolErrorKind::ConnectionError,
                format!("send failed: {e}"),
            );
            return Err(UplinkError::Transport(e));
        }
        Ok(())
    }

    /// Best-effort send for blocks whose delivery failure must not change
    /// the session's fate, e.g. an explicit refusal response right before
    /// the session resolves into the refused state anyway.
    pub(crate) fn send_block_best_effort(&self, inner: &SessionInner, block: MessageBlock) {
        if let Err(e) = self.transport.send_block(block) {
            debug!(
                session = %Self::descriptor(&self.local_session_id, inner),
                error = %e,
                "best-effort send failed"
            );
        }
    }

    // ---- shutdown coordination ----

    /// Clean-shutdown entry point. Idempotent: a no-op unless the session is
    /// `Active`, so repeated calls never double-send a GOODBYE. Tearing down
    /// a pre-active session is the fatal path's job.
    pub(crate) fn initiate_clean_shutdown_if_running(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            debug!(
                session = %Self::descriptor(&self.local_session_id, &inner),
                state = %inner.state,
                "ignoring clean shutdown request, session not active"
            );
            return;
        }
        match self.send_regular_goodbye() {
            Ok(()) => {
                inner.local_goodbye_sent = true;
                if inner.remote_goodbye_received {
                    let _ =
                        self.transition_locked(&mut inner, SessionState::GoodbyeHandshakeComplete);
                    self.finish_clean_locked(&mut inner);
                } else {
                    let _ = self.transition_locked(&mut inner, SessionState::GoodbyeHandshake);
                }
            }
            Err(e) => self.fail_locked(
                &mut inner,
                ProtocolErrorKind::ConnectionError,
                format!("failed to send goodbye: {e}"),
            ),
        }
    }

    /// Routes a received GOODBYE block. A regular goodbye advances the
    /// two-phase exchange; a goodbye carrying an error is a remote fatal
    /// report and takes the refusal or unclean path.
    pub(crate) fn handle_goodbye_block(&self, block: &MessageBlock) {
        let goodbye = match Goodbye::decode(block) {
            Ok(goodbye) => goodbye,
            Err(e) => {
                self.fail(
                    ProtocolErrorKind::ProtocolViolation,
                    format!("malformed goodbye block: {e}"),
                );
                return;
            }
        };

        if let Some(error) = goodbye.error {
            self.fail(error.kind, format!("reported by peer: {}", error.message));
            return;
        }

        let mut inner = self.lock();
        match inner.state {
            SessionState::Active => {
                inner.remote_goodbye_received = true;
                // Answer with the local goodbye and complete in one step.
                match self.send_regular_goodbye() {
                    Ok(()) => {
                        inner.local_goodbye_sent = true;
                        let _ = self
                            .transition_locked(&mut inner, SessionState::GoodbyeHandshakeComplete);
                        self.finish_clean_locked(&mut inner);
                    }
                    Err(e) => self.fail_locked(
                        &mut inner,
                        ProtocolErrorKind::ConnectionError,
                        format!("failed to answer goodbye: {e}"),
                    ),
                }
            }
            SessionState::GoodbyeHandshake => {
                inner.remote_goodbye_received = true;
                let _ = self.transition_locked(&mut inner, SessionState::GoodbyeHandshakeComplete);
                self.finish_clean_locked(&mut inner);
            }
            state if state.is_before_handshake_conclusion() => {
                self.fail_locked(
                    &mut inner,
                    ProtocolErrorKind::ConnectionError,
                    "peer said goodbye before handshake completion".to_string(),
                );
            }
            state => {
                debug!(
                    session = %Self::descriptor(&self.local_session_id, &inner),
                    %state,
                    "ignoring late goodbye"
                );
            }
        }
    }

    /// The transport's incoming direction ended. Harmless after a clean
    /// shutdown, a refusal before handshake conclusion, and an ungraceful
    /// disconnect anywhere else.
    pub(crate) fn handle_transport_closed(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        if inner.state.is_before_handshake_conclusion() {
            self.fail_locked(
                &mut inner,
                ProtocolErrorKind::ConnectionError,
                "connection closed during handshake".to_string(),
            );
        } else {
            self.fail_locked(
                &mut inner,
                ProtocolErrorKind::ConnectionError,
                "connection closed by peer without goodbye".to_string(),
            );
        }
    }

    /// Routes a received payload block to the session's owner.
    pub(crate) fn handle_payload_block(&self, block: MessageBlock) {
        let mut inner = self.lock();
        match inner.state {
            // Incoming stays open during the goodbye exchange, so payload
            // may still arrive after the local goodbye was sent.
            SessionState::Active | SessionState::GoodbyeHandshake => {
                drop(inner);
                let _ = self.events.send(SessionEvent::PayloadReceived(block.payload));
            }
            state if state.is_before_handshake_conclusion() => {
                self.fail_locked(
                    &mut inner,
                    ProtocolErrorKind::ProtocolViolation,
                    "payload block before handshake completion".to_string(),
                );
            }
            state => {
                debug!(
                    session = %Self::descriptor(&self.local_session_id, &inner),
                    %state,
                    "discarding payload block"
                );
            }
        }
    }

    // ---- fatal path ----

    /// Resolves a fatal condition: refusal before handshake conclusion,
    /// unclean shutdown afterwards. Idempotent once a terminal state is
    /// reached; never sends a GOODBYE and never blocks on the peer.
    pub(crate) fn fail(&self, kind: ProtocolErrorKind, reason: impl Into<String>) {
        let mut inner = self.lock();
        self.fail_locked(&mut inner, kind, reason.into());
    }

    pub(crate) fn fail_locked(
        &self,
        inner: &mut SessionInner,
        kind: ProtocolErrorKind,
        reason: String,
    ) {
        if inner.state.is_terminal() {
            debug!(
                session = %Self::descriptor(&self.local_session_id, inner),
                %kind,
                reason = %reason,
                "ignoring fatal condition, session already terminal"
            );
            return;
        }
        if inner.state.is_before_handshake_conclusion() {
            let _ = self.transition_locked(inner, SessionState::SessionRefusedOrHandshakeError);
            self.transport.close_outgoing();
            warn!(
                session = %Self::descriptor(&self.local_session_id, inner),
                %kind,
                reason = %reason,
                "session refused or handshake failed"
            );
            let _ = self.events.send(SessionEvent::Refused { kind, reason });
        } else {
            let _ = self.transition_locked(inner, SessionState::UncleanShutdownInitiated);
            self.transport.close_outgoing();
            let _ = self.transition_locked(inner, SessionState::UncleanShutdown);
            warn!(
                session = %Self::descriptor(&self.local_session_id, inner),
                %kind,
                reason = %reason,
                "session shut down uncleanly"
            );
            let _ = self.events.send(SessionEvent::Terminated { clean: false });
        }
    }

    /// Fatal-path entry for the handshake timeout tasks: only fires while
    /// the handshake has not concluded, otherwise a no-op.
    pub(crate) fn fail_if_still_pre_active(&self, kind: ProtocolErrorKind, reason: &str) {
        let mut inner = self.lock();
        if inner.state.is_before_handshake_conclusion() {
            self.fail_locked(&mut inner, kind, reason.to_string());
        }
    }

    // ---- internals ----

    fn send_regular_goodbye(&self) -> Result<(), UplinkError> {
        let block = Goodbye::regular()
            .encode()
            .map_err(|e| UplinkError::Protocol(format!("failed to encode goodbye: {e}")))?;
        self.transport.send_block(block)?;
        Ok(())
    }

    /// Both goodbye directions observed: close our outgoing direction and
    /// finish. Reaching `CleanShutdown` never waits for the transport to
    /// fully close.
    fn finish_clean_locked(&self, inner: &mut SessionInner) {
        self.transport.close_outgoing();
        let _ = self.transition_locked(inner, SessionState::CleanShutdown);
        info!(
            session = %Self::descriptor(&self.local_session_id, inner),
            "session closed cleanly"
        );
        let _ = self.events.send(SessionEvent::Terminated { clean: true });
    }
}
