//! The session state machine shared by the client and relay roles.

/// Lifecycle states of one uplink session.
///
/// Role asymmetry: for the relay, `ClientHandshakeRequestReady` means "the
/// client's handshake request was received and is being processed"; for the
/// client it means "the request was sent, awaiting the response".
/// `ServerHandshakeResponseReady` only occurs on the client side; the relay
/// moves straight from processing to `Active` or refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    ClientHandshakeRequestReady,
    ServerHandshakeResponseReady,
    Active,
    GoodbyeHandshake,
    GoodbyeHandshakeComplete,
    CleanShutdown,
    SessionRefusedOrHandshakeError,
    UncleanShutdownInitiated,
    UncleanShutdown,
}

impl SessionState {
    /// Whether the edge `self -> to` exists. Everything not listed here is
    /// an invalid transition, including every edge out of a terminal state.
    pub fn permits_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        if self == to {
            return false;
        }
        match (self, to) {
            (Initial, ClientHandshakeRequestReady) => true,
            // Client role: response received, being processed.
            (ClientHandshakeRequestReady, ServerHandshakeResponseReady) => true,
            // Relay role: goes active directly after composing its response.
            (ClientHandshakeRequestReady, Active) => true,
            (ServerHandshakeResponseReady, Active) => true,
            // One goodbye direction observed, or both in a single step when
            // the remote goodbye is answered immediately.
            (Active, GoodbyeHandshake) => true,
            (Active, GoodbyeHandshakeComplete) => true,
            (GoodbyeHandshake, GoodbyeHandshakeComplete) => true,
            (GoodbyeHandshakeComplete, CleanShutdown) => true,
            // Refusal is only reachable before/at handshake conclusion.
            (
                Initial | ClientHandshakeRequestReady | ServerHandshakeResponseReady,
                SessionRefusedOrHandshakeError,
            ) => true,
            (from, UncleanShutdownInitiated) => !from.is_terminal(),
            (UncleanShutdownInitiated, UncleanShutdown) => true,
            _ => false,
        }
    }

    /// True for the three states that permit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::SessionRefusedOrHandshakeError
                | SessionState::CleanShutdown
                | SessionState::UncleanShutdown
        )
    }

    /// True once any shutdown path has started, including all terminal
    /// states. Callers use this as "no more application traffic".
    pub fn is_shutting_down_or_shut_down(self) -> bool {
        matches!(
            self,
            SessionState::GoodbyeHandshake
                | SessionState::GoodbyeHandshakeComplete
                | SessionState::CleanShutdown
                | SessionState::SessionRefusedOrHandshakeError
                | SessionState::UncleanShutdownInitiated
                | SessionState::UncleanShutdown
        )
    }

    /// True while the handshake has not concluded yet; fatal conditions in
    /// these states resolve to a refusal rather than an unclean shutdown.
    pub fn is_before_handshake_conclusion(self) -> bool {
        matches!(
            self,
            SessionState::Initial
                | SessionState::ClientHandshakeRequestReady
                | SessionState::ServerHandshakeResponseReady
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initial => "INITIAL",
            SessionState::ClientHandshakeRequestReady => "CLIENT_HANDSHAKE_REQUEST_READY",
            SessionState::ServerHandshakeResponseReady => "SERVER_HANDSHAKE_RESPONSE_READY",
            SessionState::Active => "ACTIVE",
            SessionState::GoodbyeHandshake => "GOODBYE_HANDSHAKE",
            SessionState::GoodbyeHandshakeComplete => "GOODBYE_HANDSHAKE_COMPLETE",
            SessionState::CleanShutdown => "CLEAN_SHUTDOWN",
            SessionState::SessionRefusedOrHandshakeError => "SESSION_REFUSED_OR_HANDSHAKE_ERROR",
            SessionState::UncleanShutdownInitiated => "UNCLEAN_SHUTDOWN_INITIATED",
            SessionState::UncleanShutdown => "UNCLEAN_SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::{self, *};

    const ALL: [SessionState; 10] = [
        Initial,
        ClientHandshakeRequestReady,
        ServerHandshakeResponseReady,
        Active,
        GoodbyeHandshake,
        GoodbyeHandshakeComplete,
        CleanShutdown,
        SessionRefusedOrHandshakeError,
        UncleanShutdownInitiated,
        UncleanShutdown,
    ];

    fn expected_edges(from: SessionState) -> Vec<SessionState> {
        let mut edges = match from {
            Initial => vec![ClientHandshakeRequestReady, SessionRefusedOrHandshakeError],
            ClientHandshakeRequestReady => vec![
                ServerHandshakeResponseReady,
                Active,
                SessionRefusedOrHandshakeError,
            ],
            ServerHandshakeResponseReady => vec![Active, SessionRefusedOrHandshakeError],
            Active => vec![GoodbyeHandshake, GoodbyeHandshakeComplete],
            GoodbyeHandshake => vec![GoodbyeHandshakeComplete],
            GoodbyeHandshakeComplete => vec![CleanShutdown],
            UncleanShutdownInitiated => vec![UncleanShutdown],
            CleanShutdown | SessionRefusedOrHandshakeError | UncleanShutdown => vec![],
        };
        if !from.is_terminal() && from != UncleanShutdownInitiated {
            edges.push(UncleanShutdownInitiated);
        }
        edges
    }

    #[test]
    fn transition_matrix_matches_protocol_definition() {
        for from in ALL {
            let expected = expected_edges(from);
            for to in ALL {
                assert_eq!(
                    from.permits_transition_to(to),
                    expected.contains(&to),
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_permit_nothing() {
        for from in [CleanShutdown, SessionRefusedOrHandshakeError, UncleanShutdown] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.permits_transition_to(to), "edge {from} -> {to}");
            }
        }
        for from in ALL {
            if !matches!(
                from,
                CleanShutdown | SessionRefusedOrHandshakeError | UncleanShutdown
            ) {
                assert!(!from.is_terminal(), "{from} must not be terminal");
            }
        }
    }

    #[test]
    fn shutdown_query_covers_goodbye_and_terminal_states() {
        for state in ALL {
            let expected = matches!(
                state,
                GoodbyeHandshake
                    | GoodbyeHandshakeComplete
                    | CleanShutdown
                    | SessionRefusedOrHandshakeError
                    | UncleanShutdownInitiated
                    | UncleanShutdown
            );
            assert_eq!(state.is_shutting_down_or_shut_down(), expected, "{state}");
        }
    }

    #[test]
    fn self_edges_are_invalid() {
        for state in ALL {
            assert!(!state.permits_transition_to(state), "{state}");
        }
    }
}
