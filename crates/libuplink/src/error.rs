use thiserror::Error;

use crate::state::SessionState;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum UplinkError {
    /// The requested state-machine edge does not exist from the current
    /// state. Attempts to leave a terminal state always land here.
    #[error("invalid session state transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Caller bug: an operation was invoked in a state that does not
    /// support it, e.g. querying the namespace id before assignment.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The underlying transport failed to accept or deliver traffic.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or out-of-place traffic from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),
}
