//! Core of the uplink tunnel session protocol: the session state machine,
//! the handshake and goodbye coordination, and the client/relay role
//! wrappers that bind one session to one live message transport.
//!
//! The transport (framing, TLS, reconnection) and the credential mechanism
//! are external collaborators behind the [`transport::MessageTransport`] and
//! [`auth::Authenticator`] seams.

pub mod auth;
pub mod client;
pub mod error;
pub mod registry;
pub mod relay;
pub mod session;
pub mod state;
pub mod transport;

pub use auth::{AccountTableAuthenticator, AuthDecision, Authenticator};
pub use client::{ClientSession, ClientSessionParameters};
pub use error::UplinkError;
pub use registry::SessionRegistry;
pub use relay::RelaySession;
pub use session::SessionEvent;
pub use state::SessionState;
pub use transport::{InProcessTransport, MessageTransport, TransportError};
