//! Credential verification seam, consumed by the relay role only.

use std::collections::HashMap;

use uplink_protocol::Credentials;

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted,
    /// Rejected with a reason that is safe to echo back to the client.
    Rejected(String),
}

/// Verifies client credentials during the relay-side handshake. The actual
/// mechanism (SSH account lookup, token service, ...) lives outside the
/// protocol core.
pub trait Authenticator: Send + Sync {
    fn verify(&self, credentials: &Credentials) -> AuthDecision;
}

/// Shared-secret table keyed by account name. Sufficient for in-process
/// relays and tests; production deployments plug in their own seam.
#[derive(Default)]
pub struct AccountTableAuthenticator {
    accounts: HashMap<String, String>,
}

impl AccountTableAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account_name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.accounts.insert(account_name.into(), secret.into());
        self
    }
}

impl Authenticator for AccountTableAuthenticator {
    fn verify(&self, credentials: &Credentials) -> AuthDecision {
        match self.accounts.get(&credentials.account_name) {
            Some(secret) if *secret == credentials.secret => AuthDecision::Accepted,
            Some(_) => AuthDecision::Rejected("invalid credentials".to_string()),
            None => AuthDecision::Rejected("unknown account".to_string()),
        }
    }
}
