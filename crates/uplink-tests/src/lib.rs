//! Integration test helpers: a client session and a relay session wired
//! back-to-back over the in-process transport, with pump tasks standing in
//! for the byte-stream layer's delivery threads.

use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libuplink::{
    AccountTableAuthenticator, AuthDecision, Authenticator, ClientSession,
    ClientSessionParameters, InProcessTransport, MessageTransport, RelaySession, SessionEvent,
    SessionRegistry, TransportError,
};
use tokio::sync::mpsc;
use uplink_protocol::{Credentials, MessageBlock};

static INIT_TRACING: Once = Once::new();

/// Installs a fmt subscriber once per test binary; `RUST_LOG` selects the
/// verbosity when a test needs the session traces.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "libuplink=warn".into()),
            )
            .with_test_writer()
            .init();
    });
}

pub const TEST_ACCOUNT: &str = "alice";
pub const TEST_SECRET: &str = "s3cret";

pub fn credentials(account: &str, secret: &str) -> Credentials {
    Credentials {
        account_name: account.to_string(),
        secret: secret.to_string(),
    }
}

pub fn default_authenticator() -> Arc<AccountTableAuthenticator> {
    Arc::new(AccountTableAuthenticator::new().with_account(TEST_ACCOUNT, TEST_SECRET))
}

/// Accepts any credentials; used by the concurrency stress tests.
pub struct AcceptAllAuthenticator;

impl Authenticator for AcceptAllAuthenticator {
    fn verify(&self, _credentials: &Credentials) -> AuthDecision {
        AuthDecision::Accepted
    }
}

/// Transport decorator that can be switched into a failing mode, simulating
/// a broken connection underneath an established session.
pub struct BreakableTransport {
    inner: InProcessTransport,
    broken: AtomicBool,
}

impl BreakableTransport {
    pub fn new(inner: InProcessTransport) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken: AtomicBool::new(false),
        })
    }

    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl MessageTransport for BreakableTransport {
    fn send_block(&self, block: MessageBlock) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("simulated write failure".to_string()));
        }
        self.inner.send_block(block)
    }

    fn close_outgoing(&self) {
        self.inner.close_outgoing();
    }
}

/// A connected client/relay pair with running delivery pumps.
pub struct SessionPair {
    pub client: Arc<ClientSession>,
    pub relay: Arc<RelaySession>,
    pub client_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub relay_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub registry: Arc<SessionRegistry>,
    /// Client-side transport handle, kept so tests can break it.
    pub client_transport: Arc<BreakableTransport>,
}

pub fn default_client_parameters() -> ClientSessionParameters {
    ClientSessionParameters::new(credentials(TEST_ACCOUNT, TEST_SECRET))
}

/// Wires a fresh client and relay session over an in-process transport pair
/// and spawns one pump task per direction. The handshake is not started.
pub fn connect_pair(
    registry: &Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    parameters: ClientSessionParameters,
) -> SessionPair {
    init_tracing();
    let (client_side, mut client_inbound, relay_side, mut relay_inbound) =
        InProcessTransport::pair();
    let client_transport = BreakableTransport::new(client_side);

    let (client_events_tx, client_events) = mpsc::unbounded_channel();
    let client = ClientSession::new(
        client_transport.clone() as Arc<dyn MessageTransport>,
        parameters,
        client_events_tx,
    );

    let (relay_events_tx, relay_events) = mpsc::unbounded_channel();
    let relay = RelaySession::accept(
        Arc::new(relay_side),
        Arc::clone(registry),
        authenticator,
        relay_events_tx,
    );

    let pump_client = Arc::clone(&client);
    tokio::spawn(async move {
        while let Some(block) = client_inbound.recv().await {
            pump_client.handle_block(block);
        }
        pump_client.handle_transport_closed();
    });

    let pump_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        while let Some(block) = relay_inbound.recv().await {
            pump_relay.handle_block(block);
        }
        pump_relay.handle_transport_closed();
    });

    SessionPair {
        client,
        relay,
        client_events,
        relay_events,
        registry: Arc::clone(registry),
        client_transport,
    }
}

/// Polls `condition` until it holds, panicking after a generous bound so a
/// wedged session fails the test instead of hanging it.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Receives the next session event, bounded.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}
