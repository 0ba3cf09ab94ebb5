//! Shutdown behaviour of established sessions: the clean goodbye exchange,
//! its degenerate orderings, and the unclean path.

use std::sync::Arc;

use libuplink::{SessionEvent, SessionRegistry, SessionState};
use uplink_tests::{
    connect_pair, default_authenticator, default_client_parameters, next_event, wait_until,
    SessionPair,
};

async fn active_pair(registry: &Arc<SessionRegistry>) -> SessionPair {
    let mut pair = connect_pair(
        registry,
        default_authenticator(),
        default_client_parameters(),
    );
    pair.client.begin_handshake().expect("begin handshake");
    let client = Arc::clone(&pair.client);
    wait_until("client active", move || client.is_active()).await;
    let relay = Arc::clone(&pair.relay);
    wait_until("relay active", move || relay.is_active()).await;
    // consume both activation events so later assertions see shutdown events
    assert!(matches!(
        next_event(&mut pair.client_events).await,
        SessionEvent::Activated { .. }
    ));
    assert!(matches!(
        next_event(&mut pair.relay_events).await,
        SessionEvent::Activated { .. }
    ));
    pair
}

#[tokio::test]
async fn payload_flows_in_both_directions() {
    let registry = Arc::new(SessionRegistry::new());
    let mut pair = active_pair(&registry).await;

    pair.client.send_payload(b"ping".to_vec()).expect("send");
    match next_event(&mut pair.relay_events).await {
        SessionEvent::PayloadReceived(data) => assert_eq!(data, b"ping"),
        other => panic!("unexpected relay event: {other:?}"),
    }

    pair.relay.send_payload(b"pong".to_vec()).expect("send");
    match next_event(&mut pair.client_events).await {
        SessionEvent::PayloadReceived(data) => assert_eq!(data, b"pong"),
        other => panic!("unexpected client event: {other:?}"),
    }
}

#[tokio::test]
async fn local_shutdown_completes_cleanly_on_both_sides() {
    let registry = Arc::new(SessionRegistry::new());
    let mut pair = active_pair(&registry).await;

    pair.client.initiate_clean_shutdown_if_running();
    // the caller observes the shutdown immediately, before any peer reply
    assert!(pair.client.is_shutting_down_or_shut_down());
    assert!(!pair.client.is_active());

    let client = Arc::clone(&pair.client);
    wait_until("client clean shutdown", move || {
        client.state() == SessionState::CleanShutdown
    })
    .await;
    let relay = Arc::clone(&pair.relay);
    wait_until("relay clean shutdown", move || {
        relay.state() == SessionState::CleanShutdown
    })
    .await;

    assert!(matches!(
        next_event(&mut pair.client_events).await,
        SessionEvent::Terminated { clean: true }
    ));
    assert!(matches!(
        next_event(&mut pair.relay_events).await,
        SessionEvent::Terminated { clean: true }
    ));
    assert_eq!(registry.active_namespace_count(), 0);
}

#[tokio::test]
async fn repeated_shutdown_calls_are_idempotent() {
    let registry = Arc::new(SessionRegistry::new());
    let mut pair = active_pair(&registry).await;

    for _ in 0..5 {
        pair.client.initiate_clean_shutdown_if_running();
    }
    let client = Arc::clone(&pair.client);
    wait_until("client clean shutdown", move || {
        client.state() == SessionState::CleanShutdown
    })
    .await;
    for _ in 0..5 {
        pair.client.initiate_clean_shutdown_if_running();
    }
    assert_eq!(pair.client.state(), SessionState::CleanShutdown);

    // exactly one termination event despite the repeated calls
    assert!(matches!(
        next_event(&mut pair.client_events).await,
        SessionEvent::Terminated { clean: true }
    ));
    assert!(pair.client_events.try_recv().is_err());
}

#[tokio::test]
async fn simultaneous_shutdown_from_both_sides_stays_clean() {
    let registry = Arc::new(SessionRegistry::new());
    let mut pair = active_pair(&registry).await;

    // both sides decide to hang up before seeing the other's goodbye
    pair.client.initiate_clean_shutdown_if_running();
    pair.relay.initiate_clean_shutdown_if_running();

    let client = Arc::clone(&pair.client);
    wait_until("client clean shutdown", move || {
        client.state() == SessionState::CleanShutdown
    })
    .await;
    let relay = Arc::clone(&pair.relay);
    wait_until("relay clean shutdown", move || {
        relay.state() == SessionState::CleanShutdown
    })
    .await;

    assert!(matches!(
        next_event(&mut pair.client_events).await,
        SessionEvent::Terminated { clean: true }
    ));
    assert!(matches!(
        next_event(&mut pair.relay_events).await,
        SessionEvent::Terminated { clean: true }
    ));
    assert_eq!(registry.active_namespace_count(), 0);
}

#[tokio::test]
async fn write_failure_ends_the_session_uncleanly_without_a_goodbye() {
    let registry = Arc::new(SessionRegistry::new());
    let mut pair = active_pair(&registry).await;

    pair.client_transport.break_writes();
    assert!(pair.client.send_payload(b"lost".to_vec()).is_err());

    assert_eq!(pair.client.state(), SessionState::UncleanShutdown);
    assert!(matches!(
        next_event(&mut pair.client_events).await,
        SessionEvent::Terminated { clean: false }
    ));

    // no goodbye reached the relay; it only sees the connection vanish,
    // so its side ends uncleanly too
    let relay = Arc::clone(&pair.relay);
    wait_until("relay unclean shutdown", move || {
        relay.state() == SessionState::UncleanShutdown
    })
    .await;
    assert!(matches!(
        next_event(&mut pair.relay_events).await,
        SessionEvent::Terminated { clean: false }
    ));
    assert_eq!(registry.active_namespace_count(), 0);
}

#[tokio::test]
async fn shutdown_after_failure_stays_a_no_op() {
    let registry = Arc::new(SessionRegistry::new());
    let pair = active_pair(&registry).await;

    pair.client_transport.break_writes();
    assert!(pair.client.send_payload(b"lost".to_vec()).is_err());
    assert_eq!(pair.client.state(), SessionState::UncleanShutdown);

    pair.client.initiate_clean_shutdown_if_running();
    assert_eq!(pair.client.state(), SessionState::UncleanShutdown);
}

#[tokio::test]
async fn payload_after_shutdown_is_rejected_locally() {
    let registry = Arc::new(SessionRegistry::new());
    let pair = active_pair(&registry).await;

    pair.client.initiate_clean_shutdown_if_running();
    assert!(pair.client.send_payload(b"too late".to_vec()).is_err());
}
