//! Connection lifecycle tests against the scripted peer.

mod common;

use std::time::Duration;

use lapwing_client::{Client, ClientError, ConnectionOptions};
use lapwing_testkit::memory_pair;
use lapwing_types::definitions::conditions;
use lapwing_types::{ErrorCondition, Role};

#[tokio::test]
async fn open_sender_then_orderly_shutdown() {
    let (_client, connection, session, mut peer, channel) =
        common::connected_with_session(common::options(), &[]).await;

    // Attach a sender to the named queue.
    let sender = session.open_sender("test-queue").await.unwrap();
    let (attach_channel, attach) = peer.expect_attach().await;
    assert_eq!(attach_channel, channel);
    assert_eq!(attach.role, Role::Sender);
    let target = attach.target.as_ref().unwrap().as_node().unwrap();
    assert_eq!(target.address.as_deref(), Some("test-queue"));
    peer.respond_attach(attach_channel, &attach);
    sender.await_open().await.unwrap();

    // Detach closed=true, answered by the peer.
    let (close_result, _) = tokio::join!(sender.close(), async {
        let (detach_channel, detach) = peer.expect_detach().await;
        assert!(detach.closed);
        peer.respond_detach(detach_channel, detach.handle);
    });
    close_result.unwrap();

    // Close round-trips.
    let (close_result, _) = tokio::join!(connection.close(), async {
        peer.expect_close().await;
        peer.respond_close();
    });
    close_result.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let (_client, connection, mut peer) = common::connected(common::options(), &[]).await;

    let first = connection.close();
    let second = connection.close();
    let (first, second, _) = tokio::join!(first, second, async {
        peer.expect_close().await;
        peer.respond_close();
    });
    first.unwrap();
    second.unwrap();

    // A third close after completion also reports the same outcome.
    connection.close().await.unwrap();
    assert!(connection.is_closed());
}

#[tokio::test]
async fn remote_close_fails_pending_operations() {
    let (_client, connection, mut peer) = common::connected(common::options(), &[]).await;

    peer.send_close(Some(ErrorCondition::new(
        conditions::CONNECTION_FORCED,
        "maintenance window",
    )));
    peer.expect_close().await;

    // Give the driver a moment to ingest the close.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let error = connection.open_session().await.unwrap_err();
    match &error {
        ClientError::ConnectionRemotelyClosed { condition, .. } => {
            let condition = condition.as_ref().expect("condition missing");
            assert_eq!(condition.condition.as_str(), conditions::CONNECTION_FORCED);
            assert!(error.to_string().contains("maintenance window"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn open_times_out_without_remote_open() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let options = ConnectionOptions {
        open_timeout: Duration::from_millis(50),
        ..common::options()
    };
    let connection = client.connect("test-host", 5672, Box::new(transport), options);
    peer.expect_open().await;

    let error = connection.await_open().await.unwrap_err();
    assert!(matches!(error, ClientError::OperationTimedOut { .. }));
}

#[tokio::test]
async fn sasl_anonymous_handshake() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    // Default options leave SASL enabled with no credentials.
    let connection = client.connect(
        "test-host",
        5672,
        Box::new(transport),
        ConnectionOptions::default(),
    );

    peer.offer_sasl_anonymous().await;
    peer.expect_open().await;
    peer.respond_open(&[]);
    connection.await_open().await.unwrap();
}

#[tokio::test]
async fn sasl_refusal_fails_the_connection() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let options = ConnectionOptions {
        user: Some("guest".to_string()),
        password: Some("wrong".to_string()),
        ..ConnectionOptions::default()
    };
    let connection = client.connect("test-host", 5672, Box::new(transport), options);

    peer.refuse_sasl().await;
    let error = connection.await_open().await.unwrap_err();
    assert!(matches!(error, ClientError::Io { .. }));
}

#[tokio::test]
async fn remote_open_exposes_capabilities_and_properties() {
    let (_client, connection, _peer) =
        common::connected(common::options(), &["ANONYMOUS-RELAY"]).await;

    let offered = connection.offered_capabilities().await.unwrap();
    assert!(offered.iter().any(|s| s.as_str() == "ANONYMOUS-RELAY"));
    assert!(connection.properties().await.unwrap().is_empty());
}

#[tokio::test]
async fn anonymous_sender_refused_without_relay_capability() {
    // The peer's Open omits ANONYMOUS-RELAY.
    let (_client, _connection, session, _peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let error = session.open_anonymous_sender().await.unwrap_err();
    assert!(matches!(error, ClientError::UnsupportedOperation { .. }));
}

#[tokio::test]
async fn anonymous_sender_waits_for_capabilities() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let connection = client.connect("test-host", 5672, Box::new(transport), common::options());

    // Session and anonymous sender requested before the remote Open.
    let session = connection.open_session().await.unwrap();
    let sender = session.open_anonymous_sender().await.unwrap();

    peer.expect_open().await;
    peer.respond_open(&["ANONYMOUS-RELAY"]);
    let (channel, _begin) = peer.expect_begin().await;
    peer.respond_begin(channel);

    // The held attach goes out once capabilities are known, with no
    // target address.
    let (attach_channel, attach) = peer.expect_attach().await;
    let target = attach.target.as_ref().unwrap().as_node().unwrap();
    assert_eq!(target.address, None);
    peer.respond_attach(attach_channel, &attach);

    sender.await_open().await.unwrap();
}

#[tokio::test]
async fn anonymous_sender_pending_fails_when_relay_missing() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let connection = client.connect("test-host", 5672, Box::new(transport), common::options());

    let session = connection.open_session().await.unwrap();
    let sender = session.open_anonymous_sender().await.unwrap();

    peer.expect_open().await;
    peer.respond_open(&[]);

    let error = sender.await_open().await.unwrap_err();
    assert!(matches!(error, ClientError::UnsupportedOperation { .. }));
}

#[tokio::test]
async fn connection_send_uses_anonymous_relay() {
    let (_client, connection, mut peer) =
        common::connected(common::options(), &["ANONYMOUS-RELAY"]).await;

    let routed_message = lapwing_types::Message::text("routed").with_to("other-queue");
    let send = connection.send(&routed_message);
    let peer_script = async {
        // Lazily created root session, then the anonymous sender.
        let (channel, _begin) = peer.expect_begin().await;
        peer.respond_begin(channel);
        let (attach_channel, attach) = peer.expect_attach().await;
        let target = attach.target.as_ref().unwrap().as_node().unwrap();
        assert_eq!(target.address, None);
        peer.respond_attach(attach_channel, &attach);
        peer.send_flow(attach_channel, attach.handle, 5);
        let (transfer_channel, transfer) = peer.expect_transfer().await;
        peer.accept(transfer_channel, transfer.delivery_id.unwrap());
    };
    let (tracker, _) = tokio::join!(send, peer_script);
    let mut tracker = tracker.unwrap();
    tracker.settlement().await.unwrap();
}

#[tokio::test]
async fn client_close_closes_every_connection() {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let connection = client.connect("test-host", 5672, Box::new(transport), common::options());
    peer.expect_open().await;
    peer.respond_open(&[]);
    connection.await_open().await.unwrap();

    let (_, _) = tokio::join!(client.close(), async {
        peer.expect_close().await;
        peer.respond_close();
    });
    assert!(connection.is_closed());
}

#[tokio::test]
async fn reconnect_reestablishes_sessions() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let (transport, mut peers) = lapwing_testkit::memory_pair_series(2);
    let mut second = peers.pop().unwrap();
    let mut first = peers.pop().unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let connects_seen = Arc::clone(&connects);
    let options = ConnectionOptions {
        reconnect: lapwing_client::ReconnectOptions {
            enabled: true,
            hosts: Vec::new(),
            max_attempts: 2,
            delay: Duration::from_millis(5),
        },
        connected_handler: Some(Arc::new(move |event| {
            if matches!(event, lapwing_client::ConnectionEvent::Connected { .. }) {
                connects_seen.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..common::options()
    };

    let client = Client::new();
    let connection = client.connect("test-host", 5672, Box::new(transport), options);
    first.expect_open().await;
    first.respond_open(&[]);
    connection.await_open().await.unwrap();

    let session = connection.open_session().await.unwrap();
    let (channel, _) = first.expect_begin().await;
    first.respond_begin(channel);
    session.await_open().await.unwrap();

    // The transport drops; the driver walks back and re-establishes,
    // replaying the session's Begin.
    first.drop_transport();
    second.expect_open().await;
    second.respond_open(&[]);
    let (channel, _) = second.expect_begin().await;
    second.respond_begin(channel);

    // The surviving session keeps working on the new transport.
    let sender = session.open_sender("after-reconnect").await.unwrap();
    let (attach_channel, attach) = second.expect_attach().await;
    second.respond_attach(attach_channel, &attach);
    sender.await_open().await.unwrap();

    // Handler callbacks run on the dispatch executor; give it a beat.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn session_remote_end_closes_children() {
    let (_client, _connection, session, mut peer, channel) =
        common::connected_with_session(common::options(), &[]).await;

    let mut receiver = session.open_receiver("inbox").await.unwrap();
    let (attach_channel, attach) = peer.expect_attach().await;
    peer.respond_attach(attach_channel, &attach);
    peer.expect_flow().await;
    receiver.await_open().await.unwrap();

    peer.send_end(
        channel,
        Some(ErrorCondition::new(conditions::INTERNAL_ERROR, "forced end")),
    );
    peer.expect_end().await;

    let error = receiver.receive().await.unwrap_err();
    match error {
        ClientError::SessionRemotelyClosed { condition, .. } => {
            assert_eq!(
                condition.unwrap().condition.as_str(),
                conditions::INTERNAL_ERROR
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
}
