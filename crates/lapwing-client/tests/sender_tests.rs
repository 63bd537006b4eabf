//! Sender credit, timeout and settlement tests against the scripted peer.

mod common;

use std::time::Duration;

use lapwing_client::{ClientError, ConnectionOptions, DeliveryMode, Sender, SenderOptions};
use lapwing_testkit::ScriptedPeer;
use lapwing_types::{DeliveryState, DeliveryStateType, Message, TxnId};

async fn attached_sender(
    session: &lapwing_client::Session,
    peer: &mut ScriptedPeer,
    options: SenderOptions,
) -> (Sender, u16, u32) {
    let sender = session.open_sender_with("test-queue", options).await.unwrap();
    let (channel, attach) = peer.expect_attach().await;
    peer.respond_attach(channel, &attach);
    sender.await_open().await.unwrap();
    (sender, channel, attach.handle)
}

#[tokio::test]
async fn send_times_out_without_credit() {
    let options = ConnectionOptions {
        send_timeout: Duration::from_millis(25),
        ..common::options()
    };
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(options, &[]).await;
    let (sender, _, _) = attached_sender(&session, &mut peer, SenderOptions::default()).await;

    // The peer never grants credit.
    let error = sender.send(&Message::text("Hello World")).await.unwrap_err();
    assert!(matches!(error, ClientError::SendTimedOut { .. }));

    // try_send reports the lack of credit without an error.
    let absent = sender.try_send(&Message::text("Hello World")).await.unwrap();
    assert!(absent.is_none());
}

#[tokio::test]
async fn send_completes_when_credit_arrives_late() {
    let options = ConnectionOptions {
        send_timeout: Duration::from_millis(200),
        ..common::options()
    };
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(options, &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;

    let hello_message = Message::text("Hello World");
    let send = sender.send(&hello_message);
    let peer_script = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        peer.send_flow(channel, handle, 1);
        let (_, transfer) = peer.expect_transfer().await;
        assert!(!transfer.payload.is_empty());
        transfer
    };
    let (tracker, transfer) = tokio::join!(send, peer_script);
    tracker.unwrap();
    assert_eq!(transfer.delivery_tag.unwrap().as_slice(), &[0]);
}

#[tokio::test]
async fn auto_settle_on_remote_accept() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;

    peer.send_flow(channel, handle, 10);
    let mut tracker = sender.send(&Message::text("Hello World")).await.unwrap();
    let (_, transfer) = peer.expect_transfer().await;
    assert_eq!(transfer.settled, Some(false));

    peer.accept(channel, transfer.delivery_id.unwrap());
    tracker.settlement().await.unwrap();
    assert_eq!(
        tracker.remote_state().unwrap().state_type(),
        DeliveryStateType::Accepted
    );
    assert!(tracker.remote_settled());
    assert!(tracker.settled());
}

#[tokio::test]
async fn at_most_once_sends_pre_settled() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let options = SenderOptions {
        delivery_mode: DeliveryMode::AtMostOnce,
        ..SenderOptions::default()
    };
    let (sender, channel, handle) = attached_sender(&session, &mut peer, options).await;

    peer.send_flow(channel, handle, 1);
    // Wait for credit to land before sending.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut tracker = sender.send(&Message::text("fire-and-forget")).await.unwrap();
    let (_, transfer) = peer.expect_transfer().await;
    assert_eq!(transfer.settled, Some(true));

    // Settlement is immediate for pre-settled deliveries.
    tracker.settlement().await.unwrap();
    assert!(tracker.settled());
}

#[tokio::test]
async fn credit_decrements_per_send_and_blocks_at_zero() {
    let options = ConnectionOptions {
        send_timeout: Duration::from_millis(40),
        ..common::options()
    };
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(options, &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;

    peer.send_flow(channel, handle, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Two sends succeed on two credits, tags 0 and 1.
    sender.send(&Message::text("first")).await.unwrap();
    sender.send(&Message::text("second")).await.unwrap();
    let (_, first) = peer.expect_transfer().await;
    let (_, second) = peer.expect_transfer().await;
    assert_eq!(first.delivery_tag.unwrap().as_slice(), &[0]);
    assert_eq!(second.delivery_tag.unwrap().as_slice(), &[1]);

    // The third finds no credit and times out; no transfer is emitted.
    let error = sender.send(&Message::text("third")).await.unwrap_err();
    assert!(matches!(error, ClientError::SendTimedOut { .. }));
}

#[tokio::test]
async fn delivery_modified_surfaces_on_settlement() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;

    peer.send_flow(channel, handle, 1);
    let mut tracker = sender.send(&Message::text("doomed")).await.unwrap();
    let (_, transfer) = peer.expect_transfer().await;

    peer.send_disposition(
        channel,
        transfer.delivery_id.unwrap(),
        true,
        DeliveryState::Modified {
            delivery_failed: true,
            undeliverable_here: true,
            message_annotations: Default::default(),
        },
    );

    let error = tracker.settlement().await.unwrap_err();
    match error {
        ClientError::DeliveryModified {
            delivery_failed,
            undeliverable_here,
        } => {
            assert!(delivery_failed);
            assert!(undeliverable_here);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn connection_drop_fails_blocked_send() {
    let options = ConnectionOptions {
        send_timeout: Duration::from_millis(500),
        ..common::options()
    };
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(options, &[]).await;
    let (sender, _, _) = attached_sender(&session, &mut peer, SenderOptions::default()).await;

    let stranded_message = Message::text("stranded");
    let send = sender.send(&stranded_message);
    let peer_script = async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        peer.drop_transport();
    };
    let (result, _) = tokio::join!(send, peer_script);
    assert!(matches!(
        result.unwrap_err(),
        ClientError::ConnectionRemotelyClosed { .. }
    ));

    // Later attempts observe the same terminal cause.
    let error = sender.try_send(&Message::text("after")).await.unwrap_err();
    assert!(matches!(error, ClientError::ConnectionRemotelyClosed { .. }));
}

#[tokio::test]
async fn remote_detach_fails_sender_with_condition() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;

    peer.send_detach(
        channel,
        handle,
        Some(lapwing_types::ErrorCondition::new(
            "amqp:resource-deleted",
            "queue removed",
        )),
    );
    peer.expect_detach().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let error = sender.send(&Message::text("too late")).await.unwrap_err();
    match error {
        ClientError::LinkRemotelyClosed { condition, .. } => {
            assert_eq!(condition.unwrap().condition.as_str(), "amqp:resource-deleted");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn transfer_in_transaction_carries_txn_id() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (sender, channel, handle) =
        attached_sender(&session, &mut peer, SenderOptions::default()).await;
    peer.send_flow(channel, handle, 5);

    // Declare a transaction with txn-id [0,1,2,3].
    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (declare_channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(declare_channel, delivery_id, &[0, 1, 2, 3]);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    let mut tracker = sender.send(&Message::text("txn-payload")).await.unwrap();
    let (_, transfer) = peer.expect_transfer().await;
    match transfer.state {
        Some(DeliveryState::Transactional { ref txn_id, .. }) => {
            assert_eq!(txn_id.as_slice(), &[0, 1, 2, 3]);
        }
        other => panic!("transfer missing transactional state: {other:?}"),
    }

    // Remote settles with a transactional accepted outcome.
    peer.send_disposition(
        channel,
        transfer.delivery_id.unwrap(),
        true,
        DeliveryState::transactional(
            TxnId::from_slice(&[0, 1, 2, 3]),
            Some(DeliveryState::Accepted),
        ),
    );
    tracker.settlement().await.unwrap();
    assert_eq!(
        tracker.remote_state().unwrap().state_type(),
        DeliveryStateType::Transactional
    );
    assert!(tracker.settled());
}
