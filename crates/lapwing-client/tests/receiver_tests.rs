//! Receiver credit-window, delivery and disposition tests against the
//! scripted peer.

mod common;

use std::time::Duration;

use lapwing_client::{ClientError, Receiver, ReceiverOptions};
use lapwing_testkit::ScriptedPeer;
use lapwing_types::{DeliveryState, DeliveryStateType, Message, Role};

async fn attached_receiver(
    session: &lapwing_client::Session,
    peer: &mut ScriptedPeer,
    options: ReceiverOptions,
) -> (Receiver, u16, u32) {
    let expect_initial_flow = options.credit_window > 0;
    let receiver = session
        .open_receiver_with("test-queue", options)
        .await
        .unwrap();
    let (channel, attach) = peer.expect_attach().await;
    assert_eq!(attach.role, Role::Receiver);
    peer.respond_attach(channel, &attach);
    if expect_initial_flow {
        peer.expect_flow().await;
    }
    receiver.await_open().await.unwrap();
    (receiver, channel, attach.handle)
}

#[tokio::test]
async fn receive_delivers_in_wire_order_and_auto_accepts() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (mut receiver, channel, handle) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    peer.send_transfer(channel, handle, 0, &Message::text("first"));
    peer.send_transfer(channel, handle, 1, &Message::text("second"));

    let mut delivery = receiver.receive().await.unwrap();
    assert_eq!(delivery.message().unwrap().body_text(), Some("first"));
    let mut delivery = receiver.receive().await.unwrap();
    assert_eq!(delivery.message().unwrap().body_text(), Some("second"));

    // Each consumed delivery triggers an accepted, settled disposition
    // followed by a window top-up.
    let (_, disposition) = peer.expect_disposition().await;
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert_eq!(
        disposition.state.unwrap().state_type(),
        DeliveryStateType::Accepted
    );
    let (_, flow) = peer.expect_flow().await;
    assert_eq!(flow.link_credit, Some(9));

    let (_, disposition) = peer.expect_disposition().await;
    assert_eq!(disposition.first, 1);
    let (_, flow) = peer.expect_flow().await;
    assert_eq!(flow.link_credit, Some(10));
}

#[tokio::test]
async fn pull_mode_with_manual_accept() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let options = ReceiverOptions {
        credit_window: 0,
        auto_accept: false,
        ..ReceiverOptions::default()
    };
    let (mut receiver, channel, handle) = attached_receiver(&session, &mut peer, options).await;

    // No credit until the application grants it.
    receiver.add_credit(1).await.unwrap();
    let (_, flow) = peer.expect_flow().await;
    assert_eq!(flow.link_credit, Some(1));

    peer.send_transfer(channel, handle, 0, &Message::text("pulled"));
    let mut delivery = receiver.receive().await.unwrap();
    assert_eq!(delivery.message().unwrap().body_text(), Some("pulled"));

    // Nothing went out until the explicit disposition.
    delivery.accept().await.unwrap();
    let (_, disposition) = peer.expect_disposition().await;
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert_eq!(
        disposition.state.unwrap().state_type(),
        DeliveryStateType::Accepted
    );
}

#[tokio::test]
async fn receive_timeout_reports_absent() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (mut receiver, _, _) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    let absent = receiver
        .receive_timeout(Duration::from_millis(30))
        .await
        .unwrap();
    assert!(absent.is_none());
}

#[tokio::test]
async fn try_receive_returns_queued_delivery_or_absent() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (mut receiver, channel, handle) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    assert!(receiver.try_receive().unwrap().is_none());

    peer.send_transfer(channel, handle, 0, &Message::text("queued"));
    // Let the delivery cross the driver and dispatcher.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut delivery = receiver.try_receive().unwrap().expect("delivery missing");
    assert_eq!(delivery.message().unwrap().body_text(), Some("queued"));
}

#[tokio::test]
async fn rejected_disposition_carries_condition() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let options = ReceiverOptions {
        credit_window: 0,
        auto_accept: false,
        ..ReceiverOptions::default()
    };
    let (mut receiver, channel, handle) = attached_receiver(&session, &mut peer, options).await;

    receiver.add_credit(1).await.unwrap();
    peer.expect_flow().await;
    peer.send_transfer(channel, handle, 0, &Message::text("bad"));
    let mut delivery = receiver.receive().await.unwrap();
    delivery
        .disposition(
            DeliveryState::rejected(Some(lapwing_types::ErrorCondition::new(
                "amqp:decode-error",
                "unreadable payload",
            ))),
            true,
        )
        .await
        .unwrap();

    let (_, disposition) = peer.expect_disposition().await;
    match disposition.state.unwrap() {
        DeliveryState::Rejected { error } => {
            assert_eq!(error.unwrap().description.as_deref(), Some("unreadable payload"));
        }
        other => panic!("unexpected state {other}"),
    }
}

#[tokio::test]
async fn dynamic_receiver_exposes_generated_address() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let receiver = session
        .open_dynamic_receiver(Default::default(), ReceiverOptions::default())
        .await
        .unwrap();
    let (channel, attach) = peer.expect_attach().await;
    let source = attach.source.as_ref().unwrap();
    assert!(source.dynamic);
    assert_eq!(source.address, None);
    peer.respond_attach_dynamic(channel, &attach, "amq.dyn.42");
    peer.expect_flow().await;

    receiver.await_open().await.unwrap();
    assert_eq!(receiver.address().as_deref(), Some("amq.dyn.42"));
}

#[tokio::test]
async fn remote_detach_fails_blocked_receive() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (mut receiver, channel, handle) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    let receive = receiver.receive();
    let peer_script = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.send_detach(
            channel,
            handle,
            Some(lapwing_types::ErrorCondition::new(
                "amqp:resource-deleted",
                "queue removed",
            )),
        );
        peer.expect_detach().await;
    };
    let (result, _) = tokio::join!(receive, peer_script);
    match result.unwrap_err() {
        ClientError::LinkRemotelyClosed { condition, .. } => {
            assert_eq!(
                condition.unwrap().condition.as_str(),
                "amqp:resource-deleted"
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn drain_completes_when_sender_answers() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (receiver, channel, handle) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    let drain = receiver.drain();
    let peer_script = async {
        let (_, flow) = peer.expect_flow().await;
        assert!(flow.drain);
        // Sender reports all credit used up.
        peer.send_frame(lapwing_types::Frame::amqp(
            channel,
            lapwing_types::Performative::Flow(lapwing_types::Flow {
                handle: Some(handle),
                delivery_count: Some(flow.link_credit.unwrap_or(0)),
                link_credit: Some(0),
                drain: true,
                ..lapwing_types::Flow::default()
            }),
        ));
    };
    let (result, _) = tokio::join!(drain, peer_script);
    result.unwrap();
}

#[tokio::test]
async fn multi_frame_delivery_reassembles() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;
    let (mut receiver, channel, handle) =
        attached_receiver(&session, &mut peer, ReceiverOptions::default()).await;

    let payload = Message::text("split across frames").encode().unwrap();
    let (head, tail) = payload.split_at(payload.len() / 2);
    peer.send_frame(lapwing_types::Frame::amqp(
        channel,
        lapwing_types::Performative::Transfer(lapwing_types::Transfer {
            handle,
            delivery_id: Some(0),
            delivery_tag: Some(lapwing_types::DeliveryTag::from_counter(0)),
            message_format: Some(0),
            settled: Some(false),
            more: true,
            state: None,
            aborted: false,
            payload: bytes::Bytes::copy_from_slice(head),
        }),
    ));
    peer.send_frame(lapwing_types::Frame::amqp(
        channel,
        lapwing_types::Performative::Transfer(lapwing_types::Transfer {
            handle,
            delivery_id: None,
            delivery_tag: None,
            message_format: None,
            settled: None,
            more: false,
            state: None,
            aborted: false,
            payload: bytes::Bytes::copy_from_slice(tail),
        }),
    ));

    let mut delivery = receiver.receive().await.unwrap();
    assert_eq!(
        delivery.message().unwrap().body_text(),
        Some("split across frames")
    );
}
