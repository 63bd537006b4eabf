//! Transaction controller tests against the scripted peer.

mod common;

use std::time::Duration;

use lapwing_client::{ClientError, ConnectionOptions, ReceiverOptions};
use lapwing_types::definitions::conditions;
use lapwing_types::{DeliveryState, DeliveryStateType, ErrorCondition, Message};

const TXN_ID: &[u8] = &[0, 1, 2, 3];

#[tokio::test]
async fn commit_round_trip() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    // Declare: coordinator attach, then the declare transfer.
    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, TXN_ID);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    // Commit sends Discharge(fail=false) with the declared txn-id.
    let commit = session.commit_transaction();
    let peer_script = async {
        let (channel, delivery_id, discharge) = peer.expect_discharge().await;
        assert!(!discharge.fail);
        assert_eq!(discharge.txn_id.as_slice(), TXN_ID);
        peer.accept(channel, delivery_id);
    };
    let (committed, _) = tokio::join!(commit, peer_script);
    committed.unwrap();

    // A second commit without an intervening begin is refused.
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(error, ClientError::TransactionNotActive));
}

#[tokio::test]
async fn rollback_sends_discharge_with_fail() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, TXN_ID);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    let rollback = session.rollback_transaction();
    let peer_script = async {
        let (channel, delivery_id, discharge) = peer.expect_discharge().await;
        assert!(discharge.fail);
        peer.accept(channel, delivery_id);
    };
    let (rolled_back, _) = tokio::join!(rollback, peer_script);
    rolled_back.unwrap();
}

#[tokio::test]
async fn begin_fails_when_coordinator_link_refused() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        let (channel, attach) = peer.expect_attach().await;
        assert!(attach
            .target
            .as_ref()
            .is_some_and(lapwing_types::AttachTarget::is_coordinator));
        peer.reject_attach(
            channel,
            &attach,
            ErrorCondition::new(conditions::NOT_IMPLEMENTED, "CoordinatorLinkRefusal-breadcrumb"),
        );
    };
    let (begun, _) = tokio::join!(begin, peer_script);

    let error = begun.unwrap_err();
    match &error {
        ClientError::TransactionDeclarationFailed { condition, .. } => {
            assert_eq!(
                condition.as_ref().unwrap().condition.as_str(),
                conditions::NOT_IMPLEMENTED
            );
            assert!(error.to_string().contains("CoordinatorLinkRefusal-breadcrumb"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn declare_rejection_fails_begin() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.reject(
            channel,
            delivery_id,
            ErrorCondition::new(conditions::TRANSACTION_UNKNOWN_ID, "no transactions here"),
        );
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    let error = begun.unwrap_err();
    assert!(matches!(
        error,
        ClientError::TransactionDeclarationFailed { .. }
    ));

    // The controller returned to idle; commit has nothing to discharge.
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(error, ClientError::TransactionNotActive));
}

#[tokio::test]
async fn declare_timeout_treats_transaction_as_never_begun() {
    let options = ConnectionOptions {
        request_timeout: Duration::from_millis(60),
        ..common::options()
    };
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(options, &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        // Attach and credit, but never answer the declare.
        let _ = peer.expect_coordinator_attach().await;
        let _ = peer.expect_declare().await;
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    assert!(matches!(
        begun.unwrap_err(),
        ClientError::OperationTimedOut { .. }
    ));

    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(error, ClientError::TransactionNotActive));
}

#[tokio::test]
async fn begin_while_active_is_refused() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, TXN_ID);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    let error = session.begin_transaction().await.unwrap_err();
    assert!(matches!(error, ClientError::IllegalState { .. }));
}

#[tokio::test]
async fn discharge_rejection_reports_rollback() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, TXN_ID);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    let commit = session.commit_transaction();
    let peer_script = async {
        let (channel, delivery_id, _discharge) = peer.expect_discharge().await;
        peer.reject(
            channel,
            delivery_id,
            ErrorCondition::new(conditions::TRANSACTION_ROLLBACK, "work was discarded"),
        );
    };
    let (committed, _) = tokio::join!(commit, peer_script);
    let error = committed.unwrap_err();
    match &error {
        ClientError::TransactionRolledBack { condition, .. } => {
            assert_eq!(
                condition.as_ref().unwrap().condition.as_str(),
                conditions::TRANSACTION_ROLLBACK
            );
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Back to idle: a fresh transaction can be declared.
    let begin = session.begin_transaction();
    let peer_script = async {
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, &[9, 9, 9, 9]);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();
}

#[tokio::test]
async fn receiver_disposition_in_transaction_is_stamped() {
    let (_client, _connection, session, mut peer, _channel) =
        common::connected_with_session(common::options(), &[]).await;

    // Pull-mode receiver with manual accept, as required for
    // transactional consumption.
    let options = ReceiverOptions {
        credit_window: 0,
        auto_accept: false,
        ..ReceiverOptions::default()
    };
    let receiver = session
        .open_receiver_with("txn-queue", options)
        .await
        .unwrap();
    let (link_channel, attach) = peer.expect_attach().await;
    peer.respond_attach(link_channel, &attach);
    receiver.await_open().await.unwrap();

    let begin = session.begin_transaction();
    let peer_script = async {
        let _ = peer.expect_coordinator_attach().await;
        let (channel, delivery_id) = peer.expect_declare().await;
        peer.accept_declare(channel, delivery_id, TXN_ID);
    };
    let (begun, _) = tokio::join!(begin, peer_script);
    begun.unwrap();

    let mut receiver = receiver;
    receiver.add_credit(1).await.unwrap();
    peer.expect_flow().await;
    peer.send_transfer(link_channel, attach.handle, 7, &Message::text("txn-read"));

    let mut delivery = receiver.receive().await.unwrap();
    delivery.accept().await.unwrap();

    let (_, disposition) = peer.expect_disposition().await;
    match disposition.state.unwrap() {
        DeliveryState::Transactional { txn_id, outcome } => {
            assert_eq!(txn_id.as_slice(), TXN_ID);
            assert_eq!(outcome.unwrap().state_type(), DeliveryStateType::Accepted);
        }
        other => panic!("disposition missing transactional stamp: {other}"),
    }
}
