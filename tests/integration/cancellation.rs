//! Side-channel cancellation against a blocked exchange.

use hermod_mysql::protocol::Command;
use hermod_mysql::session::{cancel, command_payload, Session, SessionState};
use hermod_mysql::Error;

use crate::{connect_options, server::FakeServer};

#[tokio::test]
async fn kill_unblocks_a_sleeping_query() {
    let server = FakeServer::start().await;
    let options = connect_options(&server);
    let mut session = Session::connect(&options, &server.host(), server.port())
        .await
        .expect("connect");
    let ticket = session.cancel_ticket();

    session
        .send(command_payload(Command::Query, b"SELECT SLEEP(600)"))
        .await
        .expect("send");

    let cancel_options = options.clone();
    let canceller = tokio::spawn(async move {
        cancel(&ticket, &cancel_options).await;
    });

    let err = session.receive_reply().await.expect_err("query interrupted");
    match err {
        Error::Server { code, .. } => assert_eq!(code, 1317),
        other => panic!("expected interrupted-query error, got {other:?}"),
    }
    canceller.await.expect("canceller");

    assert_eq!(server.kill_count(), 1);
    // an interrupted query is a server error, not a session fault
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.try_ping().await);
    session.quit().await;
}

#[tokio::test]
async fn concurrent_cancels_attempt_the_kill_once() {
    let server = FakeServer::start().await;
    let options = connect_options(&server);
    let mut session = Session::connect(&options, &server.host(), server.port())
        .await
        .expect("connect");

    session
        .send(command_payload(Command::Query, b"SELECT SLEEP(600)"))
        .await
        .expect("send");

    let mut cancellers = Vec::new();
    for _ in 0..2 {
        let ticket = session.cancel_ticket();
        let cancel_options = options.clone();
        cancellers.push(tokio::spawn(async move {
            cancel(&ticket, &cancel_options).await;
        }));
    }

    session.receive_reply().await.expect_err("query interrupted");
    for canceller in cancellers {
        canceller.await.expect("canceller");
    }

    assert_eq!(server.kill_count(), 1, "losing canceller must not re-kill");
    session.quit().await;
}

#[tokio::test]
async fn cancel_after_completion_is_a_noop() {
    let server = FakeServer::start().await;
    let options = connect_options(&server);
    let mut session = Session::connect(&options, &server.host(), server.port())
        .await
        .expect("connect");
    let ticket = session.cancel_ticket();

    session
        .exchange(command_payload(Command::Query, b"SELECT 1"))
        .await
        .expect("query");

    let dialed_before = server.connections_accepted();
    cancel(&ticket, &options).await;

    assert_eq!(server.kill_count(), 0);
    assert_eq!(
        server.connections_accepted(),
        dialed_before,
        "a late cancel must not open a side channel"
    );
    session.quit().await;
}

#[tokio::test]
async fn querying_session_reports_canceling_state() {
    let server = FakeServer::start().await;
    let options = connect_options(&server);
    let mut session = Session::connect(&options, &server.host(), server.port())
        .await
        .expect("connect");
    let ticket = session.cancel_ticket();

    session
        .send(command_payload(Command::Query, b"SELECT SLEEP(600)"))
        .await
        .expect("send");
    assert_eq!(session.state(), SessionState::Querying);

    let cancel_options = options.clone();
    let canceller = tokio::spawn(async move {
        cancel(&ticket, &cancel_options).await;
    });

    // the flag flips the observable state while the exchange is blocked
    loop {
        if session.state() == SessionState::Canceling {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    session.receive_reply().await.expect_err("query interrupted");
    assert_eq!(session.state(), SessionState::Idle);
    canceller.await.expect("canceller");
    session.quit().await;
}
