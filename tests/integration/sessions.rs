//! Session lifecycle: handshake, exchanges, prepare caching, failure modes.

use hermod_mysql::protocol::{is_ok_packet, Command};
use hermod_mysql::session::{command_payload, Session, SessionState};
use hermod_mysql::Error;

use crate::{connect_options, server::FakeServer};

async fn connect(server: &FakeServer) -> Session {
    let options = connect_options(server);
    Session::connect(&options, &server.host(), server.port())
        .await
        .expect("connect")
}

#[tokio::test]
async fn handshake_reaches_idle() {
    let server = FakeServer::start().await;
    let session = connect(&server).await;

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.server_version(), crate::server::SERVER_VERSION);
    assert!(session.connection_id() > 0);
    session.quit().await;
}

#[tokio::test]
async fn ping_round_trip() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    assert!(session.try_ping().await);
    assert_eq!(session.state(), SessionState::Idle);
    session.quit().await;
}

#[tokio::test]
async fn query_exchange_returns_ok() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    let reply = session
        .exchange(command_payload(Command::Query, b"SET autocommit = 1"))
        .await
        .expect("query");
    assert!(is_ok_packet(&reply));
    session.quit().await;
}

#[tokio::test]
async fn server_error_leaves_session_usable() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    let err = session
        .exchange(command_payload(Command::Query, b"boom"))
        .await
        .expect_err("server should reject");
    match err {
        Error::Server { code, ref sql_state, .. } => {
            assert_eq!(code, 1064);
            assert_eq!(sql_state, "42000");
        }
        other => panic!("expected server error, got {other:?}"),
    }

    // a server-reported error is not a session fault
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.try_ping().await);
    session.quit().await;
}

#[tokio::test]
async fn disconnect_mid_reply_fails_the_session() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    let err = session
        .exchange(command_payload(Command::Query, b"die"))
        .await
        .expect_err("connection should drop");
    assert!(matches!(err, Error::Disconnected | Error::Io(_)));

    assert_eq!(session.state(), SessionState::Failed);
    assert!(!session.is_usable());
}

#[tokio::test]
async fn second_send_without_reply_is_rejected() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    session
        .send(command_payload(Command::Query, b"SELECT 1"))
        .await
        .expect("send");
    let err = session
        .send(command_payload(Command::Query, b"SELECT 2"))
        .await
        .expect_err("one exchange at a time");
    assert!(matches!(err, Error::CommandInFlight));

    let reply = session.receive_reply().await.expect("reply");
    assert!(is_ok_packet(&reply));
    session.quit().await;
}

#[tokio::test]
async fn prepare_is_cached_per_session() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    let first = session.prepare("SELECT * FROM t WHERE id = ?").await.expect("prepare");
    assert_eq!(first.num_params, 1);
    assert_eq!(first.num_columns, 1);

    let second = session.prepare("SELECT * FROM t WHERE id = ?").await.expect("prepare");
    assert_eq!(second.statement_id, first.statement_id);
    assert_eq!(server.prepare_count(), 1, "second prepare must hit the cache");

    session.prepare("UPDATE t SET v = ? WHERE id = ?").await.expect("prepare");
    assert_eq!(server.prepare_count(), 2);
    assert_eq!(session.statement_cache_len(), 2);
    session.quit().await;
}

#[tokio::test]
async fn reset_flushes_the_statement_cache() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    session.prepare("SELECT ?").await.expect("prepare");
    assert_eq!(session.statement_cache_len(), 1);

    session.reset().await.expect("reset");
    assert_eq!(session.statement_cache_len(), 0);

    // re-preparing goes back to the server
    session.prepare("SELECT ?").await.expect("prepare");
    assert_eq!(server.prepare_count(), 2);
    session.quit().await;
}

#[tokio::test]
async fn select_database_switches_or_reports_unknown() {
    let server = FakeServer::start().await;
    let mut session = connect(&server).await;

    session.select_database("orders").await.expect("switch database");

    let err = session
        .select_database("missing_db")
        .await
        .expect_err("unknown database");
    match err {
        Error::Server { code, .. } => assert_eq!(code, 1049),
        other => panic!("expected server error, got {other:?}"),
    }

    // a rejected switch is a server error, not a session fault
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.try_ping().await);
    session.quit().await;
}

#[tokio::test]
async fn connect_timeout_is_reported() {
    // RFC 5737 TEST-NET address: connect attempts hang
    let options = hermod_mysql::config::ConnectOptions::new("192.0.2.1", "app")
        .connect_timeout(std::time::Duration::from_millis(50));
    let err = Session::connect(&options, "192.0.2.1", 3306)
        .await
        .expect_err("unroutable address");
    assert!(matches!(
        err,
        Error::ConnectTimeout(_) | Error::Connect(_)
    ));
}
