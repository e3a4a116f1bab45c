//! Pool bounds, recycling, and invalidation.

use std::time::Duration;

use hermod_mysql::config::PoolOptions;
use hermod_mysql::pool::Pool;
use hermod_mysql::protocol::Command;
use hermod_mysql::session::command_payload;
use hermod_mysql::Error;

use crate::{connect_options, server::FakeServer};

#[tokio::test]
async fn concurrent_acquires_respect_the_bound() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default().max_size(4));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut session = pool.acquire().await.expect("acquire");
            session
                .exchange(command_payload(Command::Query, b"delay"))
                .await
                .expect("query");
            session.release().await;
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    assert!(
        server.connections_accepted() <= 4,
        "dialed {} connections with max_size 4",
        server.connections_accepted()
    );
}

#[tokio::test]
async fn released_session_is_reused_warmest_first() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let session = pool.acquire().await.expect("acquire");
    let id = session.id();
    session.release().await;
    assert_eq!(pool.idle_count(), 1);

    let session = pool.acquire().await.expect("acquire");
    assert_eq!(session.id(), id);
    session.release().await;
}

#[tokio::test]
async fn full_pool_times_out_then_hands_back_the_same_session() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default().max_size(1));

    let holder = pool.acquire().await.expect("acquire");
    let held_id = holder.id();

    let err = pool
        .acquire_timeout(Duration::from_millis(50))
        .await
        .expect_err("pool is full");
    match err {
        Error::PoolTimeout { pool_full } => assert!(pool_full),
        other => panic!("expected pool timeout, got {other:?}"),
    }

    holder.release().await;

    let session = pool.acquire().await.expect("acquire after release");
    assert_eq!(session.id(), held_id);
    session.release().await;
}

#[tokio::test]
async fn idle_session_past_timeout_is_not_reused() {
    let server = FakeServer::start().await;
    let pool = Pool::new(
        connect_options(&server),
        PoolOptions::default().idle_timeout(Duration::from_millis(50)),
    );

    let session = pool.acquire().await.expect("acquire");
    let stale_id = session.id();
    session.release().await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let session = pool.acquire().await.expect("acquire");
    assert_ne!(session.id(), stale_id, "stale idle session must be discarded");
    session.release().await;
}

#[tokio::test]
async fn session_past_max_lifetime_is_not_requeued() {
    let server = FakeServer::start().await;
    let pool = Pool::new(
        connect_options(&server),
        PoolOptions::default().max_lifetime(Duration::from_millis(50)),
    );

    let session = pool.acquire().await.expect("acquire");
    let old_id = session.id();
    tokio::time::sleep(Duration::from_millis(80)).await;
    session.release().await;
    assert_eq!(pool.idle_count(), 0);

    let session = pool.acquire().await.expect("acquire");
    assert_ne!(session.id(), old_id);
    session.release().await;
}

#[tokio::test]
async fn failed_session_is_not_requeued() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let mut session = pool.acquire().await.expect("acquire");
    let failed_id = session.id();
    session
        .exchange(command_payload(Command::Query, b"die"))
        .await
        .expect_err("connection drops");
    session.release().await;
    assert_eq!(pool.idle_count(), 0);

    let session = pool.acquire().await.expect("acquire");
    assert_ne!(session.id(), failed_id);
    session.release().await;
}

#[tokio::test]
async fn clear_invalidates_idle_and_leased_sessions() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let leased = pool.acquire().await.expect("acquire");
    let leased_id = leased.id();

    let parked = pool.acquire().await.expect("acquire");
    let parked_id = parked.id();
    parked.release().await;
    assert_eq!(pool.idle_count(), 1);

    pool.clear();
    assert_eq!(pool.idle_count(), 0);

    // the leased session is discarded on return, not requeued
    leased.release().await;
    assert_eq!(pool.idle_count(), 0);

    let fresh = pool.acquire().await.expect("acquire");
    assert_ne!(fresh.id(), leased_id);
    assert_ne!(fresh.id(), parked_id);
    fresh.release().await;
}

#[tokio::test]
async fn closed_pool_rejects_acquires() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let session = pool.acquire().await.expect("acquire");
    session.release().await;

    pool.close();
    assert!(pool.is_closed());
    assert_eq!(pool.idle_count(), 0);

    let err = pool.acquire().await.expect_err("pool closed");
    assert!(matches!(err, Error::PoolClosed));
}

#[tokio::test]
async fn dropped_guard_returns_the_session_in_the_background() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let session = pool.acquire().await.expect("acquire");
    let id = session.id();
    drop(session);

    // the return runs on a spawned task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.idle_count(), 1);

    let session = pool.acquire().await.expect("acquire");
    assert_eq!(session.id(), id);
    session.release().await;
}

#[tokio::test]
async fn leased_guard_is_debug_printable() {
    let server = FakeServer::start().await;
    let pool = Pool::new(connect_options(&server), PoolOptions::default());

    let session = pool.acquire().await.expect("acquire");
    let rendered = format!("{session:?}");
    assert!(rendered.contains("Session"), "got {rendered}");
    assert!(rendered.contains("Idle"), "got {rendered}");
    session.release().await;
}

#[tokio::test]
async fn reaper_tops_up_to_min_size() {
    let server = FakeServer::start().await;
    let _pool = Pool::new(
        connect_options(&server),
        PoolOptions::default()
            .min_size(2)
            .reap_interval(Duration::from_millis(30)),
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        server.connections_accepted() >= 2,
        "reaper should have dialed min_size sessions"
    );
    assert_eq!(_pool.idle_count(), 2);
}
