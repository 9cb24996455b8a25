//! Connection pool integration tests against the in-memory driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slonik_driver::DriverError;
use slonik_pool::{Pool, PoolConfig, PoolError, PoolLifecycle};
use slonik_testing::{MockDriver, command_result, init_tracing};

fn config() -> PoolConfig {
    PoolConfig::new()
        .idle_timeout(None)
        .graceful_termination_timeout(Some(Duration::from_secs(2)))
}

fn pool(driver: &MockDriver, config: PoolConfig) -> Pool {
    Pool::new(Arc::new(driver.clone()), config).unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_idle_connection_is_reused() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    conn.release().await;

    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.acquired, 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);
    assert_eq!(driver.clients_created(), 1);
    conn.release().await;

    let metrics = pool.metrics();
    assert_eq!(metrics.connections_created, 1);
    assert_eq!(metrics.checkouts_successful, 2);
}

#[tokio::test]
async fn test_max_connections_bounds_checkouts() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(2));

    let first = pool.acquire().await.unwrap();
    let first_id = first.id();
    let _second = pool.acquire().await.unwrap();

    let third = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });

    eventually("third caller to queue", || pool.status().waiting_clients == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!third.is_finished());
    assert_eq!(driver.clients_created(), 2);
    assert!(pool.status().is_at_capacity());

    first.release().await;
    let conn = third.await.unwrap().unwrap();
    assert_eq!(conn.id(), first_id);

    // Handed over directly; it never became idle.
    let status = pool.status();
    assert_eq!(status.idle, 0);
    assert_eq!(status.acquired, 2);
    assert_eq!(status.waiting_clients, 0);
    assert_eq!(pool.metrics().checkouts_waited, 1);
}

#[tokio::test]
async fn test_waiters_are_served_in_order() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let task_pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let conn = task_pool.acquire().await.unwrap();
            order.lock().push(i);
            conn.release().await;
        }));
        eventually("caller to queue", || pool.status().waiting_clients == i + 1).await;
    }

    held.release().await;
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert_eq!(driver.clients_created(), 1);
}

#[tokio::test]
async fn test_creation_failure_releases_reservation() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(1));

    driver.fail_next_connect(DriverError::io("connection refused"));
    let error = pool.acquire().await.unwrap_err();
    assert!(matches!(error, PoolError::Driver(_)));

    let status = pool.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.total(), 0);

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(pool.metrics().checkouts_failed, 1);
}

#[tokio::test]
async fn test_cancelled_acquire_keeps_capacity() {
    let driver = MockDriver::new();
    let pool = pool(
        &driver,
        config()
            .max_connections(1)
            .connection_timeout(None)
            .graceful_termination_timeout(None),
    );
    driver.pause_connections();

    let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(cancelled.is_err());
    driver.resume_connections();

    // The establishment finishes on its own and parks the connection.
    eventually("connection to become idle", || {
        let status = pool.status();
        status.pending == 0 && status.idle == 1
    })
    .await;

    let conn = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
        .await
        .expect("capacity lost after cancelled acquire")
        .unwrap();
    conn.release().await;
    assert_eq!(driver.clients_created(), 1);

    tokio::time::timeout(Duration::from_secs(1), pool.end())
        .await
        .expect("end() did not settle");
    assert!(pool.is_ended());
}

#[tokio::test]
async fn test_abandoned_waiter_is_not_counted() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(1));
    let held = pool.acquire().await.unwrap();

    let gave_up = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(gave_up.is_err());
    assert_eq!(pool.status().waiting_clients, 0);

    held.release().await;
    assert_eq!(pool.status().idle, 1);
    pool.end().await;
    assert!(pool.is_ended());
}

#[tokio::test]
async fn test_connection_timeout() {
    let driver = MockDriver::new();
    driver.set_connect_delay(Some(Duration::from_millis(500)));
    let pool = pool(
        &driver,
        config().connection_timeout(Some(Duration::from_millis(20))),
    );

    let error = pool.acquire().await.unwrap_err();
    assert!(matches!(error, PoolError::ConnectionTimeout(_)));
    assert_eq!(pool.status().pending, 0);
}

#[tokio::test]
async fn test_reset_statement_runs_on_release() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().reset_statement("DISCARD ALL"));

    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    assert_eq!(driver.sql_log(), vec!["DISCARD ALL"]);
    assert_eq!(pool.status().idle, 1);
    assert_eq!(pool.metrics().resets_performed, 1);
}

#[tokio::test]
async fn test_failed_reset_destroys_connection() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql == "DISCARD ALL" {
            Err(DriverError::server("XX000", "reset failed"))
        } else {
            Ok(command_result(sql))
        }
    });
    let pool = pool(&driver, config().reset_statement("DISCARD ALL"));

    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    assert_eq!(driver.clients_destroyed(), 1);
    assert_eq!(pool.status().total(), 0);
    assert_eq!(pool.metrics().resets_failed, 1);
}

#[tokio::test]
async fn test_destroy_replenishes_to_minimum() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().min_connections(1).max_connections(2));

    let conn = pool.acquire().await.unwrap();
    conn.destroy().await;

    eventually("replacement connection", || pool.status().idle == 1).await;
    assert_eq!(driver.clients_created(), 2);
    assert_eq!(driver.clients_destroyed(), 1);
}

#[tokio::test]
async fn test_no_replenishment_while_ending() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().min_connections(1).max_connections(2));

    let conn = pool.acquire().await.unwrap();
    let end = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });
    eventually("pool to start ending", || pool.is_ending()).await;

    conn.destroy().await;
    end.await.unwrap();

    assert!(pool.is_ended());
    assert_eq!(driver.clients_created(), 1);
    assert_eq!(pool.status().total(), 0);
}

#[tokio::test]
async fn test_destroy_serves_waiting_caller() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(1));

    let conn = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    eventually("caller to queue", || pool.status().waiting_clients == 1).await;

    conn.destroy().await;
    let replacement = waiter.await.unwrap().unwrap();
    assert_eq!(driver.clients_created(), 2);
    replacement.release().await;
}

#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let driver = MockDriver::new();
    let pool = pool(
        &driver,
        config().idle_timeout(Some(Duration::from_millis(20))),
    );

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(pool.status().idle, 1);

    eventually("idle connection to close", || pool.status().idle == 0).await;
    assert_eq!(driver.clients_destroyed(), 1);
}

#[tokio::test]
async fn test_idle_timeout_keeps_minimum() {
    let driver = MockDriver::new();
    let pool = pool(
        &driver,
        config()
            .min_connections(1)
            .idle_timeout(Some(Duration::from_millis(10))),
    );

    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(pool.status().idle, 1);
    assert_eq!(driver.clients_destroyed(), 0);
}

#[tokio::test]
async fn test_dropped_handle_is_released() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let conn = pool.acquire().await.unwrap();
    drop(conn);

    eventually("dropped connection to return", || pool.status().idle == 1).await;
}

#[tokio::test]
async fn test_end_waits_for_pending_establishment_and_queue() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().max_connections(1));
    driver.pause_connections();

    let checkout = |pool: Pool| async move {
        let conn = pool.acquire().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.release().await;
        Ok::<_, PoolError>(())
    };

    let first = tokio::spawn(checkout(pool.clone()));
    eventually("establishment to start", || pool.status().pending == 1).await;
    let second = tokio::spawn(checkout(pool.clone()));
    eventually("caller to queue", || pool.status().waiting_clients == 1).await;

    let end = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });
    eventually("pool to start ending", || pool.is_ending()).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!end.is_finished());
    assert!(matches!(
        pool.acquire().await.unwrap_err(),
        PoolError::PoolTerminating
    ));

    driver.resume_connections();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    end.await.unwrap();

    assert_eq!(pool.lifecycle(), PoolLifecycle::Ended);
    assert_eq!(driver.clients_created(), 1);
    assert_eq!(driver.clients_destroyed(), 1);
    assert!(matches!(
        pool.acquire().await.unwrap_err(),
        PoolError::PoolEnded
    ));
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());
    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    tokio::join!(pool.end(), pool.end());
    pool.end().await;

    assert!(pool.is_ended());
    assert_eq!(driver.clients_destroyed(), 1);
}

#[tokio::test]
async fn test_end_closes_checked_out_connection_on_release() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let conn = pool.acquire().await.unwrap();
    let end = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });
    eventually("pool to start ending", || pool.is_ending()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!end.is_finished());

    conn.release().await;
    end.await.unwrap();

    assert!(pool.is_ended());
    assert_eq!(driver.clients_destroyed(), 1);
}

#[tokio::test]
async fn test_graceful_termination_timeout_forces_shutdown() {
    init_tracing();
    let driver = MockDriver::new();
    let pool = pool(
        &driver,
        config()
            .max_connections(1)
            .graceful_termination_timeout(Some(Duration::from_millis(50))),
    );

    let held = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    eventually("caller to queue", || pool.status().waiting_clients == 1).await;

    pool.end().await;

    assert!(pool.is_ended());
    assert!(matches!(
        waiter.await.unwrap().unwrap_err(),
        PoolError::PoolEnded
    ));
    assert_eq!(driver.clients_destroyed(), 1);

    // Returning a connection after a forced shutdown is harmless.
    held.release().await;
    assert_eq!(pool.status().total(), 0);
}

#[tokio::test]
async fn test_session_settings_forwarded() {
    let driver = MockDriver::new();
    let session = slonik_driver::SessionSettings {
        statement_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let pool = pool(&driver, config().session(session.clone()));

    pool.acquire().await.unwrap().release().await;
    assert_eq!(driver.session_settings(), vec![session]);
}

#[test]
fn test_invalid_config_rejected() {
    let driver = MockDriver::new();
    let result = Pool::new(Arc::new(driver), PoolConfig::new().max_connections(0));
    assert!(matches!(result, Err(PoolError::Config(_))));
}

#[test]
fn test_builder() {
    let pool = Pool::builder(Arc::new(MockDriver::new()))
        .min_connections(1)
        .max_connections(3)
        .reset_statement("DISCARD ALL")
        .build()
        .unwrap();

    assert_eq!(pool.config().max_connections, 3);
    assert_eq!(pool.status().max, 3);
    assert_eq!(pool.status().state, PoolLifecycle::Active);
    assert!(!pool.id().is_empty());
}
