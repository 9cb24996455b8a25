//! Transaction and savepoint behaviour against the in-memory driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use slonik_client::{
    ClientConfig, DatabasePool, Error, QueryMethods, current_transaction_id,
};
use slonik_driver::DriverError;
use slonik_testing::{MockDriver, command_result, init_tracing};

fn config() -> ClientConfig {
    ClientConfig::new()
        .idle_timeout(None)
        .graceful_termination_timeout(Some(Duration::from_secs(2)))
}

fn pool(driver: &MockDriver, config: ClientConfig) -> DatabasePool {
    DatabasePool::new(Arc::new(driver.clone()), config).unwrap()
}

fn boom() -> Error {
    Error::custom(std::io::Error::other("boom"))
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
async fn test_transaction_commits() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let depth = pool
        .transaction(|tx| async move {
            tx.query("INSERT INTO users (name) VALUES ('a')".into())
                .await?;
            Ok::<_, Error>(tx.depth())
        })
        .await
        .unwrap();

    assert_eq!(depth, 0);
    assert_eq!(
        driver.sql_log(),
        vec![
            "START TRANSACTION",
            "INSERT INTO users (name) VALUES ('a')",
            "COMMIT"
        ]
    );
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_handler_error_rolls_back() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let result = pool
        .transaction(|tx| async move {
            tx.query("DELETE FROM users".into()).await?;
            Err::<(), _>(boom())
        })
        .await;

    assert!(matches!(result, Err(Error::Custom(_))));
    assert_eq!(
        driver.sql_log(),
        vec!["START TRANSACTION", "DELETE FROM users", "ROLLBACK"]
    );
    // A cleanly rolled back connection is reusable.
    assert_eq!(driver.clients_destroyed(), 0);
}

#[tokio::test]
async fn test_nested_failure_rolls_back_to_savepoint() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.transaction(|tx| async move {
        tx.query("INSERT INTO log VALUES (1)".into()).await?;

        let nested = tx
            .transaction(|savepoint| async move {
                assert_eq!(savepoint.depth(), 1);
                savepoint.query("INSERT INTO log VALUES (2)".into()).await?;
                Err::<(), _>(boom())
            })
            .await;
        assert!(matches!(nested, Err(Error::Custom(_))));

        tx.query("INSERT INTO log VALUES (3)".into()).await?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert_eq!(
        driver.sql_log(),
        vec![
            "START TRANSACTION",
            "INSERT INTO log VALUES (1)",
            "SAVEPOINT slonik_savepoint_1",
            "INSERT INTO log VALUES (2)",
            "ROLLBACK TO SAVEPOINT slonik_savepoint_1",
            "INSERT INTO log VALUES (3)",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_savepoints_nest() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.transaction(|tx| async move {
        tx.transaction(|first| async move {
            first
                .transaction(|second| async move {
                    assert_eq!(second.depth(), 2);
                    second.query("SELECT 1".into()).await
                })
                .await?;
            first.query("SELECT 2".into()).await
        })
        .await?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert_eq!(
        driver.sql_log(),
        vec![
            "START TRANSACTION",
            "SAVEPOINT slonik_savepoint_1",
            "SAVEPOINT slonik_savepoint_2",
            "SELECT 1",
            "SELECT 2",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_parent_transaction_cannot_query_while_child_is_open() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.transaction(|tx| async move {
        let parent = tx.clone();
        tx.transaction(|_savepoint| async move {
            let error = parent.query("SELECT 1".into()).await.unwrap_err();
            assert!(
                matches!(&error, Error::UnexpectedState(message) if message.contains("parent transaction")),
                "unexpected error: {error:?}"
            );
            Ok::<_, Error>(())
        })
        .await?;

        // Usable again once the savepoint is done.
        tx.query("SELECT 2".into()).await?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert!(!driver.sql_log().contains(&"SELECT 1".to_string()));
}

#[tokio::test]
async fn test_second_transaction_on_same_connection_is_rejected() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.connect(|connection| async move {
        let same = connection.clone();
        connection
            .transaction(move |_tx| {
                let same = same.clone();
                async move {
                    let error = same
                        .transaction(|_inner| async { Ok::<_, Error>(()) })
                        .await
                        .unwrap_err();
                    assert!(
                        matches!(&error, Error::UnexpectedState(message)
                            if message.contains("before completing the last transaction")),
                        "unexpected error: {error:?}"
                    );
                    Ok::<_, Error>(())
                }
            })
            .await
    })
    .await
    .unwrap();

    assert_eq!(driver.sql_log(), vec!["START TRANSACTION", "COMMIT"]);
}

#[tokio::test]
async fn test_transaction_is_retried_on_serialization_failure() {
    init_tracing();
    let failures = Arc::new(AtomicUsize::new(2));
    let driver = MockDriver::with_responder({
        let failures = Arc::clone(&failures);
        move |sql, _| {
            if sql.starts_with("UPDATE")
                && failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(DriverError::server(
                    "40001",
                    "could not serialize access due to concurrent update",
                ));
            }
            Ok(command_result(sql))
        }
    });
    let pool = pool(&driver, config());

    let calls = Arc::new(AtomicUsize::new(0));
    pool.transaction({
        let calls = Arc::clone(&calls);
        move |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("UPDATE accounts SET balance = 0".into()).await?;
                Ok::<_, Error>(())
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Statements inside a transaction are never retried on their own.
    assert_eq!(
        driver.sql_log(),
        vec![
            "START TRANSACTION",
            "UPDATE accounts SET balance = 0",
            "ROLLBACK",
            "START TRANSACTION",
            "UPDATE accounts SET balance = 0",
            "ROLLBACK",
            "START TRANSACTION",
            "UPDATE accounts SET balance = 0",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_transaction_retry_limit_is_respected() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql.starts_with("UPDATE") {
            return Err(DriverError::server("40P01", "deadlock detected"));
        }
        Ok(command_result(sql))
    });
    let pool = pool(&driver, config().transaction_retry_limit(1));

    let result = pool
        .transaction(|tx| async move {
            tx.query("UPDATE accounts SET balance = 0".into()).await?;
            Ok::<_, Error>(())
        })
        .await;

    assert!(matches!(result, Err(Error::TransactionRollback(_))));
    let starts = driver
        .sql_log()
        .iter()
        .filter(|sql| *sql == "START TRANSACTION")
        .count();
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn test_commit_failure_rolls_back() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql == "COMMIT" {
            return Err(DriverError::server("40001", "could not serialize access"));
        }
        Ok(command_result(sql))
    });
    let pool = pool(&driver, config().transaction_retry_limit(0));

    let result = pool.transaction(|_tx| async { Ok::<_, Error>(()) }).await;

    assert!(matches!(result, Err(Error::TransactionRollback(_))));
    assert_eq!(
        driver.sql_log(),
        vec!["START TRANSACTION", "COMMIT", "ROLLBACK"]
    );
}

#[tokio::test]
async fn test_ambient_transaction_id() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    assert!(current_transaction_id().is_none());
    pool.transaction(|tx| async move {
        assert_eq!(current_transaction_id().as_deref(), Some(tx.id()));
        tx.transaction(|savepoint| async move {
            assert_eq!(current_transaction_id().as_deref(), Some(savepoint.id()));
            Ok::<_, Error>(())
        })
        .await
    })
    .await
    .unwrap();
    assert!(current_transaction_id().is_none());
}

#[tokio::test]
async fn test_pool_query_inside_transaction_is_foreign() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let outer = pool.clone();
    pool.transaction(move |_tx| {
        let outer = outer.clone();
        async move {
            let error = outer.query("SELECT 1".into()).await.unwrap_err();
            assert!(matches!(error, Error::UnexpectedForeignConnection));
            Ok::<_, Error>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(driver.sql_log(), vec!["START TRANSACTION", "COMMIT"]);
    // The foreign statement was refused before a second connection was opened.
    assert_eq!(driver.clients_created(), 1);
}

#[tokio::test]
async fn test_foreign_connection_allowed_when_enabled() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config().dangerously_allow_foreign_connections(true));

    let outer = pool.clone();
    pool.transaction(move |_tx| {
        let outer = outer.clone();
        async move {
            outer.query("SELECT 1".into()).await?;
            Ok::<_, Error>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(driver.clients_created(), 2);
    assert!(driver.sql_log().contains(&"SELECT 1".to_string()));
}

#[tokio::test]
async fn test_checked_out_connection_is_foreign_inside_another_transaction() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let inner_pool = pool.clone();
    pool.connect(|outside| async move {
        inner_pool
            .transaction(move |_tx| {
                let outside = outside.clone();
                async move {
                    let error = outside.query("SELECT 1".into()).await.unwrap_err();
                    assert!(matches!(error, Error::UnexpectedForeignConnection));
                    Ok::<_, Error>(())
                }
            })
            .await
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_owning_connection_may_query_inside_its_transaction() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.connect(|connection| async move {
        let owner = connection.clone();
        connection
            .transaction(move |_tx| {
                let owner = owner.clone();
                async move {
                    owner.query("SELECT 1".into()).await?;
                    Ok::<_, Error>(())
                }
            })
            .await
    })
    .await
    .unwrap();

    assert_eq!(
        driver.sql_log(),
        vec!["START TRANSACTION", "SELECT 1", "COMMIT"]
    );
}

#[tokio::test]
async fn test_completed_transaction_handle_is_rejected() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    pool.connect(|connection| async move {
        let leaked = connection
            .transaction(|tx| async move { Ok::<_, Error>(tx) })
            .await?;
        let error = leaked.query("SELECT 1".into()).await.unwrap_err();
        assert!(matches!(error, Error::UnexpectedState(_)));
        Ok::<_, Error>(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_abandoned_transaction_destroys_connection() {
    init_tracing();
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        pool.transaction(|_tx| async {
            std::future::pending::<()>().await;
            Ok::<_, Error>(())
        }),
    )
    .await;
    assert!(abandoned.is_err());

    eventually("connection destroyed", || driver.clients_destroyed() == 1).await;
    eventually("slot removed", || pool.status().total() == 0).await;
}
