//! Statement execution: validation, ordering, retries, error mapping and streaming.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use slonik_client::{ClientConfig, DatabasePool, Error, Query, QueryMethods, Row, Value};
use slonik_driver::DriverError;
use slonik_testing::{MockDriver, command_result, result_set};

fn config() -> ClientConfig {
    ClientConfig::new()
        .idle_timeout(None)
        .graceful_termination_timeout(Some(Duration::from_secs(2)))
}

fn pool(driver: &MockDriver, config: ClientConfig) -> DatabasePool {
    DatabasePool::new(Arc::new(driver.clone()), config).unwrap()
}

/// Fails the first `count` statements starting with `prefix` with `error`.
fn failing(prefix: &'static str, count: usize, error: DriverError) -> MockDriver {
    let remaining = Arc::new(AtomicUsize::new(count));
    MockDriver::with_responder(move |sql, _| {
        if sql.starts_with(prefix)
            && remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(error.clone());
        }
        Ok(command_result(sql))
    })
}

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let driver = MockDriver::new();
    let pool = pool(&driver, config());

    let error = pool.query("   ".into()).await.unwrap_err();
    assert!(matches!(&error, Error::InvalidInput(message) if message.contains("cannot be empty")));

    let error = pool.query(Query::new(" $1 ").bind(1i64)).await.unwrap_err();
    assert!(matches!(&error, Error::InvalidInput(message) if message.contains("value binding")));

    assert!(driver.sql_log().is_empty());
}

#[tokio::test]
async fn test_values_are_passed_through() {
    let driver = MockDriver::with_responder(|_, values| {
        Ok(result_set(&["big", "blob"], vec![values.to_vec()]))
    });
    let pool = pool(&driver, config());

    let payload = Bytes::from_static(&[0x00, 0xde, 0xad, 0xbe, 0xef, 0xff]);
    let row = pool
        .one(
            Query::new("SELECT $1::int8, $2::bytea")
                .bind(i64::MAX)
                .bind(payload.clone()),
        )
        .await
        .unwrap();

    assert_eq!(row.get::<i64>(0).unwrap(), i64::MAX);
    assert_eq!(row.get::<Bytes>(1).unwrap(), payload);
    assert_eq!(
        driver.statements()[0].values,
        vec![Value::Int(i64::MAX), Value::Bytes(payload)]
    );
}

#[tokio::test]
async fn test_statements_on_one_connection_run_in_order() {
    let driver = MockDriver::new();
    driver.set_query_delay(Some(Duration::from_millis(20)));
    let pool = pool(&driver, config());

    pool.connect(|connection| async move {
        let (first, second, third) = tokio::join!(
            connection.query("SELECT 1".into()),
            connection.query("SELECT 2".into()),
            connection.query("SELECT 3".into()),
        );
        first?;
        second?;
        third?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert_eq!(driver.sql_log(), vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    assert_eq!(driver.last_client().unwrap().max_concurrent_statements(), 1);
}

#[tokio::test]
async fn test_failed_statement_does_not_block_the_next() {
    let driver = failing(
        "SELECT broken",
        1,
        DriverError::server("42P01", "relation \"broken\" does not exist"),
    );
    let pool = pool(&driver, config());

    pool.connect(|connection| async move {
        let (broken, fine) = tokio::join!(
            connection.query("SELECT broken".into()),
            connection.query("SELECT 1".into()),
        );
        assert!(matches!(broken, Err(Error::Query { .. })));
        fine?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_serialization_failure_is_retried() {
    let driver = failing(
        "SELECT",
        2,
        DriverError::server("40001", "could not serialize access"),
    );
    let pool = pool(&driver, config());

    pool.query("SELECT 1".into()).await.unwrap();
    assert_eq!(driver.sql_log(), vec!["SELECT 1"; 3]);
}

#[tokio::test]
async fn test_retry_limit_zero_disables_statement_retry() {
    let driver = failing(
        "SELECT",
        1,
        DriverError::server("40P01", "deadlock detected"),
    );
    let pool = pool(&driver, config().query_retry_limit(0));

    let error = pool.query("SELECT 1".into()).await.unwrap_err();
    assert!(matches!(error, Error::TransactionRollback(_)));
    assert!(error.is_transaction_rollback());
    assert_eq!(driver.sql_log().len(), 1);
}

#[tokio::test]
async fn test_tuple_moved_is_not_retried() {
    let driver = failing(
        "UPDATE",
        1,
        DriverError::server(
            "40001",
            "tuple to be locked was already moved to another partition due to concurrent update",
        ),
    );
    let pool = pool(&driver, config());

    let error = pool
        .query("UPDATE measurements SET region = 'eu'".into())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TupleMovedToAnotherPartition(_)));
    assert_eq!(driver.sql_log().len(), 1);
}

#[tokio::test]
async fn test_custom_classifier_controls_retry() {
    let driver = failing("SELECT", 1, DriverError::server("XX000", "retry me"));
    driver.set_classifier(|error| {
        error
            .message
            .contains("retry me")
            .then_some(slonik_driver::ErrorClass::TransactionRollback)
    });
    let pool = pool(&driver, config());

    pool.query("SELECT 1".into()).await.unwrap();
    assert_eq!(driver.sql_log().len(), 2);
}

#[tokio::test]
async fn test_constraint_violations_are_classified() {
    let driver = MockDriver::with_responder(|sql, _| match sql {
        "INSERT unique" => Err(DriverError::server("23505", "duplicate key value")
            .with_table("users")
            .with_constraint("users_email_key")),
        "INSERT fk" => Err(DriverError::server("23503", "violates foreign key constraint")
            .with_table("orders")
            .with_constraint("orders_user_id_fkey")),
        "INSERT null" => Err(DriverError::server("23502", "null value in column")
            .with_table("users")
            .with_column("email")),
        "INSERT check" => Err(DriverError::server("23514", "violates check constraint")
            .with_constraint("positive_balance")),
        "INSERT exclusion" => Err(DriverError::server("23P01", "conflicting key value")),
        _ => Ok(command_result(sql)),
    });
    let pool = pool(&driver, config());

    match pool.query("INSERT unique".into()).await.unwrap_err() {
        Error::UniqueIntegrityConstraintViolation(violation) => {
            assert_eq!(violation.table.as_deref(), Some("users"));
            assert_eq!(violation.constraint.as_deref(), Some("users_email_key"));
            assert_eq!(
                violation.to_string(),
                "duplicate key value (constraint users_email_key)"
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    match pool.query("INSERT fk".into()).await.unwrap_err() {
        Error::ForeignKeyIntegrityConstraintViolation(violation) => {
            assert_eq!(violation.constraint.as_deref(), Some("orders_user_id_fkey"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    match pool.query("INSERT null".into()).await.unwrap_err() {
        Error::NotNullIntegrityConstraintViolation(violation) => {
            assert_eq!(violation.column.as_deref(), Some("email"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(
        pool.query("INSERT check".into()).await,
        Err(Error::CheckIntegrityConstraintViolation(_))
    ));
    let exclusion = pool.query("INSERT exclusion".into()).await.unwrap_err();
    assert!(matches!(
        exclusion,
        Error::ExclusionIntegrityConstraintViolation(_)
    ));
    assert!(exclusion.is_integrity_violation());
}

#[tokio::test]
async fn test_statement_timeout_and_syntax_errors() {
    let driver = MockDriver::with_responder(|sql, _| match sql {
        "SELECT pg_sleep(10)" => Err(DriverError::server(
            "57014",
            "canceling statement due to statement timeout",
        )),
        "SELEC 1" => Err(DriverError::server("42601", "syntax error at or near \"SELEC\"")),
        _ => Ok(command_result(sql)),
    });
    let pool = pool(&driver, config());

    assert!(matches!(
        pool.query("SELECT pg_sleep(10)".into()).await,
        Err(Error::StatementTimeout(_))
    ));
    assert!(matches!(
        pool.query("SELEC 1".into()).await,
        Err(Error::InputSyntax(_))
    ));
}

#[tokio::test]
async fn test_notices_are_attached() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql.contains("fail") {
            return Err(DriverError::server("XX000", "internal error"));
        }
        Ok(command_result(sql))
    });
    driver.notice_on("CREATE", "relation \"t\" already exists, skipping");
    driver.notice_on("fail", "about to fail");
    let pool = pool(&driver, config());

    let result = pool
        .query("CREATE TABLE IF NOT EXISTS t (id int)".into())
        .await
        .unwrap();
    assert_eq!(result.notices.len(), 1);
    assert!(result.notices[0].message.contains("skipping"));

    match pool.query("SELECT fail()".into()).await.unwrap_err() {
        Error::Query { notices, .. } => {
            assert_eq!(notices.len(), 1);
            assert_eq!(notices[0].message, "about to fail");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_backend_terminated_statement_marks_connection() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql.contains("pg_terminate_backend") {
            return Err(DriverError::server(
                "57P01",
                "terminating connection due to administrator command",
            ));
        }
        Ok(command_result(sql))
    });
    let pool = pool(&driver, config());

    let result = pool
        .connect(|connection| async move {
            let first = connection
                .query("SELECT pg_terminate_backend(pg_backend_pid())".into())
                .await;
            assert!(matches!(first, Err(Error::BackendTerminated(_))));
            connection.query("SELECT 1".into()).await
        })
        .await;

    assert!(matches!(result, Err(Error::BackendTerminated(_))));
    assert_eq!(driver.sql_log().len(), 1);
    assert_eq!(driver.clients_destroyed(), 1);
}

#[tokio::test]
async fn test_result_shapes_through_the_pool() {
    let driver = MockDriver::with_responder(|sql, _| match sql {
        "SELECT id FROM users" => Ok(result_set(
            &["id"],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        )),
        "SELECT EXISTS(SELECT 1 FROM users)" => {
            Ok(result_set(&["exists"], vec![vec![Value::Bool(true)]]))
        }
        _ => Ok(result_set(&["id"], vec![])),
    });
    let pool = pool(&driver, config());

    assert_eq!(
        pool.many_first("SELECT id FROM users").await.unwrap(),
        vec![Value::Int(1), Value::Int(2)]
    );
    assert!(matches!(
        pool.one("SELECT id FROM users").await,
        Err(Error::DataIntegrity(_))
    ));
    assert!(matches!(
        pool.one("SELECT id FROM admins").await,
        Err(Error::NotFound)
    ));
    assert!(
        pool.maybe_one_first("SELECT id FROM admins")
            .await
            .unwrap()
            .is_none()
    );
    assert!(pool.exists("SELECT 1 FROM users").await.unwrap());
}

#[tokio::test]
async fn test_stream_yields_rows() {
    let driver = MockDriver::with_responder(|_, _| {
        Ok(result_set(
            &["n"],
            (1..=3).map(|n| vec![Value::Int(n)]).collect(),
        ))
    });
    let pool = pool(&driver, config());

    let numbers = pool
        .stream("SELECT n FROM generate_series(1, 3) n", |rows| async move {
            let rows: Vec<Row> = rows.try_collect().await?;
            Ok::<_, Error>(
                rows.iter()
                    .map(|row| row.get::<i64>(0).unwrap())
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .unwrap();

    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_stream_holds_the_connection() {
    let driver = MockDriver::with_responder(|sql, _| {
        if sql.starts_with("SELECT n") {
            return Ok(result_set(&["n"], vec![vec![Value::Int(1)]]));
        }
        Ok(command_result(sql))
    });
    let pool = pool(&driver, config());

    let observer = driver.clone();
    pool.connect(|connection| async move {
        let reader = connection.clone();
        let (streamed, _) = tokio::join!(
            reader.stream("SELECT n FROM t", |rows| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(observer.sql_log().len(), 1, "statement ran while streaming");
                let rows: Vec<Row> = rows.try_collect().await?;
                Ok::<_, Error>(rows.len())
            }),
            connection.query("UPDATE t SET n = 2".into()),
        );
        assert_eq!(streamed?, 1);
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert_eq!(driver.sql_log(), vec!["SELECT n FROM t", "UPDATE t SET n = 2"]);
}
