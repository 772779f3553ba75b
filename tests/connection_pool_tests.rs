/// Connection pool tests
///
/// Leasing, transactions, monitoring, health checks, reconnection and
/// shutdown, against the scripted driver.
/// Run with: cargo test --test connection_pool_tests

use mapperdb::{
    ConnectionPool, DbError, HealthCheckConfig, IsolationLevel, MonitoringConfig, PoolConfig,
    PoolEvent, ReconnectionConfig, ScriptedDriver, Value,
};
use std::time::Duration;
use tokio::sync::broadcast;

fn quiet_config() -> PoolConfig {
    PoolConfig::new()
        .min_connections(1)
        .max_connections(3)
        .connection_timeout(Duration::from_millis(200))
        .without_health_check()
}

async fn next_matching<F>(
    events: &mut broadcast::Receiver<PoolEvent>,
    mut predicate: F,
) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event was not published")
}

#[tokio::test]
async fn test_direct_query_is_recorded() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(driver.clone(), quiet_config()).await.unwrap();

    let result = pool.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(result.row_count(), 1);

    let stats = pool.stats();
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.failed_queries, 0);
    assert_eq!(stats.idle_connections, 1);
    assert!(stats.healthy);

    let metrics = pool.query_metrics(10);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].sql, "SELECT 1");
    assert!(metrics[0].success);
}

#[tokio::test]
async fn test_transaction_commits_with_isolation_level() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(driver.clone(), quiet_config()).await.unwrap();

    let inserted = pool
        .transaction(
            |conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO t (id) VALUES ($1)", &[Value::Integer(1)])
                        .await
                })
            },
            Some(IsolationLevel::Serializable),
        )
        .await
        .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(
        driver.sql_log(),
        vec![
            "BEGIN",
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            "INSERT INTO t (id) VALUES ($1)",
            "COMMIT",
        ]
    );
    assert_eq!(driver.committed().len(), 1);
    assert_eq!(pool.stats().idle_connections, 1);
}

#[tokio::test]
async fn test_transaction_rolls_back_and_releases() {
    let driver = ScriptedDriver::new();
    driver.fail_when("INSERT", DbError::from_sqlstate("23505", "duplicate key"));
    let pool = ConnectionPool::new(driver.clone(), quiet_config()).await.unwrap();

    let err = pool
        .transaction(
            |conn| {
                Box::pin(async move {
                    conn.execute("DELETE FROM t WHERE id = $1", &[Value::Integer(1)])
                        .await?;
                    conn.execute("INSERT INTO t (id) VALUES ($1)", &[Value::Integer(1)])
                        .await
                })
            },
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(err.sqlstate(), Some("23505"));
    assert_eq!(driver.sql_log().last().map(String::as_str), Some("ROLLBACK"));
    assert!(driver.committed().is_empty());

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.failed_queries, 1);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config().max_connections(1))
        .await
        .unwrap();

    let _held = pool.get_connection().await.unwrap();
    let err = pool.get_connection().await.unwrap_err();
    assert_eq!(err, DbError::AcquireTimeout(200));
    assert_eq!(pool.stats().waiting_requests, 0);
}

#[tokio::test]
async fn test_waiting_caller_gets_released_connection() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config()
            .max_connections(1)
            .connection_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let mut held = pool.get_connection().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.get_connection().await.unwrap();
            conn.id()
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiting_requests, 1);
    held.release();

    assert_eq!(waiter.await.unwrap(), held_id);
    assert_eq!(driver.opened_connections(), 1);
}

#[tokio::test]
async fn test_many_callers_share_bounded_connections() {
    let driver = ScriptedDriver::new();
    driver.set_latency(Some(Duration::from_millis(5)));
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config().connection_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let mut handles = vec![];
    for i in 0..20 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.query("INSERT INTO t (id) VALUES ($1)", &[Value::Integer(i)])
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().row_count(), 1);
    }

    assert!(driver.opened_connections() <= 3);
    assert_eq!(pool.stats().total_queries, 20);
    assert_eq!(driver.committed().len(), 20);
}

#[tokio::test]
async fn test_slow_queries_are_reported() {
    let driver = ScriptedDriver::new();
    driver.set_latency(Some(Duration::from_millis(30)));
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config().slow_query_threshold(Duration::from_millis(10)),
    )
    .await
    .unwrap();
    let mut events = pool.subscribe();

    pool.query("SELECT * FROM big_table", &[]).await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, PoolEvent::SlowQuery { .. })).await;
    match event {
        PoolEvent::SlowQuery {
            sql, threshold_ms, ..
        } => {
            assert_eq!(sql, "SELECT * FROM big_table");
            assert_eq!(threshold_ms, 10);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(pool.stats().slow_queries, 1);
    assert!(pool.query_metrics(1)[0].slow);
}

#[tokio::test]
async fn test_metrics_buffer_is_bounded() {
    let pool = ConnectionPool::new(
        ScriptedDriver::new(),
        quiet_config().monitoring(MonitoringConfig {
            metrics_capacity: 5,
            ..MonitoringConfig::default()
        }),
    )
    .await
    .unwrap();

    for i in 0..8 {
        pool.query(&format!("SELECT {}", i + 10), &[]).await.unwrap();
    }

    let metrics = pool.query_metrics(100);
    assert_eq!(metrics.len(), 5);
    assert_eq!(metrics.last().map(|m| m.sql.as_str()), Some("SELECT 17"));
    assert_eq!(pool.query_metrics(2).len(), 2);
}

#[tokio::test]
async fn test_health_check_reports_failures() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config().reconnection(ReconnectionConfig {
            enabled: false,
            ..ReconnectionConfig::default()
        }),
    )
    .await
    .unwrap();

    let result = pool.health_check().await;
    assert!(result.healthy);
    assert!(result.error.is_none());

    driver.fail_when("SELECT 1", DbError::ConnectionError("server closed".into()));
    let result = pool.health_check().await;
    assert!(!result.healthy);
    assert!(result.error.unwrap().contains("server closed"));
    assert!(!pool.stats().healthy);
}

#[tokio::test]
async fn test_health_monitor_polls_on_interval() {
    let pool = ConnectionPool::new(
        ScriptedDriver::new(),
        quiet_config().health_check(HealthCheckConfig {
            interval: Duration::from_millis(20),
            ..HealthCheckConfig::default()
        }),
    )
    .await
    .unwrap();
    let mut events = pool.subscribe();

    let event = next_matching(&mut events, |e| matches!(e, PoolEvent::HealthCheck { .. })).await;
    assert!(matches!(event, PoolEvent::HealthCheck { healthy: true, .. }));
}

#[tokio::test]
async fn test_reconnection_after_connection_error() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config().reconnection(ReconnectionConfig {
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            exponential_backoff: true,
        }),
    )
    .await
    .unwrap();
    let mut events = pool.subscribe();

    driver.fail_when("UPDATE", DbError::ConnectionError("connection reset".into()));
    let err = pool.query("UPDATE t SET a = 1", &[]).await.unwrap_err();
    assert!(err.is_connection_error());

    let attempt =
        next_matching(&mut events, |e| matches!(e, PoolEvent::ReconnectAttempt { .. })).await;
    assert_eq!(
        attempt,
        PoolEvent::ReconnectAttempt {
            attempt: 1,
            max_retries: 3,
            delay_ms: 10
        }
    );
    next_matching(&mut events, |e| matches!(e, PoolEvent::ReconnectSucceeded { attempt: 1 })).await;

    let stats = pool.stats();
    assert!(stats.healthy);
    assert_eq!(stats.connection_errors, 1);
    assert_eq!(stats.reconnection_attempts, 1);
}

#[tokio::test]
async fn test_reconnection_gives_up_after_max_retries() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(
        driver.clone(),
        quiet_config().reconnection(ReconnectionConfig {
            enabled: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            exponential_backoff: false,
        }),
    )
    .await
    .unwrap();
    let mut events = pool.subscribe();

    driver.fail_times("SELECT 1", 10, DbError::ConnectionError("down".into()));
    driver.fail_when("UPDATE", DbError::ConnectionError("down".into()));
    let _ = pool.query("UPDATE t SET a = 1", &[]).await;

    let failed =
        next_matching(&mut events, |e| matches!(e, PoolEvent::ReconnectFailed { .. })).await;
    assert!(matches!(failed, PoolEvent::ReconnectFailed { attempts: 2, .. }));
    assert!(!pool.stats().healthy);
}

#[tokio::test]
async fn test_lease_events_in_order() {
    let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config()).await.unwrap();
    let mut events = pool.subscribe();

    let mut conn = pool.get_connection().await.unwrap();
    let id = conn.id();
    conn.release();
    conn.release();

    assert_eq!(
        events.try_recv().unwrap(),
        PoolEvent::Acquired { connection_id: id }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        PoolEvent::Released { connection_id: id }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_close_waits_for_leases() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(driver.clone(), quiet_config()).await.unwrap();
    let mut events = pool.subscribe();

    let conn = pool.get_connection().await.unwrap();
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(conn);
    });

    pool.close().await.unwrap();
    holder.await.unwrap();

    assert!(pool.is_closed());
    assert!(driver.was_shut_down());
    assert_eq!(driver.closed_connections(), driver.opened_connections());
    assert_eq!(
        next_matching(&mut events, |e| matches!(e, PoolEvent::Closed { .. })).await,
        PoolEvent::Closed { forced: false }
    );
    assert_eq!(
        pool.get_connection().await.unwrap_err(),
        DbError::PoolShuttingDown
    );
}

#[tokio::test]
async fn test_force_close_terminates_leases() {
    let driver = ScriptedDriver::new();
    let pool = ConnectionPool::new(driver.clone(), quiet_config().min_connections(2))
        .await
        .unwrap();
    let mut conn = pool.get_connection().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();

    pool.force_close().await.unwrap();
    assert_eq!(driver.opened_connections(), 2);
    assert_eq!(driver.closed_connections(), driver.opened_connections());

    assert_eq!(
        conn.query("SELECT 1", &[]).await.unwrap_err(),
        DbError::PoolShuttingDown
    );
    assert_eq!(
        pool.get_connection().await.unwrap_err(),
        DbError::PoolShuttingDown
    );
    conn.release();
    tokio::task::yield_now().await;
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(driver.closed_connections(), 2);
    assert!(format!("{:?}", pool).contains("closed: true"));
}

#[tokio::test]
async fn test_refused_connections_surface_on_startup() {
    let driver = ScriptedDriver::new();
    driver.refuse_connections(true);
    let err = ConnectionPool::new(
        driver,
        quiet_config().reconnection(ReconnectionConfig {
            enabled: false,
            ..ReconnectionConfig::default()
        }),
    )
    .await
    .unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let err = ConnectionPool::new(
        ScriptedDriver::new(),
        quiet_config().min_connections(5).max_connections(2),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DbError::InvalidConfig(_)));
}
