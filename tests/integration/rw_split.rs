//! End-to-end read/write split smoke tests against a live proxy

use mysql::prelude::*;
use mysql::{Opts, Pool};

use crate::{get_proxy_config, should_run_integration_tests};

fn pool() -> Pool {
    let config = get_proxy_config();
    let opts = Opts::from_url(&config.connection_string()).expect("valid connection url");
    Pool::new(opts).expect("connect to proxy")
}

#[test]
fn test_select_round_trip() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    let value: Option<i64> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(value, Some(1));
}

#[test]
fn test_session_variable_survives_reads() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    // the SET must reach every backend; the read that follows may land on
    // any replica and still observe it
    conn.query_drop("SET @marker = 42").unwrap();
    for _ in 0..10 {
        let value: Option<i64> = conn.query_first("SELECT @marker").unwrap();
        assert_eq!(value, Some(42));
    }
}

#[test]
fn test_write_then_read_own_table() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    conn.query_drop("CREATE TABLE IF NOT EXISTS hermes_smoke (id INT PRIMARY KEY, v INT)")
        .unwrap();
    conn.query_drop("DELETE FROM hermes_smoke").unwrap();
    conn.query_drop("INSERT INTO hermes_smoke VALUES (1, 10)")
        .unwrap();

    // inside a transaction everything sticks to the primary, so the row
    // is visible regardless of replication lag
    conn.query_drop("BEGIN").unwrap();
    let value: Option<i64> = conn
        .query_first("SELECT v FROM hermes_smoke WHERE id = 1")
        .unwrap();
    conn.query_drop("COMMIT").unwrap();
    assert_eq!(value, Some(10));

    conn.query_drop("DROP TABLE hermes_smoke").unwrap();
}

#[test]
fn test_named_server_hint_accepted() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    // the hint must not break the statement even if the name is unknown
    // (the router falls back to an ordinary replica)
    let value: Option<i64> = conn
        .query_first("SELECT 1 /* hermes route to server no-such-server */")
        .unwrap();
    assert_eq!(value, Some(1));
}
