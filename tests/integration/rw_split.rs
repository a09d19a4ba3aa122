//! Read/write split integration tests
//!
//! Expects the proxy to run the readwritesplit router with at least one
//! replica and a table `orders (user_id VARCHAR, order_no VARCHAR,
//! amount DECIMAL)` in the test database.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_rw_";

fn cleanup_user_id(conn: &mut mysql::Conn, user_id: &str) {
    let sql = format!("DELETE FROM orders WHERE user_id = '{}'", user_id);
    let _ = conn.query_drop(&sql);
}

fn parse_amount(s: &str) -> i64 {
    s.parse::<f64>().unwrap_or(0.0) as i64
}

#[test]
fn test_reads_can_reach_replicas() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let server_id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        if let Some(id) = server_id {
            server_ids.insert(id);
        }
    }

    if server_ids.len() > 1 {
        eprintln!("Reads spread over {} servers", server_ids.len());
    } else {
        eprintln!("All reads went to one server (expected without replicas)");
    }
}

#[test]
fn test_write_then_read() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();

    let user_id = format!("{}write_test", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ('{}', 'ORD_{}wr', 100.00)",
        user_id, TEST_PREFIX
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    // Reads inside a transaction stay on the primary, so no replication lag
    conn.query_drop("BEGIN").unwrap();
    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    conn.query_drop("COMMIT").unwrap();
    assert_eq!(result.map(|s| parse_amount(&s)), Some(100));

    cleanup_user_id(&mut conn, &user_id);
}

#[test]
fn test_session_variable_reaches_every_backend() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop("SET @marker = 42").expect("SET should succeed");

    // Whichever server answers, the variable is there
    for _ in 0..5 {
        let marker: Option<i64> = conn.query_first("SELECT @marker").unwrap();
        assert_eq!(marker, Some(42));
    }
}

#[test]
fn test_use_database_applies_to_all_backends() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop("USE information_schema").expect("USE should succeed");
    for _ in 0..5 {
        let db: Option<String> = conn.query_first("SELECT DATABASE()").unwrap();
        assert_eq!(db.as_deref(), Some("information_schema"));
    }
}

#[test]
fn test_multiple_result_sets() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let mut result = conn.query_iter("SELECT 1; SELECT 2, 3").unwrap();

    let mut sets = 0;
    while let Some(set) = result.iter() {
        let rows: Vec<mysql::Row> = set.collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        sets += 1;
    }
    assert_eq!(sets, 2);
}
