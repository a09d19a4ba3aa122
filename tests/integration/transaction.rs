//! Transaction integration tests

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_tx_";

fn cleanup_user_id(conn: &mut mysql::Conn, user_id: &str) {
    let sql = format!("DELETE FROM orders WHERE user_id = '{}'", user_id);
    let _ = conn.query_drop(&sql);
}

#[test]
fn test_transaction_rollback() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let user_id = format!("{}rollback", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ('{}', 'ORD_{}rb', 100.00)",
        user_id, TEST_PREFIX
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    let select = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let inside: Option<String> = conn.query_first(&select).unwrap();
    assert!(inside.is_some(), "Row should be visible inside the transaction");

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    conn.query_drop("BEGIN").unwrap();
    let after: Option<String> = conn.query_first(&select).unwrap();
    conn.query_drop("COMMIT").unwrap();
    assert_eq!(after, None, "Data should be rolled back");
}

#[test]
fn test_autocommit_off_keeps_transaction_open() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let user_id = format!("{}autocommit", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("SET autocommit = 0").unwrap();
    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ('{}', 'ORD_{}ac', 5.00)",
        user_id, TEST_PREFIX
    );
    conn.query_drop(&sql).unwrap();
    conn.query_drop("ROLLBACK").unwrap();
    conn.query_drop("SET autocommit = 1").unwrap();

    let count: Option<u64> = conn
        .query_first(format!("SELECT COUNT(*) FROM orders WHERE user_id = '{}'", user_id))
        .unwrap();
    assert_eq!(count, Some(0));
}

#[test]
fn test_read_only_transaction() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop("START TRANSACTION READ ONLY").unwrap();
    let one: Option<u64> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(one, Some(1));
    conn.query_drop("COMMIT").unwrap();
}
