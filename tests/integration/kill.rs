//! KILL integration tests
//!
//! Thread ids are the proxy's session ids, not backend connection ids.

use std::time::{Duration, Instant};

use crate::{assert_query_error, get_admin_config, get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_kill_unknown_thread() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    assert_query_error(conn.query_drop("KILL 987654321"), 1094, "Unknown thread id");
}

#[test]
fn test_kill_own_connection_from_another_session() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut victim = config.conn();
    let victim_id = victim.connection_id();

    let mut killer = config.conn();
    killer
        .query_drop(format!("KILL CONNECTION {}", victim_id))
        .expect("KILL should succeed");

    assert!(victim.query_drop("SELECT 1").is_err(), "Killed session should be closed");
}

#[test]
fn test_kill_query_interrupts_long_statement() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut victim = config.conn();
    let victim_id = victim.connection_id();

    let handle = std::thread::spawn(move || {
        let started = Instant::now();
        let _ = victim.query_drop("SELECT SLEEP(30)");
        let elapsed = started.elapsed();
        // The session itself survives a KILL QUERY
        let alive: Option<u64> = victim.query_first("SELECT 1").unwrap();
        (elapsed, alive)
    });

    std::thread::sleep(Duration::from_millis(500));
    let mut killer = config.conn();
    killer
        .query_drop(format!("KILL QUERY {}", victim_id))
        .expect("KILL QUERY should succeed");

    let (elapsed, alive) = handle.join().unwrap();
    assert!(elapsed < Duration::from_secs(20));
    assert_eq!(alive, Some(1));
}

#[test]
fn test_kill_foreign_session_needs_privilege() {
    skip_if_not_enabled!();

    let mut admin = get_admin_config().conn();
    let admin_id = admin.connection_id();

    let mut app = get_proxy_config().conn();
    assert_query_error(
        app.query_drop(format!("KILL {}", admin_id)),
        1095,
        "You are not owner of thread",
    );

    let app_id = app.connection_id();
    admin
        .query_drop(format!("KILL {}", app_id))
        .expect("admin may kill any session");
}

#[test]
fn test_kill_query_id_is_unsupported() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    assert_query_error(conn.query_drop("KILL QUERY ID 12"), 1105, "not supported");
}
