//! Authentication integration tests

use crate::{assert_query_error, get_admin_config, get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;
use mysql::ChangeUserOpts;

#[test]
fn test_wrong_password_is_rejected() {
    skip_if_not_enabled!();

    let mut config = get_proxy_config();
    config.password = "definitely-wrong".to_string();
    assert_query_error(config.try_conn(), 1045, "Access denied");
}

#[test]
fn test_unknown_user_is_rejected() {
    skip_if_not_enabled!();

    let mut config = get_proxy_config();
    config.user = "no_such_user".to_string();
    assert_query_error(config.try_conn(), 1045, "Access denied");
}

#[test]
fn test_change_user() {
    skip_if_not_enabled!();

    let admin = get_admin_config();
    let mut conn = get_proxy_config().conn();
    conn.query_drop("SET @before = 1").unwrap();

    conn.change_user(
        ChangeUserOpts::default()
            .with_user(Some(admin.user.clone()))
            .with_pass(Some(admin.password.clone())),
    )
    .expect("COM_CHANGE_USER should succeed");

    let user: Option<String> = conn.query_first("SELECT CURRENT_USER()").unwrap();
    assert!(user.unwrap_or_default().starts_with(&admin.user));

    // Session state of the previous user is gone
    let before: Option<Option<i64>> = conn.query_first("SELECT @before").unwrap();
    assert_eq!(before, Some(None));
}
