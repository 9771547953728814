//! Signed-in session, persisted in the workspace settings table.

use crate::auth::SessionUser;
use crate::db;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

const KEY_USER: &str = "session.user_data";
const KEY_TOKEN: &str = "session.auth_token";
const KEY_LAST_LOGIN: &str = "session.last_login";
const KEY_METHOD: &str = "session.login_method";

const ALL_KEYS: [&str; 4] = [KEY_USER, KEY_TOKEN, KEY_LAST_LOGIN, KEY_METHOD];

#[derive(Debug, Clone)]
pub struct Session {
    pub user: SessionUser,
    pub token: String,
}

pub fn store(
    conn: &Connection,
    user: &SessionUser,
    token: &str,
    method: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    db::settings_set_json(conn, KEY_USER, &serde_json::to_value(user)?)?;
    db::settings_set_json(conn, KEY_TOKEN, &json!(token))?;
    db::settings_set_json(conn, KEY_LAST_LOGIN, &json!(now.to_rfc3339()))?;
    db::settings_set_json(conn, KEY_METHOD, &json!(method))?;
    Ok(())
}

/// Replaces the stored user without issuing a new token.
pub fn update_user(conn: &Connection, user: &SessionUser) -> anyhow::Result<()> {
    db::settings_set_json(conn, KEY_USER, &serde_json::to_value(user)?)
}

/// A session exists only when both the user and the token are stored.
pub fn load(conn: &Connection) -> anyhow::Result<Option<Session>> {
    let user = db::settings_get_json(conn, KEY_USER)?;
    let token = db::settings_get_json(conn, KEY_TOKEN)?;
    let (Some(user), Some(token)) = (user, token) else {
        return Ok(None);
    };
    let Some(token) = token.as_str().map(|s| s.to_string()) else {
        return Ok(None);
    };
    let user: SessionUser = serde_json::from_value(user)?;
    Ok(Some(Session { user, token }))
}

pub fn last_login(conn: &Connection) -> anyhow::Result<Option<String>> {
    Ok(db::settings_get_json(conn, KEY_LAST_LOGIN)?.and_then(|v| v.as_str().map(|s| s.to_string())))
}

pub fn clear(conn: &Connection) -> anyhow::Result<()> {
    db::settings_delete(conn, &ALL_KEYS)
}
