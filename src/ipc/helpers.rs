use crate::auth::{self, Role, SessionUser};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::types::AppState;
use crate::session;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde_json::json;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string param; blank counts as missing.
pub fn get_required_text(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let v = get_required_str(params, key)?;
    let t = v.trim();
    if t.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(t.to_string())
}

pub fn get_optional_text(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params(format!("{} must be string or null", key)));
    };
    let t = s.trim();
    if t.is_empty() {
        Ok(None)
    } else {
        Ok(Some(t.to_string()))
    }
}

/// Validation instant: `params.now` when supplied, otherwise the wall clock.
pub fn parse_now(params: &serde_json::Value) -> Result<DateTime<Utc>, HandlerErr> {
    match get_optional_text(params, "now")? {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| HandlerErr::bad_params("now must be an RFC 3339 timestamp")),
    }
}

pub fn parse_day(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_text(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn current_user(conn: &Connection) -> Result<Option<SessionUser>, HandlerErr> {
    let s = session::load(conn).map_err(db_err("db_query_failed"))?;
    Ok(s.map(|s| s.user))
}

/// Signed-in user holding at least `required`.
pub fn require_role(conn: &Connection, required: Role) -> Result<SessionUser, HandlerErr> {
    let Some(user) = current_user(conn)? else {
        return Err(HandlerErr::new("unauthorized", "login required"));
    };
    if !auth::has_permission(user.role, required) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("role {} may not perform this action", user.role.as_str()),
        )
        .with_details(json!({
            "role": user.role,
            "required": required,
        })));
    }
    Ok(user)
}
