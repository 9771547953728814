use crate::auth::{self, AuthError, Role, SessionUser};
use crate::ipc::error::{db_err, respond, sql_err, HandlerErr};
use crate::ipc::helpers::{current_user, get_optional_text, get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use crate::session;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct Account {
    user: SessionUser,
    salt: String,
    hash: String,
}

fn load_account(conn: &Connection, username: &str) -> Result<Option<Account>, HandlerErr> {
    conn.query_row(
        "SELECT id, username, nama, email, role, kelas, nis, password_salt, password_hash
         FROM accounts WHERE username = ?",
        [username],
        |r| {
            let role: String = r.get(4)?;
            Ok(Account {
                user: SessionUser {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    nama: r.get(2)?,
                    email: r.get(3)?,
                    role: Role::parse(&role).unwrap_or(Role::Guest),
                    kelas: r.get(5)?,
                    nis: r.get(6)?,
                },
                salt: r.get(7)?,
                hash: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(sql_err("db_query_failed"))
}

fn start_session(conn: &Connection, user: &SessionUser) -> Result<serde_json::Value, HandlerErr> {
    let token = auth::new_session_token();
    session::store(conn, user, &token, "password", Utc::now()).map_err(db_err("db_update_failed"))?;
    tracing::info!(username = %user.username, role = user.role.as_str(), "session started");
    Ok(json!({ "user": user, "token": token }))
}

fn auth_register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let nama = get_optional_text(params, "nama")?
        .ok_or_else(|| HandlerErr::bad_params("nama must not be empty"))?;
    let email = get_required_str(params, "email")?.trim().to_string();
    let password = get_required_str(params, "password")?;
    let confirm = get_required_str(params, "confirmPassword")?;
    let role = match get_optional_text(params, "role")? {
        None => Role::Siswa,
        Some(r) => match Role::parse(&r) {
            Some(Role::Guest) | None => {
                return Err(HandlerErr::bad_params("role must be siswa, guru or admin"))
            }
            Some(role) => role,
        },
    };

    auth::check_new_password(&password, &confirm)?;
    let username = auth::username_from_email(&email)?;
    if load_account(conn, &username)?.is_some() {
        return Err(HandlerErr::new("conflict", "username already registered")
            .with_details(json!({ "username": username })));
    }

    let salt = auth::new_salt();
    let user = SessionUser {
        id: Uuid::new_v4().to_string(),
        username,
        nama,
        email,
        role,
        kelas: None,
        nis: None,
    };
    conn.execute(
        "INSERT INTO accounts(id, username, nama, email, role, kelas, nis, password_salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?)",
        (
            &user.id,
            &user.username,
            &user.nama,
            &user.email,
            user.role.as_str(),
            &salt,
            auth::hash_password(&salt, &password),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(sql_err("db_insert_failed"))?;
    tracing::info!(username = %user.username, "account registered");

    start_session(conn, &user)
}

fn auth_login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = params.get("username").and_then(|v| v.as_str()).unwrap_or("").trim();
    let password = params.get("password").and_then(|v| v.as_str()).unwrap_or("");
    auth::check_credentials(username, password)?;

    let Some(account) = load_account(conn, username)? else {
        tracing::warn!(username, "login failed: unknown user");
        return Err(AuthError::InvalidCredentials.into());
    };
    if !auth::verify_password(&account.salt, password, &account.hash) {
        tracing::warn!(username, "login failed: wrong password");
        return Err(AuthError::InvalidCredentials.into());
    }
    start_session(conn, &account.user)
}

fn auth_session(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let stored = session::load(conn).map_err(db_err("db_query_failed"))?;
    let last_login = session::last_login(conn).map_err(db_err("db_query_failed"))?;
    let Some(s) = stored else {
        return Ok(json!({
            "authenticated": false,
            "role": Role::Guest,
            "user": null,
            "token": null,
            "lastLogin": last_login,
        }));
    };
    Ok(json!({
        "authenticated": true,
        "role": s.user.role,
        "user": s.user,
        "token": s.token,
        "lastLogin": last_login,
    }))
}

fn auth_logout(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let had_session = current_user(conn)?.is_some();
    session::clear(conn).map_err(db_err("db_update_failed"))?;
    tracing::info!(had_session, "session cleared");
    Ok(json!({ "loggedOut": true }))
}

fn require_session(conn: &Connection) -> Result<SessionUser, HandlerErr> {
    current_user(conn)?.ok_or_else(|| HandlerErr::new("unauthorized", "login required"))
}

fn auth_update_profile(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut user = require_session(conn)?;
    if let Some(nama) = get_optional_text(params, "nama")? {
        user.nama = nama;
    }
    if let Some(email) = get_optional_text(params, "email")? {
        auth::username_from_email(&email)?;
        user.email = email;
    }
    if params.get("kelas").is_some() {
        user.kelas = get_optional_text(params, "kelas")?;
    }
    if params.get("nis").is_some() {
        user.nis = get_optional_text(params, "nis")?;
    }

    let changed = conn
        .execute(
            "UPDATE accounts SET nama = ?, email = ?, kelas = ?, nis = ?, updated_at = ? WHERE id = ?",
            (
                &user.nama,
                &user.email,
                &user.kelas,
                &user.nis,
                Utc::now().to_rfc3339(),
                &user.id,
            ),
        )
        .map_err(sql_err("db_update_failed"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "account not found"));
    }
    session::update_user(conn, &user).map_err(db_err("db_update_failed"))?;
    Ok(json!({ "user": user }))
}

fn auth_change_password(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user = require_session(conn)?;
    let current = get_required_str(params, "currentPassword")?;
    let new_password = get_required_str(params, "newPassword")?;
    let confirm = get_required_str(params, "confirmPassword")?;

    let Some(account) = load_account(conn, &user.username)? else {
        return Err(HandlerErr::new("not_found", "account not found"));
    };
    if !auth::verify_password(&account.salt, &current, &account.hash) {
        return Err(AuthError::WrongCurrentPassword.into());
    }
    auth::check_new_password(&new_password, &confirm)?;

    let salt = auth::new_salt();
    conn.execute(
        "UPDATE accounts SET password_salt = ?, password_hash = ?, updated_at = ? WHERE id = ?",
        (
            &salt,
            auth::hash_password(&salt, &new_password),
            Utc::now().to_rfc3339(),
            &user.id,
        ),
    )
    .map_err(sql_err("db_update_failed"))?;
    tracing::info!(username = %user.username, "password changed");
    Ok(json!({ "changed": true }))
}

fn auth_has_permission(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let required_raw = get_required_str(params, "role")?;
    let Some(required) = Role::parse(&required_raw) else {
        return Err(HandlerErr::bad_params("unknown role"));
    };
    let role = current_user(conn)?.map(|u| u.role).unwrap_or(Role::Guest);
    Ok(json!({
        "role": role,
        "required": required,
        "allowed": auth::has_permission(role, required),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let method = req.method.as_str();
    if !method.starts_with("auth.") {
        return None;
    }
    let result = require_db(state).and_then(|conn| match method {
        "auth.register" => auth_register(conn, &req.params),
        "auth.login" => auth_login(conn, &req.params),
        "auth.session" => auth_session(conn),
        "auth.logout" => auth_logout(conn),
        "auth.updateProfile" => auth_update_profile(conn, &req.params),
        "auth.changePassword" => auth_change_password(conn, &req.params),
        "auth.hasPermission" => auth_has_permission(conn, &req.params),
        _ => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", method),
        )),
    });
    Some(respond(&req.id, result))
}
