use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of input from the host shell.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state; `db` is `None` until `workspace.select` succeeds.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
