use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of stdin.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The selected workspace and its gradebook database. Both stay `None` until
/// `workspace.select`; `db` is briefly `None` while a backup is restored.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
