use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => {
            tracing::info!(path = %out_path.display(), bytes = summary.db_bytes, "workspace exported");
            ok(
                &req.id,
                json!({
                    "outPath": out_path.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "dbSha256": summary.db_sha256,
                    "dbBytes": summary.db_bytes,
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match required_str(req, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    // Close the connection so the database file can be replaced.
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace);

    match db::open_db(&workspace) {
        Ok(conn) => state.db = Some(conn),
        Err(e) => {
            tracing::error!(workspace = %workspace.display(), error = %e, "workspace reopen failed");
            return err(&req.id, "db_open_failed", format!("{e:?}"), None);
        }
    }

    match imported {
        Ok(summary) => {
            tracing::info!(path = %in_path.display(), "workspace imported");
            ok(
                &req.id,
                json!({
                    "bundleFormat": summary.bundle_format,
                    "dbSha256": summary.db_sha256,
                }),
            )
        }
        Err(e) => err(&req.id, "bad_bundle", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
