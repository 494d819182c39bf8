use crate::gradeimport::{self, ImportOptions};
use crate::ipc::error::{err, gb_err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{column_index, optional_f64, optional_str, request_now, required_str};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, GradebookError, Role};
use serde_json::json;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ImportMode {
    Preview,
    Import,
}

fn handle_grades_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opportunity_id = match required_str(req, "opportunityId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mode = match optional_str(req, "mode").as_deref() {
        None | Some("preview") => ImportMode::Preview,
        Some("import") => ImportMode::Import,
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "mode must be one of: preview, import",
                Some(json!({ "mode": other })),
            )
        }
    };
    let id_column = match column_index(req, "idColumn", true) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "bad_params", "missing idColumn", None),
        Err(e) => return e,
    };
    let points_column = match column_index(req, "pointsColumn", true) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "bad_params", "missing pointsColumn", None),
        Err(e) => return e,
    };
    let feedback_column = match column_index(req, "feedbackColumn", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let defaults = match setup::import_defaults(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let attempt_id = optional_str(req, "attemptId").unwrap_or(defaults.attempt_id);
    let max_points = match optional_f64(req, "maxPoints") {
        Ok(v) => v.unwrap_or(defaults.max_points),
        Err(e) => return e,
    };
    let format = optional_str(req, "format").unwrap_or(defaults.format);
    let has_header = match format.as_str() {
        "csvhead" => true,
        "csv" => false,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "format must be one of: csvhead, csv",
                Some(json!({ "format": format })),
            )
        }
    };

    let text = match (optional_str(req, "csvText"), optional_str(req, "inPath")) {
        (Some(text), _) => text,
        (None, Some(path)) => match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                return err(
                    &req.id,
                    "io_failed",
                    e.to_string(),
                    Some(json!({ "path": path })),
                )
            }
        },
        (None, None) => return err(&req.id, "bad_params", "missing csvText or inPath", None),
    };

    let viewer = match records::load_viewer(conn, &viewer_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if viewer.role != Role::Instructor {
        return gb_err(
            &req.id,
            GradebookError::forbidden("must be instructor to import grades"),
        );
    }
    let opportunity = match records::get_opportunity(conn, &opportunity_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if opportunity.course_id != viewer.course_id {
        return err(&req.id, "wrong_course", "opportunity from wrong course", None);
    }

    let opts = ImportOptions {
        opportunity_id: opportunity.id,
        attempt_id,
        has_header,
        id_column,
        points_column,
        feedback_column,
        max_points,
        creator_id: Some(viewer.id),
        grade_time: now,
    };
    let outcome = match gradeimport::csv_to_grade_changes(conn, &opts, &text) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };

    let imported = match mode {
        ImportMode::Preview => 0,
        ImportMode::Import => match gradeimport::commit_import(conn, &outcome) {
            Ok(n) => n,
            Err(e) => return gb_err(&req.id, e),
        },
    };

    ok(
        &req.id,
        json!({
            "mode": if mode == ImportMode::Import { "import" } else { "preview" },
            "totalCount": outcome.total_count,
            "changedCount": outcome.changed_count,
            "unchangedCount": outcome.unchanged_count,
            "importedCount": imported,
            "gradeChanges": outcome.grade_changes,
            "logLines": outcome.log_lines,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.importCsv" => Some(handle_grades_import_csv(state, req)),
        _ => None,
    }
}
