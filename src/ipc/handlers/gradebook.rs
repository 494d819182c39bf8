use crate::gradebook;
use crate::gradestate::{ChangeState, GradeChange};
use crate::ipc::error::{err, gb_err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    optional_bool, optional_f64, optional_str, optional_time, request_now, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, GradebookError};
use serde_json::json;
use std::path::PathBuf;

fn resolve_include_inactive(
    conn: &rusqlite::Connection,
    req: &Request,
) -> Result<bool, serde_json::Value> {
    if let Some(v) = optional_bool(req, "includeInactive")? {
        return Ok(v);
    }
    setup::include_inactive_default(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_gradebook_participant(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let participation_id = optional_str(req, "participationId");
    match gradebook::participant_grades(conn, &viewer_id, participation_id.as_deref()) {
        Ok(book) => ok(&req.id, json!(book)),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_gradebook_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = match resolve_include_inactive(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match gradebook::course_gradebook(conn, &viewer_id, include_inactive) {
        Ok(book) => ok(&req.id, json!(book)),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_gradebook_opportunity(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let include_inactive = match resolve_include_inactive(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match gradebook::opportunity_grades(conn, &viewer_id, &opportunity_id, include_inactive) {
        Ok(book) => ok(&req.id, json!(book)),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_gradebook_single(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let participation_id = match required_str(req, "participationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opportunity_id = match required_str(req, "opportunityId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match gradebook::single_grade(conn, &viewer_id, &participation_id, &opportunity_id) {
        Ok(grade) => ok(&req.id, json!(grade)),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_gradebook_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = match resolve_include_inactive(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let csv = match gradebook::export_csv(conn, &viewer_id, include_inactive) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };

    let out_path = optional_str(req, "outPath").map(PathBuf::from);
    if let Some(path) = &out_path {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return err(&req.id, "io_failed", e.to_string(), None);
            }
        }
        if let Err(e) = std::fs::write(path, &csv) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": path.to_string_lossy() })),
            );
        }
        tracing::info!(path = %path.display(), bytes = csv.len(), "gradebook csv written");
    }

    ok(
        &req.id,
        json!({
            "csv": csv,
            "outPath": out_path.map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let participation_id = match required_str(req, "participationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opportunity_id = match required_str(req, "opportunityId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw_state = match required_str(req, "state") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(change_state) = ChangeState::parse(&raw_state) else {
        return err(
            &req.id,
            "bad_params",
            "unknown grade change state",
            Some(json!({
                "state": raw_state,
                "allowed": ChangeState::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>()
            })),
        );
    };
    let points = match optional_f64(req, "points") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_points = match optional_f64(req, "maxPoints") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let due_time = match optional_time(req, "dueTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let viewer = match records::load_viewer(conn, &viewer_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if !viewer.role.is_staff() {
        return gb_err(
            &req.id,
            GradebookError::forbidden("must be instructor or TA to record grades"),
        );
    }
    let participation = match records::get_participation(conn, &participation_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    let opportunity = match records::get_opportunity(conn, &opportunity_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if participation.course_id != viewer.course_id || opportunity.course_id != viewer.course_id {
        return err(&req.id, "wrong_course", "object from wrong course", None);
    }
    if change_state == ChangeState::Extension && due_time.is_none() {
        return err(&req.id, "bad_params", "extension requires dueTime", None);
    }

    let change = GradeChange {
        id: records::new_id(),
        opportunity_id: opportunity.id,
        participation_id: participation.id,
        state: change_state,
        attempt_id: optional_str(req, "attemptId"),
        points,
        max_points,
        comment: optional_str(req, "comment"),
        due_time,
        creator_id: Some(viewer.id),
        grade_time: now,
        flow_session_id: None,
    };
    if let Err(e) = records::insert_grade_change(conn, &change) {
        return gb_err(&req.id, e);
    }
    tracing::info!(
        opportunity = %change.opportunity_id,
        participation = %change.participation_id,
        state = change.state.as_str(),
        "grade change recorded"
    );
    ok(&req.id, json!({ "gradeChangeId": change.id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.participant" => Some(handle_gradebook_participant(state, req)),
        "gradebook.course" => Some(handle_gradebook_course(state, req)),
        "gradebook.opportunity" => Some(handle_gradebook_opportunity(state, req)),
        "gradebook.single" => Some(handle_gradebook_single(state, req)),
        "gradebook.exportCsv" => Some(handle_gradebook_export_csv(state, req)),
        "grades.record" => Some(handle_grades_record(state, req)),
        _ => None,
    }
}
