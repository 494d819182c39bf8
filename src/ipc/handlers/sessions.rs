use crate::ipc::error::{err, gb_err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    optional_bool, optional_f64, optional_str, optional_time, request_now, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, ExpirationMode, GradebookError, Role};
use crate::sessions::{self, NewSession, PageGrade, SessionOp};
use serde_json::json;

fn parse_op(req: &Request) -> Result<SessionOp, serde_json::Value> {
    let raw = required_str(req, "op")?;
    SessionOp::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "op must be one of: expire, end, regrade, reopen",
            Some(json!({ "op": raw })),
        )
    })
}

fn handle_sessions_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flow_id = match required_str(req, "flowId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let participation_id = optional_str(req, "participationId");
    let access_rules_id = optional_str(req, "accessRulesId");
    let expiration_mode = match optional_str(req, "expirationMode") {
        None => ExpirationMode::End,
        Some(raw) => match ExpirationMode::parse(&raw) {
            Some(m) => m,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "expirationMode must be one of: end, roll_over",
                    Some(json!({ "expirationMode": raw })),
                )
            }
        },
    };
    let expiration_time = match optional_time(req, "expirationTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = records::get_course(conn, &course_id) {
        return gb_err(&req.id, e);
    }
    if let Some(pid) = &participation_id {
        match records::get_participation(conn, pid) {
            Ok(p) if p.course_id != course_id => {
                return err(&req.id, "wrong_course", "participation from wrong course", None)
            }
            Ok(_) => {}
            Err(e) => return gb_err(&req.id, e),
        }
    }

    let new = NewSession {
        course_id: &course_id,
        participation_id: participation_id.as_deref(),
        flow_id: &flow_id,
        access_rules_id: access_rules_id.as_deref(),
        expiration_mode,
        expiration_time,
    };
    match sessions::start_session(conn, &new, now) {
        Ok(session) => ok(&req.id, json!({ "session": session })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_sessions_grade_page(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(page_ordinal) = req.params.get("pageOrdinal").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "pageOrdinal must be an integer", None);
    };
    let points = match optional_f64(req, "points") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_points = match optional_f64(req, "maxPoints") {
        Ok(Some(v)) if v >= 0.0 => v,
        Ok(_) => return err(&req.id, "bad_params", "maxPoints must be a number >= 0", None),
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let page = PageGrade {
        page_ordinal,
        points,
        max_points,
    };
    match sessions::record_page_grade(conn, &session_id, &page, now) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flow_id = optional_str(req, "flowId");
    match records::list_sessions(conn, &course_id, flow_id.as_deref()) {
        Ok(list) => ok(&req.id, json!({ "sessions": list })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_sessions_act(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let viewer_id = match required_str(req, "viewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let op = match parse_op(req) {
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
            GradebookError::forbidden("must be instructor or TA to act on sessions"),
        );
    }
    let session = match records::get_session(conn, &session_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if session.course_id != viewer.course_id {
        return err(&req.id, "wrong_course", "session from wrong course", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let acted = match sessions::act_on_session(&tx, &session, op, now) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    tracing::info!(session_id = %session.id, op = ?op, acted, "session action");

    let session = match records::get_session(conn, &session_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    ok(
        &req.id,
        json!({
            "acted": acted,
            "message": sessions::single_message(op),
            "session": session,
        }),
    )
}

fn handle_sessions_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let rule_id = match required_str(req, "ruleId") {
        Ok(v) => sessions::unmangle_rule_id(&v),
        Err(e) => return e,
    };
    let op = match parse_op(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let past_end_only = match optional_bool(req, "pastEndOnly") {
        Ok(Some(v)) => v,
        Ok(None) => match setup::past_end_only_default(conn) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return e,
    };

    let viewer = match records::load_viewer(conn, &viewer_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if viewer.role != Role::Instructor {
        return gb_err(
            &req.id,
            GradebookError::forbidden("must be instructor to run batch session operations"),
        );
    }
    let opportunity = match records::get_opportunity(conn, &opportunity_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };
    if opportunity.course_id != viewer.course_id {
        return err(&req.id, "wrong_course", "opportunity from wrong course", None);
    }
    let Some(flow_id) = opportunity.flow_id.as_deref() else {
        return err(
            &req.id,
            "bad_params",
            "opportunity is not attached to a flow",
            None,
        );
    };

    match sessions::batch_sessions(
        conn,
        &opportunity.course_id,
        flow_id,
        rule_id.as_deref(),
        op,
        now,
        past_end_only,
    ) {
        Ok(count) => ok(
            &req.id,
            json!({
                "count": count,
                "message": sessions::batch_message(op, count),
            }),
        ),
        Err(e) => gb_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.start" => Some(handle_sessions_start(state, req)),
        "sessions.gradePage" => Some(handle_sessions_grade_page(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.act" => Some(handle_sessions_act(state, req)),
        "sessions.batch" => Some(handle_sessions_batch(state, req)),
        _ => None,
    }
}
