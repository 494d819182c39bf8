use crate::ipc::error::{err, gb_err, ok};
use crate::ipc::helpers::{optional_bool, optional_str, optional_time, request_now, required_str};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, fmt_time, ParticipationStatus, Role};
use serde_json::json;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let identifier = match required_str(req, "identifier") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let number = optional_str(req, "number");

    let id = records::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, identifier, name, number) VALUES(?, ?, ?, ?)",
        (&id, &identifier, &name, &number),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses", "identifier": identifier })),
        );
    }
    ok(&req.id, json!({ "courseId": id }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match records::list_courses(conn) {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_participations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = optional_str(req, "firstName").unwrap_or_default();
    let last_name = optional_str(req, "lastName").unwrap_or_default();
    let role = match optional_str(req, "role") {
        None => Role::Student,
        Some(raw) => match Role::parse(&raw) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: instructor, teaching_assistant, student, observer",
                    Some(json!({ "role": raw })),
                )
            }
        },
    };
    let status = match optional_str(req, "status") {
        None => ParticipationStatus::Active,
        Some(raw) => match ParticipationStatus::parse(&raw) {
            Some(s) => s,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: requested, active, denied, dropped",
                    Some(json!({ "status": raw })),
                )
            }
        },
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = records::get_course(conn, &course_id) {
        return gb_err(&req.id, e);
    }

    let id = records::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO participations(id, course_id, email, first_name, last_name, role, status, enroll_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &course_id,
            &email,
            &first_name,
            &last_name,
            role.as_str(),
            status.as_str(),
            fmt_time(now),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "participations", "email": email })),
        );
    }
    ok(&req.id, json!({ "participationId": id }))
}

fn handle_participations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match records::list_participations(conn, &course_id, false) {
        Ok(list) => ok(&req.id, json!({ "participations": list })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_participations_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let participation_id = match required_str(req, "participationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(status) = ParticipationStatus::parse(&raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be one of: requested, active, denied, dropped",
            Some(json!({ "status": raw })),
        );
    };
    match conn.execute(
        "UPDATE participations SET status = ? WHERE id = ?",
        (status.as_str(), &participation_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "participation not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_opportunities_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let identifier = match required_str(req, "identifier") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = optional_str(req, "name").unwrap_or_else(|| identifier.clone());
    let flow_id = optional_str(req, "flowId");
    let due_time = match optional_time(req, "dueTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let shown = match optional_bool(req, "shownInGradeBook") {
        Ok(v) => v.unwrap_or(true),
        Err(e) => return e,
    };
    let shown_student = match optional_bool(req, "shownInStudentGradeBook") {
        Ok(v) => v.unwrap_or(true),
        Err(e) => return e,
    };
    let now = match request_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = records::get_course(conn, &course_id) {
        return gb_err(&req.id, e);
    }

    let id = records::new_id();
    if let Err(e) = conn.execute(
        "INSERT INTO grading_opportunities(id, course_id, identifier, name, flow_id, due_time,
            shown_in_grade_book, shown_in_student_grade_book, creation_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &course_id,
            &identifier,
            &name,
            &flow_id,
            due_time.map(fmt_time),
            i64::from(shown),
            i64::from(shown_student),
            fmt_time(now),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grading_opportunities", "identifier": identifier })),
        );
    }
    ok(&req.id, json!({ "opportunityId": id }))
}

fn handle_opportunities_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match records::list_opportunities(conn, &course_id, false) {
        Ok(list) => ok(&req.id, json!({ "opportunities": list })),
        Err(e) => gb_err(&req.id, e),
    }
}

fn handle_opportunities_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let opportunity_id = match required_str(req, "opportunityId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut opp = match records::get_opportunity(conn, &opportunity_id) {
        Ok(v) => v,
        Err(e) => return gb_err(&req.id, e),
    };

    if let Some(name) = optional_str(req, "name") {
        opp.name = name;
    }
    match optional_bool(req, "shownInGradeBook") {
        Ok(Some(v)) => opp.shown_in_grade_book = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_bool(req, "shownInStudentGradeBook") {
        Ok(Some(v)) => opp.shown_in_student_grade_book = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_time(req, "dueTime") {
        Ok(Some(v)) => opp.due_time = Some(v),
        Ok(None) => {}
        Err(e) => return e,
    }

    if let Err(e) = conn.execute(
        "UPDATE grading_opportunities
         SET name = ?, due_time = ?, shown_in_grade_book = ?, shown_in_student_grade_book = ?
         WHERE id = ?",
        (
            &opp.name,
            opp.due_time.map(fmt_time),
            i64::from(opp.shown_in_grade_book),
            i64::from(opp.shown_in_student_grade_book),
            &opp.id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "opportunity": opp }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "participations.create" => Some(handle_participations_create(state, req)),
        "participations.list" => Some(handle_participations_list(state, req)),
        "participations.setStatus" => Some(handle_participations_set_status(state, req)),
        "opportunities.create" => Some(handle_opportunities_create(state, req)),
        "opportunities.list" => Some(handle_opportunities_list(state, req)),
        "opportunities.update" => Some(handle_opportunities_update(state, req)),
        _ => None,
    }
}
