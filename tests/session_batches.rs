mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    create_opportunity, request_err_code, request_ok, seed_roster, spawn_sidecar, temp_dir,
};

#[allow(clippy::too_many_arguments)]
fn start_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    course_id: &str,
    participation_id: &str,
    flow_id: &str,
    rule: serde_json::Value,
    mode: &str,
    expiration: serde_json::Value,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "sessions.start",
        json!({
            "courseId": course_id,
            "participationId": participation_id,
            "flowId": flow_id,
            "accessRulesId": rule,
            "expirationMode": mode,
            "expirationTime": expiration,
            "now": "2025-02-01T09:00:00Z"
        }),
    );
    res["session"]["id"].as_str().expect("session id").to_string()
}

fn grade_page(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    session_id: &str,
    ordinal: i64,
    points: f64,
    now: &str,
) {
    request_ok(
        stdin,
        reader,
        id,
        "sessions.gradePage",
        json!({
            "sessionId": session_id,
            "pageOrdinal": ordinal,
            "points": points,
            "maxPoints": 5.0,
            "now": now
        }),
    );
}

fn find_session<'a>(list: &'a serde_json::Value, id: &str) -> &'a serde_json::Value {
    list["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .find(|s| s["id"] == id)
        .expect("session present")
}

#[test]
fn batch_expire_end_and_regrade_count_matching_sessions() {
    let workspace = temp_dir("gradebookd-sessions-batch");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);
    let quiz = create_opportunity(
        &mut stdin,
        &mut reader,
        "o1",
        json!({ "courseId": roster.course_id, "identifier": "quiz1", "flowId": "quiz1" }),
    );

    let s_adams = start_session(
        &mut stdin,
        &mut reader,
        "s1",
        &roster.course_id,
        &roster.adams,
        "quiz1",
        json!("late"),
        "end",
        json!("2025-02-01T12:00:00Z"),
    );
    let s_young = start_session(
        &mut stdin,
        &mut reader,
        "s2",
        &roster.course_id,
        &roster.young,
        "quiz1",
        json!("late"),
        "end",
        json!("2025-02-10T12:00:00Z"),
    );
    let s_brown = start_session(
        &mut stdin,
        &mut reader,
        "s3",
        &roster.course_id,
        &roster.brown,
        "quiz1",
        json!("late"),
        "roll_over",
        json!(null),
    );
    grade_page(&mut stdin, &mut reader, "p1", &s_adams, 0, 3.0, "2025-02-01T10:00:00Z");
    grade_page(&mut stdin, &mut reader, "p2", &s_adams, 1, 4.0, "2025-02-01T10:05:00Z");

    // Only the session past its expiration time is touched.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "sessions.batch",
        json!({
            "viewerId": roster.instructor,
            "opportunityId": quiz,
            "ruleId": "late",
            "op": "expire",
            "now": "2025-02-02T09:00:00Z"
        }),
    );
    assert_eq!(res["count"], 1);
    assert_eq!(res["message"], "1 session(s) expired.");

    let single = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "gradebook.single",
        json!({
            "viewerId": roster.instructor,
            "participationId": roster.adams,
            "opportunityId": quiz
        }),
    );
    assert_eq!(single["status"]["points"], 7.0);
    assert_eq!(single["status"]["maxPoints"], 10.0);
    assert_eq!(single["allowSessionActions"], true);
    assert_eq!(
        single["gradeChanges"][0]["attemptId"],
        format!("flow-session-{}", s_adams)
    );

    // Without past-end gating: young ends, brown rolls over.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "sessions.batch",
        json!({
            "viewerId": roster.instructor,
            "opportunityId": quiz,
            "ruleId": "late",
            "op": "expire",
            "pastEndOnly": false,
            "now": "2025-02-02T09:30:00Z"
        }),
    );
    assert_eq!(res["count"], 2);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "sessions.list",
        json!({ "courseId": roster.course_id, "flowId": "quiz1" }),
    );
    let young = find_session(&list, &s_young);
    assert_eq!(young["inProgress"], false);
    let brown = find_session(&list, &s_brown);
    assert_eq!(brown["inProgress"], true);
    assert!(brown["accessRulesId"].is_null());
    assert_eq!(brown["expirationMode"], "end");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "b3",
        "sessions.batch",
        json!({
            "viewerId": roster.instructor,
            "opportunityId": quiz,
            "ruleId": "<<<NONE>>>",
            "op": "end",
            "pastEndOnly": false,
            "now": "2025-02-02T10:00:00Z"
        }),
    );
    assert_eq!(res["count"], 1);
    assert_eq!(res["message"], "1 session(s) ended.");

    // A late page grade shows up after regrading.
    grade_page(&mut stdin, &mut reader, "p3", &s_adams, 1, 5.0, "2025-02-03T08:00:00Z");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "b4",
        "sessions.batch",
        json!({
            "viewerId": roster.instructor,
            "opportunityId": quiz,
            "ruleId": "late",
            "op": "regrade",
            "now": "2025-02-03T09:00:00Z"
        }),
    );
    assert_eq!(res["count"], 2);
    assert_eq!(res["message"], "2 session(s) regraded.");

    let single = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "gradebook.single",
        json!({
            "viewerId": roster.ta,
            "participationId": roster.adams,
            "opportunityId": quiz
        }),
    );
    assert_eq!(single["status"]["points"], 8.0);
    let entries = single["gradeChanges"].as_array().expect("gradeChanges");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["isSuperseded"], true);
    assert_eq!(entries[1]["isSuperseded"], false);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_operations_are_instructor_only_and_need_a_flow() {
    let workspace = temp_dir("gradebookd-sessions-guard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);
    let quiz = create_opportunity(
        &mut stdin,
        &mut reader,
        "o1",
        json!({ "courseId": roster.course_id, "identifier": "quiz1", "flowId": "quiz1" }),
    );
    let hw = create_opportunity(
        &mut stdin,
        &mut reader,
        "o2",
        json!({ "courseId": roster.course_id, "identifier": "hw1" }),
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "b1",
        "sessions.batch",
        json!({ "viewerId": roster.ta, "opportunityId": quiz, "ruleId": "late", "op": "end" }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "b2",
        "sessions.batch",
        json!({ "viewerId": roster.instructor, "opportunityId": hw, "ruleId": "late", "op": "end" }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "b3",
        "sessions.batch",
        json!({ "viewerId": roster.instructor, "opportunityId": quiz, "ruleId": "late", "op": "reopen" }),
    );
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn single_session_actions_create_flow_opportunity_and_reopen() {
    let workspace = temp_dir("gradebookd-sessions-single");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);

    let session = start_session(
        &mut stdin,
        &mut reader,
        "s1",
        &roster.course_id,
        &roster.adams,
        "lab1",
        json!(null),
        "end",
        json!(null),
    );
    grade_page(&mut stdin, &mut reader, "p1", &session, 0, 5.0, "2025-02-01T10:00:00Z");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "a0",
        "sessions.act",
        json!({ "viewerId": roster.adams, "sessionId": session, "op": "end" }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "a1",
        "sessions.act",
        json!({ "viewerId": roster.ta, "sessionId": session, "op": "regrade" }),
    );
    assert_eq!(code, "bad_state");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "sessions.act",
        json!({
            "viewerId": roster.ta,
            "sessionId": session,
            "op": "end",
            "now": "2025-02-01T11:00:00Z"
        }),
    );
    assert_eq!(res["acted"], true);
    assert_eq!(res["message"], "Session ended.");
    assert_eq!(res["session"]["points"], 5.0);

    let opps = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "opportunities.list",
        json!({ "courseId": roster.course_id }),
    );
    let flow_opp = opps["opportunities"]
        .as_array()
        .expect("opportunities")
        .iter()
        .find(|o| o["flowId"] == "lab1")
        .expect("flow opportunity created");
    assert_eq!(flow_opp["identifier"], "flow-lab1");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "a3",
        "sessions.act",
        json!({
            "viewerId": roster.instructor,
            "sessionId": session,
            "op": "reopen",
            "now": "2025-02-02T08:00:00Z"
        }),
    );
    assert_eq!(res["session"]["inProgress"], true);
    assert!(res["session"]["points"].is_null());
    assert!(res["session"]["resultComment"]
        .as_str()
        .unwrap_or("")
        .starts_with("Session reopened at 2025-02-02T08:00:00"));

    let _ = std::fs::remove_dir_all(workspace);
}
