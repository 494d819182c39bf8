mod test_support;

use serde_json::json;
use test_support::{
    create_opportunity, request_err_code, request_ok, seed_roster, spawn_sidecar, temp_dir,
};

fn identifiers(grades: &serde_json::Value) -> Vec<String> {
    grades
        .as_array()
        .expect("grades array")
        .iter()
        .map(|g| {
            g["opportunity"]["identifier"]
                .as_str()
                .expect("identifier")
                .to_string()
        })
        .collect()
}

fn last_names(rows: &serde_json::Value) -> Vec<String> {
    rows.as_array()
        .expect("rows array")
        .iter()
        .map(|r| {
            r["participation"]["lastName"]
                .as_str()
                .expect("lastName")
                .to_string()
        })
        .collect()
}

#[test]
fn participant_view_respects_roles_and_release_flags() {
    let workspace = temp_dir("gradebookd-views-participant");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);

    let hw1 = create_opportunity(
        &mut stdin,
        &mut reader,
        "o1",
        json!({ "courseId": roster.course_id, "identifier": "hw1", "name": "Homework 1" }),
    );
    let _hw2 = create_opportunity(
        &mut stdin,
        &mut reader,
        "o2",
        json!({
            "courseId": roster.course_id,
            "identifier": "hw2",
            "shownInStudentGradeBook": false
        }),
    );
    let _quiz0 = create_opportunity(
        &mut stdin,
        &mut reader,
        "o3",
        json!({
            "courseId": roster.course_id,
            "identifier": "quiz0",
            "shownInGradeBook": false
        }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.record",
        json!({
            "viewerId": roster.ta,
            "participationId": roster.adams,
            "opportunityId": hw1,
            "state": "graded",
            "attemptId": "main",
            "points": 9.0,
            "maxPoints": 10.0,
            "now": "2025-02-01T10:00:00Z"
        }),
    );

    // A student sees only released opportunities.
    let own = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "gradebook.participant",
        json!({ "viewerId": roster.adams }),
    );
    assert_eq!(own["isStudentViewing"], true);
    assert_eq!(identifiers(&own["grades"]), vec!["hw1"]);
    assert_eq!(own["grades"][0]["status"]["display"], "90.0%");
    assert_eq!(own["grades"][0]["status"]["machineReadable"], "90.000");

    // Staff see everything shown in the grade book.
    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "gradebook.participant",
        json!({ "viewerId": roster.instructor, "participationId": roster.adams }),
    );
    assert_eq!(staff["isStudentViewing"], false);
    assert_eq!(identifiers(&staff["grades"]), vec!["hw1", "hw2"]);
    assert_eq!(staff["grades"][1]["status"]["display"], "- ∅ -");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "v3",
        "gradebook.participant",
        json!({ "viewerId": roster.adams, "participationId": roster.young }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "v4",
        "gradebook.participant",
        json!({ "viewerId": roster.observer }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "v5",
        "gradebook.participant",
        json!({ "viewerId": roster.dropped }),
    );
    assert_eq!(code, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn course_gradebook_is_staff_only_and_sorted_by_name() {
    let workspace = temp_dir("gradebookd-views-course");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);

    let hw1 = create_opportunity(
        &mut stdin,
        &mut reader,
        "o1",
        json!({ "courseId": roster.course_id, "identifier": "hw1" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.record",
        json!({
            "viewerId": roster.instructor,
            "participationId": roster.brown,
            "opportunityId": hw1,
            "state": "exempt",
            "now": "2025-02-01T10:00:00Z"
        }),
    );

    for (id, viewer) in [("c1", &roster.adams), ("c2", &roster.observer)] {
        let code = request_err_code(
            &mut stdin,
            &mut reader,
            id,
            "gradebook.course",
            json!({ "viewerId": viewer }),
        );
        assert_eq!(code, "forbidden");
    }

    let book = request_ok(
        &mut stdin,
        &mut reader,
        "c3",
        "gradebook.course",
        json!({ "viewerId": roster.ta }),
    );
    assert_eq!(
        last_names(&book["rows"]),
        vec!["Adams", "brown", "Watts", "Xu", "Young", "Zimmer"]
    );
    assert_eq!(book["opportunities"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(book["rows"][1]["grades"][0]["display"], "(exempt)");
    assert_eq!(book["rows"][0]["grades"][0]["machineReadable"], "NONE");

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "c4",
        "gradebook.course",
        json!({ "viewerId": roster.ta, "includeInactive": true }),
    );
    assert_eq!(
        last_names(&all["rows"]),
        vec!["Adams", "brown", "Doe", "Watts", "Xu", "Young", "Zimmer"]
    );

    let csv = request_ok(
        &mut stdin,
        &mut reader,
        "c5",
        "gradebook.exportCsv",
        json!({ "viewerId": roster.instructor }),
    );
    let text = csv["csv"].as_str().expect("csv text");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("last_name,first_name,email,hw1"));
    assert_eq!(lines.next(), Some("Adams,Ann,aa@example.edu,NONE"));
    assert_eq!(lines.next(), Some("brown,Ben,bb@example.edu,EXEMPT"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn opportunity_view_lists_batch_rules_for_instructors() {
    let workspace = temp_dir("gradebookd-views-opportunity");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);

    let quiz = create_opportunity(
        &mut stdin,
        &mut reader,
        "o1",
        json!({ "courseId": roster.course_id, "identifier": "quiz1", "flowId": "quiz1" }),
    );
    for (id, who, rule) in [
        ("s1", &roster.adams, json!("late")),
        ("s2", &roster.young, json!(null)),
        ("s3", &roster.brown, json!("early")),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "sessions.start",
            json!({
                "courseId": roster.course_id,
                "participationId": who,
                "flowId": "quiz1",
                "accessRulesId": rule,
                "now": "2025-02-01T09:00:00Z"
            }),
        );
    }

    let as_instructor = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "gradebook.opportunity",
        json!({ "viewerId": roster.instructor, "opportunityId": quiz }),
    );
    assert_eq!(
        as_instructor["batchRuleIds"],
        json!(["<<<NONE>>>", "early", "late"])
    );
    let adams_row = &as_instructor["rows"][0];
    assert_eq!(adams_row["participation"]["lastName"], "Adams");
    assert_eq!(adams_row["flowSessions"].as_array().map(|a| a.len()), Some(1));

    let as_ta = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "gradebook.opportunity",
        json!({ "viewerId": roster.ta, "opportunityId": quiz }),
    );
    assert!(as_ta.get("batchRuleIds").is_none());

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "v3",
        "gradebook.opportunity",
        json!({ "viewerId": roster.young, "opportunityId": quiz }),
    );
    assert_eq!(code, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn views_reject_objects_from_other_courses() {
    let workspace = temp_dir("gradebookd-views-wrong-course");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let roster = seed_roster(&mut stdin, &mut reader, &workspace);

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "k1",
        "courses.create",
        json!({ "identifier": "cs202", "name": "Systems" }),
    );
    let other_course = other["courseId"].as_str().expect("courseId").to_string();
    let foreign = create_opportunity(
        &mut stdin,
        &mut reader,
        "k2",
        json!({ "courseId": other_course, "identifier": "hw1" }),
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "k3",
        "gradebook.opportunity",
        json!({ "viewerId": roster.instructor, "opportunityId": foreign }),
    );
    assert_eq!(code, "wrong_course");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "k4",
        "gradebook.single",
        json!({
            "viewerId": roster.instructor,
            "participationId": roster.adams,
            "opportunityId": foreign
        }),
    );
    assert_eq!(code, "wrong_course");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "k5",
        "gradebook.single",
        json!({
            "viewerId": roster.instructor,
            "participationId": roster.adams,
            "opportunityId": "no-such-opportunity"
        }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}
