#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error code of a failed response, panicking on success.
pub fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// A small course: one instructor, one TA, one observer, three active
/// students and one dropped student.
pub struct Roster {
    pub course_id: String,
    pub instructor: String,
    pub ta: String,
    pub observer: String,
    pub young: String,
    pub adams: String,
    pub brown: String,
    pub dropped: String,
}

#[allow(clippy::too_many_arguments)]
fn add_participant(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    course_id: &str,
    email: &str,
    first: &str,
    last: &str,
    role: &str,
    status: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "participations.create",
        json!({
            "courseId": course_id,
            "email": email,
            "firstName": first,
            "lastName": last,
            "role": role,
            "status": status,
            "now": "2025-01-06T08:00:00Z"
        }),
    );
    res["participationId"]
        .as_str()
        .expect("participationId")
        .to_string()
}

pub fn seed_roster(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Roster {
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        json!({ "identifier": "cs101", "name": "Intro to Computing" }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();

    let instructor = add_participant(
        stdin, reader, "seed-p1", &course_id, "ivy@example.edu", "Ivy", "Zimmer",
        "instructor", "active",
    );
    let ta = add_participant(
        stdin, reader, "seed-p2", &course_id, "tom@example.edu", "Tom", "Xu",
        "teaching_assistant", "active",
    );
    let observer = add_participant(
        stdin, reader, "seed-p3", &course_id, "olga@example.edu", "Olga", "Watts",
        "observer", "active",
    );
    let young = add_participant(
        stdin, reader, "seed-p4", &course_id, "yy@example.edu", "Yara", "Young", "student",
        "active",
    );
    let adams = add_participant(
        stdin, reader, "seed-p5", &course_id, "aa@example.edu", "Ann", "Adams", "student",
        "active",
    );
    let brown = add_participant(
        stdin, reader, "seed-p6", &course_id, "bb@example.edu", "Ben", "brown", "student",
        "active",
    );
    let dropped = add_participant(
        stdin, reader, "seed-p7", &course_id, "dd@example.edu", "Dan", "Doe", "student",
        "dropped",
    );

    Roster {
        course_id,
        instructor,
        ta,
        observer,
        young,
        adams,
        brown,
        dropped,
    }
}

pub fn create_opportunity(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> String {
    let res = request_ok(stdin, reader, id, "opportunities.create", params);
    res["opportunityId"]
        .as_str()
        .expect("opportunityId")
        .to_string()
}
