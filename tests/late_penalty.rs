use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coursebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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

fn request_ok(
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

#[allow(dead_code)]
fn request_err(
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
    value["error"]["code"]
        .as_str()
        .expect("error code")
        .to_string()
}

#[allow(dead_code)]
fn teacher_actor() -> serde_json::Value {
    json!({ "userId": "teacher-1", "role": "teacher" })
}

#[allow(dead_code)]
fn student_actor() -> serde_json::Value {
    json!({ "userId": "student-1", "role": "student" })
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    ws: &PathBuf,
    policy: serde_json::Value,
) -> String {
    request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "setup-course",
        "courses.create",
        json!({ "name": "Chemistry", "teacherId": "teacher-1" }),
    );
    let mut params = json!({
        "courseId": course["courseId"],
        "actor": teacher_actor(),
        "title": "Problem Set",
        "maxPoints": 100.0,
        "submissionType": "text",
    });
    for (k, v) in policy.as_object().expect("policy object") {
        params[k] = v.clone();
    }
    let assignment = request_ok(stdin, reader, "setup-assignment", "assignments.create", params);
    assignment["assignmentId"].as_str().expect("id").to_string()
}

#[test]
fn late_grade_keeps_raw_mark_and_discounts_effective() {
    let ws = temp_dir("coursebookd-late");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let assignment_id = setup(
        &mut stdin,
        &mut reader,
        &ws,
        json!({
            "dueDate": "2020-01-01T00:00:00Z",
            "allowLateSubmission": true,
            "latePenalty": 10.0,
        }),
    );

    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.submit",
        json!({
            "assignmentId": assignment_id,
            "actor": student_actor(),
            "content": { "text": "Better late than never." },
        }),
    );
    assert_eq!(sub["isLate"].as_bool(), Some(true));

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.grade",
        json!({
            "submissionId": sub["id"],
            "actor": teacher_actor(),
            "grade": 90.0,
        }),
    );
    assert_eq!(graded["grade"].as_f64(), Some(90.0));
    assert_eq!(graded["effectiveGrade"].as_f64(), Some(81.0));

    drop(stdin);
    child.wait().expect("child exit");
}

#[test]
fn odd_penalty_rounds_to_one_decimal() {
    let ws = temp_dir("coursebookd-late-round");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let assignment_id = setup(
        &mut stdin,
        &mut reader,
        &ws,
        json!({
            "dueDate": "2020-01-01T00:00:00Z",
            "allowLateSubmission": true,
            "latePenalty": 15.0,
        }),
    );

    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.submit",
        json!({
            "assignmentId": assignment_id,
            "actor": student_actor(),
            "content": { "text": "late work" },
        }),
    );
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.grade",
        json!({
            "submissionId": sub["id"],
            "actor": teacher_actor(),
            "grade": 87.0,
        }),
    );
    // 87 * 0.85 = 73.95, carried at one decimal.
    assert_eq!(graded["effectiveGrade"].as_f64(), Some(74.0));

    drop(stdin);
    child.wait().expect("child exit");
}

#[test]
fn hard_cutoff_rejects_late_submissions() {
    let ws = temp_dir("coursebookd-cutoff");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let assignment_id = setup(
        &mut stdin,
        &mut reader,
        &ws,
        json!({ "dueDate": "2020-01-01T00:00:00Z" }),
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.submit",
        json!({
            "assignmentId": assignment_id,
            "actor": student_actor(),
            "content": { "text": "missed it" },
        }),
    );
    assert_eq!(code, "policy_violation");

    drop(stdin);
    child.wait().expect("child exit");
}

#[test]
fn on_time_grade_ignores_the_penalty() {
    let ws = temp_dir("coursebookd-ontime");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let assignment_id = setup(
        &mut stdin,
        &mut reader,
        &ws,
        json!({
            "dueDate": "2099-01-01T00:00:00Z",
            "allowLateSubmission": true,
            "latePenalty": 25.0,
        }),
    );

    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.submit",
        json!({
            "assignmentId": assignment_id,
            "actor": student_actor(),
            "content": { "text": "early bird" },
        }),
    );
    assert_eq!(sub["isLate"].as_bool(), Some(false));

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.grade",
        json!({
            "submissionId": sub["id"],
            "actor": teacher_actor(),
            "grade": 90.0,
        }),
    );
    assert_eq!(graded["effectiveGrade"].as_f64(), Some(90.0));

    drop(stdin);
    child.wait().expect("child exit");
}
