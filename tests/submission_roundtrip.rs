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

#[test]
fn history_survives_a_sidecar_restart() {
    let ws = temp_dir("coursebookd-roundtrip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Literature", "teacherId": "teacher-1" }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({
            "courseId": course["courseId"],
            "actor": teacher_actor(),
            "title": "Book Report",
            "dueDate": "2099-01-01T00:00:00Z",
            "maxPoints": 20.0,
            "submissionType": "text",
            "allowResubmission": true,
            "maxResubmissions": 5,
        }),
    );
    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "submissions.submit",
        json!({
            "assignmentId": assignment["assignmentId"],
            "actor": student_actor(),
            "content": { "text": "Draft one." },
        }),
    );
    let submission_id = sub["id"].as_str().expect("id").to_string();
    for (i, draft) in ["Draft two.", "Draft three."].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("5-{}", i),
            "submissions.resubmit",
            json!({
                "submissionId": submission_id,
                "actor": student_actor(),
                "content": { "text": draft },
            }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grading.grade",
        json!({
            "submissionId": submission_id,
            "actor": teacher_actor(),
            "grade": 18.0,
            "feedback": "Strong close reading.",
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grading.addFeedback",
        json!({
            "submissionId": submission_id,
            "actor": teacher_actor(),
            "feedback": "Cite page numbers next time.",
        }),
    );

    drop(stdin);
    child.wait().expect("child exit");

    // Fresh process, same workspace.
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    let full = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "submissions.get",
        json!({ "submissionId": submission_id, "actor": teacher_actor() }),
    );
    assert_eq!(full["currentVersion"].as_i64(), Some(3));
    assert_eq!(full["status"].as_str(), Some("graded"));
    assert_eq!(full["grade"].as_f64(), Some(18.0));
    assert_eq!(full["textSubmission"].as_str(), Some("Draft three."));

    let versions = full["versions"].as_array().expect("versions");
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0]["textSubmission"].as_str(), Some("Draft one."));
    assert_eq!(versions[2]["textSubmission"].as_str(), Some("Draft three."));

    let entries = full["feedbackEntries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["grade"].as_f64(), Some(18.0));

    drop(stdin);
    child.wait().expect("child exit");
}
