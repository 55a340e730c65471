use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, bad_params, db_insert, db_query, db_update, ensure_course_teacher, not_found, opt_str,
    req_str, Actor, HandlerErr, Role,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, FileRef, SubmissionContent, SubmissionStatus};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::assignments::fetch_policy;

pub(crate) struct SubmissionRow {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub current_version: i64,
    pub status: SubmissionStatus,
    pub text_submission: Option<String>,
    pub file_submissions: String,
    pub submitted_at: String,
    pub is_late: bool,
    pub grade: Option<f64>,
    pub effective_grade: Option<f64>,
    pub feedback: Option<String>,
    pub graded_at: Option<String>,
}

pub(crate) fn fetch_submission(
    conn: &Connection,
    submission_id: &str,
) -> Result<SubmissionRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, assignment_id, student_id, current_version, status, text_submission,
                    file_submissions, submitted_at, is_late, grade, effective_grade, feedback,
                    graded_at
             FROM submissions WHERE id = ?",
            [submission_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, bool>(8)?,
                    r.get::<_, Option<f64>>(9)?,
                    r.get::<_, Option<f64>>(10)?,
                    r.get::<_, Option<String>>(11)?,
                    r.get::<_, Option<String>>(12)?,
                ))
            },
        )
        .optional()
        .map_err(db_query)?;

    let raw = row.ok_or_else(|| {
        not_found("submission not found", json!({ "submissionId": submission_id }))
    })?;
    let status = SubmissionStatus::parse(&raw.4).ok_or_else(|| {
        HandlerErr::new("db_query_failed", "stored submission status is invalid")
            .with_details(json!({ "value": raw.4 }))
    })?;

    Ok(SubmissionRow {
        id: raw.0,
        assignment_id: raw.1,
        student_id: raw.2,
        current_version: raw.3,
        status,
        text_submission: raw.5,
        file_submissions: raw.6,
        submitted_at: raw.7,
        is_late: raw.8,
        grade: raw.9,
        effective_grade: raw.10,
        feedback: raw.11,
        graded_at: raw.12,
    })
}

pub(crate) fn submission_json(row: &SubmissionRow) -> serde_json::Value {
    let files: serde_json::Value =
        serde_json::from_str(&row.file_submissions).unwrap_or_else(|_| json!([]));
    json!({
        "id": row.id,
        "assignmentId": row.assignment_id,
        "studentId": row.student_id,
        "currentVersion": row.current_version,
        "status": row.status.as_str(),
        "textSubmission": row.text_submission,
        "fileSubmissions": files,
        "submittedAt": row.submitted_at,
        "isLate": row.is_late,
        "grade": row.grade,
        "effectiveGrade": row.effective_grade,
        "feedback": row.feedback,
        "gradedAt": row.graded_at,
    })
}

/// Owning student, or a teacher of the assignment's course.
pub(crate) fn ensure_submission_access(
    conn: &Connection,
    row: &SubmissionRow,
    acting: &Actor,
) -> Result<(), HandlerErr> {
    match acting.role {
        Role::Student => {
            if acting.user_id == row.student_id {
                Ok(())
            } else {
                Err(HandlerErr::new(
                    "authorization_denied",
                    "only the owning student may view this submission",
                ))
            }
        }
        Role::Teacher => {
            let (_, course_id) = fetch_policy(conn, &row.assignment_id)?;
            ensure_course_teacher(conn, &course_id, acting)
        }
    }
}

fn parse_content_params(
    params: &serde_json::Value,
) -> Result<(Option<String>, Vec<FileRef>), HandlerErr> {
    let content = params
        .get("content")
        .ok_or_else(|| bad_params("missing content"))?;
    let text = content
        .get("text")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let files: Vec<FileRef> = match content.get("files") {
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            bad_params("invalid content.files")
                .with_details(json!({ "parseError": e.to_string() }))
        })?,
        None => Vec::new(),
    };
    Ok((text, files))
}

fn files_to_json(content: &SubmissionContent) -> Result<String, HandlerErr> {
    serde_json::to_string(content.files())
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))
}

fn handle_submit(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = req_str(params, "assignmentId")?;
    let acting = actor(params)?;
    acting.require_student()?;

    let (policy, _course_id) = fetch_policy(conn, &assignment_id)?;

    let (text, files) = parse_content_params(params)?;
    let content = lifecycle::validate_content(policy.submission_type, text.as_deref(), files)?;
    let comments = opt_str(params, "comments");

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &acting.user_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if let Some(submission_id) = existing {
        return Err(HandlerErr::new(
            "validation_error",
            "a submission already exists for this assignment; use submissions.resubmit",
        )
        .with_details(json!({ "submissionId": submission_id })));
    }

    let now = Utc::now();
    let is_late = lifecycle::check_submit(&policy, now)?;

    let submission_id = Uuid::new_v4().to_string();
    let version_id = Uuid::new_v4().to_string();
    let now_str = now.to_rfc3339();
    let files_json = files_to_json(&content)?;

    let tx = conn.transaction().map_err(db_query)?;
    tx.execute(
        "INSERT INTO submissions(
            id, assignment_id, student_id, current_version, status, text_submission,
            file_submissions, submitted_at, is_late
         ) VALUES(?, ?, ?, 1, ?, ?, ?, ?, ?)",
        rusqlite::params![
            submission_id,
            assignment_id,
            acting.user_id,
            SubmissionStatus::Submitted.as_str(),
            content.text(),
            files_json,
            now_str,
            is_late,
        ],
    )
    .map_err(|e| db_insert(e, "submissions"))?;
    tx.execute(
        "INSERT INTO submission_versions(
            id, submission_id, version, submitted_at, text_submission, file_submissions, comments
         ) VALUES(?, ?, 1, ?, ?, ?, ?)",
        rusqlite::params![
            version_id,
            submission_id,
            now_str,
            content.text(),
            files_json,
            comments,
        ],
    )
    .map_err(|e| db_insert(e, "submission_versions"))?;
    tx.commit().map_err(db_query)?;

    Ok(submission_json(&fetch_submission(conn, &submission_id)?))
}

fn handle_resubmit(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let acting = actor(params)?;
    acting.require_student()?;

    let row = fetch_submission(conn, &submission_id)?;
    if row.student_id != acting.user_id {
        return Err(HandlerErr::new(
            "authorization_denied",
            "only the owning student may resubmit",
        ));
    }

    let (policy, _course_id) = fetch_policy(conn, &row.assignment_id)?;
    let (text, files) = parse_content_params(params)?;
    let content = lifecycle::validate_content(policy.submission_type, text.as_deref(), files)?;
    let comments = opt_str(params, "comments");

    let now = Utc::now();
    // All guards run before any write; a violation leaves the row untouched.
    let is_late = lifecycle::check_resubmit(&policy, row.current_version, now)?;

    let new_version = row.current_version + 1;
    let version_id = Uuid::new_v4().to_string();
    let now_str = now.to_rfc3339();
    let files_json = files_to_json(&content)?;

    let tx = conn.transaction().map_err(db_query)?;
    tx.execute(
        "INSERT INTO submission_versions(
            id, submission_id, version, submitted_at, text_submission, file_submissions, comments
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            version_id,
            submission_id,
            new_version,
            now_str,
            content.text(),
            files_json,
            comments,
        ],
    )
    .map_err(|e| db_insert(e, "submission_versions"))?;
    // The UNIQUE(submission_id, version) constraint doubles as a
    // compare-and-increment: the update only lands if the insert did.
    tx.execute(
        "UPDATE submissions SET current_version = ?, status = ?, text_submission = ?,
            file_submissions = ?, submitted_at = ?, is_late = ?
         WHERE id = ? AND current_version = ?",
        rusqlite::params![
            new_version,
            SubmissionStatus::Resubmitted.as_str(),
            content.text(),
            files_json,
            now_str,
            is_late,
            submission_id,
            row.current_version,
        ],
    )
    .map_err(|e| db_update(e, "submissions"))?;
    tx.commit().map_err(db_query)?;

    Ok(submission_json(&fetch_submission(conn, &submission_id)?))
}

fn version_history(
    conn: &Connection,
    submission_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT version, submitted_at, text_submission, file_submissions, comments
             FROM submission_versions WHERE submission_id = ? ORDER BY version",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([submission_id], |row| {
            let files_raw: String = row.get(3)?;
            Ok(json!({
                "version": row.get::<_, i64>(0)?,
                "submittedAt": row.get::<_, String>(1)?,
                "textSubmission": row.get::<_, Option<String>>(2)?,
                "fileSubmissions": serde_json::from_str::<serde_json::Value>(&files_raw)
                    .unwrap_or_else(|_| json!([])),
                "comments": row.get::<_, Option<String>>(4)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;
    Ok(rows)
}

pub(crate) fn feedback_history(
    conn: &Connection,
    submission_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    // rowid preserves append order even when two entries share a timestamp.
    let mut stmt = conn
        .prepare(
            "SELECT version, grade, effective_grade, feedback, graded_at
             FROM feedback_entries WHERE submission_id = ? ORDER BY rowid",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([submission_id], |row| {
            Ok(json!({
                "version": row.get::<_, i64>(0)?,
                "grade": row.get::<_, Option<f64>>(1)?,
                "effectiveGrade": row.get::<_, Option<f64>>(2)?,
                "feedback": row.get::<_, Option<String>>(3)?,
                "gradedAt": row.get::<_, String>(4)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;
    Ok(rows)
}

fn handle_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let acting = actor(params)?;
    let row = fetch_submission(conn, &submission_id)?;
    ensure_submission_access(conn, &row, &acting)?;

    let mut out = submission_json(&row);
    out["versions"] = json!(version_history(conn, &submission_id)?);
    out["feedbackEntries"] = json!(feedback_history(conn, &submission_id)?);
    Ok(out)
}

fn handle_list_for_assignment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = req_str(params, "assignmentId")?;
    let acting = actor(params)?;
    let (_, course_id) = fetch_policy(conn, &assignment_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, current_version, status, submitted_at, is_late,
                    grade, effective_grade
             FROM submissions WHERE assignment_id = ? ORDER BY submitted_at",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([&assignment_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "currentVersion": row.get::<_, i64>(2)?,
                "status": row.get::<_, String>(3)?,
                "submittedAt": row.get::<_, String>(4)?,
                "isLate": row.get::<_, bool>(5)?,
                "grade": row.get::<_, Option<f64>>(6)?,
                "effectiveGrade": row.get::<_, Option<f64>>(7)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    Ok(json!({ "submissions": rows }))
}

fn handle_delete(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let acting = actor(params)?;
    let row = fetch_submission(conn, &submission_id)?;
    let (_, course_id) = fetch_policy(conn, &row.assignment_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    // Irreversible: purges the record with all versions and feedback.
    let tx = conn.transaction().map_err(db_query)?;
    tx.execute(
        "DELETE FROM feedback_entries WHERE submission_id = ?",
        [&submission_id],
    )
    .map_err(|e| db_update(e, "feedback_entries"))?;
    tx.execute(
        "DELETE FROM submission_versions WHERE submission_id = ?",
        [&submission_id],
    )
    .map_err(|e| db_update(e, "submission_versions"))?;
    tx.execute("DELETE FROM submissions WHERE id = ?", [&submission_id])
        .map_err(|e| db_update(e, "submissions"))?;
    tx.commit().map_err(db_query)?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.submit" | "submissions.resubmit" | "submissions.delete" => {
            let Some(conn) = state.db.as_mut() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "submissions.submit" => handle_submit(conn, &req.params),
                "submissions.resubmit" => handle_resubmit(conn, &req.params),
                _ => handle_delete(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "submissions.get" | "submissions.listForAssignment" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "submissions.get" => handle_get(conn, &req.params),
                _ => handle_list_for_assignment(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
