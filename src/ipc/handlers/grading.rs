use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, ensure_course_teacher, opt_f64, opt_str, req_f64,
    req_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, SubmissionStatus};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use super::assignments::fetch_policy;
use super::submissions::{fetch_submission, feedback_history, submission_json, SubmissionRow};

fn authorize_teacher(
    conn: &Connection,
    params: &serde_json::Value,
    row: &SubmissionRow,
) -> Result<(), HandlerErr> {
    let acting = actor(params)?;
    let (_, course_id) = fetch_policy(conn, &row.assignment_id)?;
    ensure_course_teacher(conn, &course_id, &acting)
}

fn append_entry(
    conn: &mut Connection,
    row: &SubmissionRow,
    grade: Option<f64>,
    effective: Option<f64>,
    feedback: Option<&str>,
    new_status: Option<SubmissionStatus>,
) -> Result<(), HandlerErr> {
    let entry_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    // Entry append and mirror refresh are one atomic step, so the submission's
    // current fields always reflect the newest entry.
    let tx = conn.transaction().map_err(db_query)?;
    tx.execute(
        "INSERT INTO feedback_entries(
            id, submission_id, version, grade, effective_grade, feedback, graded_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            entry_id,
            row.id,
            row.current_version,
            grade,
            effective,
            feedback,
            now,
        ],
    )
    .map_err(|e| db_insert(e, "feedback_entries"))?;
    tx.execute(
        "UPDATE submissions SET grade = ?, effective_grade = ?, feedback = ?, graded_at = ?,
            status = COALESCE(?, status)
         WHERE id = ?",
        rusqlite::params![
            grade,
            effective,
            feedback,
            now,
            new_status.map(|s| s.as_str()),
            row.id,
        ],
    )
    .map_err(|e| db_update(e, "submissions"))?;
    tx.commit().map_err(db_query)?;
    Ok(())
}

fn handle_grade(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let row = fetch_submission(conn, &submission_id)?;
    authorize_teacher(conn, params, &row)?;

    let (policy, _) = fetch_policy(conn, &row.assignment_id)?;
    lifecycle::check_gradeable(row.status)?;

    let grade = req_f64(params, "grade")?;
    lifecycle::check_grade_value(grade, policy.max_points)?;
    let effective = lifecycle::effective_grade(grade, row.is_late, &policy);
    // A grade-only call leaves the entry's feedback NULL rather than blank.
    let feedback = opt_str(params, "feedback").filter(|f| !f.trim().is_empty());

    append_entry(
        conn,
        &row,
        Some(grade),
        Some(effective),
        feedback.as_deref(),
        Some(SubmissionStatus::Graded),
    )?;

    Ok(submission_json(&fetch_submission(conn, &submission_id)?))
}

fn handle_add_feedback(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let row = fetch_submission(conn, &submission_id)?;
    authorize_teacher(conn, params, &row)?;

    let feedback = req_str(params, "feedback")?;
    if feedback.trim().is_empty() {
        return Err(
            HandlerErr::new("validation_error", "feedback text must not be empty")
                .with_details(json!({ "field": "feedback" })),
        );
    }

    // Commentary without a fresh mark: carry the current grade forward so the
    // newest entry still mirrors the submission's grade fields.
    let (grade, effective) = match opt_f64(params, "grade") {
        Some(g) => {
            let (policy, _) = fetch_policy(conn, &row.assignment_id)?;
            lifecycle::check_grade_value(g, policy.max_points)?;
            (Some(g), Some(lifecycle::effective_grade(g, row.is_late, &policy)))
        }
        None => (row.grade, row.effective_grade),
    };

    append_entry(conn, &row, grade, effective, Some(feedback.as_str()), None)?;

    let mut out = submission_json(&fetch_submission(conn, &submission_id)?);
    out["feedbackEntries"] = json!(feedback_history(conn, &submission_id)?);
    Ok(out)
}

fn handle_return(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req_str(params, "submissionId")?;
    let row = fetch_submission(conn, &submission_id)?;
    authorize_teacher(conn, params, &row)?;

    lifecycle::check_returnable(row.status)?;
    conn.execute(
        "UPDATE submissions SET status = ? WHERE id = ?",
        rusqlite::params![SubmissionStatus::Returned.as_str(), submission_id],
    )
    .map_err(|e| db_update(e, "submissions"))?;

    Ok(submission_json(&fetch_submission(conn, &submission_id)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.grade" | "grading.addFeedback" => {
            let Some(conn) = state.db.as_mut() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "grading.grade" => handle_grade(conn, &req.params),
                _ => handle_add_feedback(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "grading.return" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match handle_return(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
