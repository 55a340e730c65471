use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, ensure_course_teacher, not_found, opt_bool, opt_f64,
    opt_i64, opt_str, parse_timestamp, req_f64, req_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{AssignmentPolicy, SubmissionType};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Policy fields as they arrive on the wire, before validation.
struct PolicyParams {
    due_date: String,
    max_points: f64,
    submission_type: SubmissionType,
    allow_late_submission: bool,
    late_penalty: f64,
    allow_resubmission: bool,
    max_resubmissions: i64,
    resubmission_deadline: Option<String>,
}

fn parse_policy_params(params: &serde_json::Value) -> Result<PolicyParams, HandlerErr> {
    let due_date = req_str(params, "dueDate")?;
    parse_timestamp("dueDate", &due_date)?;

    let submission_type_raw = req_str(params, "submissionType")?;
    let submission_type = SubmissionType::parse(&submission_type_raw).ok_or_else(|| {
        HandlerErr::new(
            "validation_error",
            "submissionType must be one of: text, file_upload, both",
        )
        .with_details(json!({ "field": "submissionType", "value": submission_type_raw }))
    })?;

    let resubmission_deadline = opt_str(params, "resubmissionDeadline");
    if let Some(raw) = resubmission_deadline.as_deref() {
        parse_timestamp("resubmissionDeadline", raw)?;
    }

    Ok(PolicyParams {
        due_date,
        max_points: req_f64(params, "maxPoints")?,
        submission_type,
        allow_late_submission: opt_bool(params, "allowLateSubmission").unwrap_or(false),
        late_penalty: opt_f64(params, "latePenalty").unwrap_or(0.0),
        allow_resubmission: opt_bool(params, "allowResubmission").unwrap_or(false),
        max_resubmissions: opt_i64(params, "maxResubmissions").unwrap_or(1),
        resubmission_deadline,
    })
}

fn validate_policy(p: &PolicyParams) -> Result<(), HandlerErr> {
    let policy = AssignmentPolicy {
        due_date: parse_timestamp("dueDate", &p.due_date)?,
        max_points: p.max_points,
        submission_type: p.submission_type,
        allow_late_submission: p.allow_late_submission,
        late_penalty: p.late_penalty,
        allow_resubmission: p.allow_resubmission,
        max_resubmissions: p.max_resubmissions,
        resubmission_deadline: None,
    };
    policy.validate()?;
    Ok(())
}

/// Loads the policy slice the lifecycle guards consult, plus the owning course.
pub(crate) fn fetch_policy(
    conn: &Connection,
    assignment_id: &str,
) -> Result<(AssignmentPolicy, String), HandlerErr> {
    let row = conn
        .query_row(
            "SELECT course_id, due_date, max_points, submission_type, allow_late_submission,
                    late_penalty, allow_resubmission, max_resubmissions, resubmission_deadline
             FROM assignments WHERE id = ?",
            [assignment_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, bool>(4)?,
                    r.get::<_, f64>(5)?,
                    r.get::<_, bool>(6)?,
                    r.get::<_, i64>(7)?,
                    r.get::<_, Option<String>>(8)?,
                ))
            },
        )
        .optional()
        .map_err(db_query)?;

    let (
        course_id,
        due_date,
        max_points,
        submission_type,
        allow_late_submission,
        late_penalty,
        allow_resubmission,
        max_resubmissions,
        resubmission_deadline,
    ) = row.ok_or_else(|| {
        not_found("assignment not found", json!({ "assignmentId": assignment_id }))
    })?;

    let submission_type = SubmissionType::parse(&submission_type).ok_or_else(|| {
        HandlerErr::new("db_query_failed", "stored submissionType is invalid")
            .with_details(json!({ "value": submission_type }))
    })?;
    let due_date = parse_timestamp("dueDate", &due_date)?;
    let resubmission_deadline = match resubmission_deadline {
        Some(raw) => Some(parse_timestamp("resubmissionDeadline", &raw)?),
        None => None,
    };

    Ok((
        AssignmentPolicy {
            due_date,
            max_points,
            submission_type,
            allow_late_submission,
            late_penalty,
            allow_resubmission,
            max_resubmissions,
            resubmission_deadline,
        },
        course_id,
    ))
}

fn assignment_json(conn: &Connection, assignment_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, course_id, title, instructions, due_date, max_points, submission_type,
                allow_late_submission, late_penalty, allow_resubmission, max_resubmissions,
                resubmission_deadline, created_at, updated_at
         FROM assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "instructions": r.get::<_, Option<String>>(3)?,
                "dueDate": r.get::<_, String>(4)?,
                "maxPoints": r.get::<_, f64>(5)?,
                "submissionType": r.get::<_, String>(6)?,
                "allowLateSubmission": r.get::<_, bool>(7)?,
                "latePenalty": r.get::<_, f64>(8)?,
                "allowResubmission": r.get::<_, bool>(9)?,
                "maxResubmissions": r.get::<_, i64>(10)?,
                "resubmissionDeadline": r.get::<_, Option<String>>(11)?,
                "createdAt": r.get::<_, String>(12)?,
                "updatedAt": r.get::<_, String>(13)?,
            }))
        },
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| not_found("assignment not found", json!({ "assignmentId": assignment_id })))
}

fn create_assignment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = req_str(params, "courseId")?;
    let acting = actor(params)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let title = req_str(params, "title")?;
    if title.trim().is_empty() {
        return Err(HandlerErr::new("validation_error", "title must not be empty")
            .with_details(json!({ "field": "title" })));
    }
    let instructions = opt_str(params, "instructions");
    let policy = parse_policy_params(params)?;
    validate_policy(&policy)?;

    let assignment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO assignments(
            id, course_id, title, instructions, due_date, max_points, submission_type,
            allow_late_submission, late_penalty, allow_resubmission, max_resubmissions,
            resubmission_deadline, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            assignment_id,
            course_id,
            title.trim(),
            instructions,
            policy.due_date,
            policy.max_points,
            policy.submission_type.as_str(),
            policy.allow_late_submission,
            policy.late_penalty,
            policy.allow_resubmission,
            policy.max_resubmissions,
            policy.resubmission_deadline,
            now,
            now,
        ],
    )
    .map_err(|e| db_insert(e, "assignments"))?;

    Ok(json!({ "assignmentId": assignment_id }))
}

fn update_assignment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = req_str(params, "assignmentId")?;
    let acting = actor(params)?;
    let (_, course_id) = fetch_policy(conn, &assignment_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let title = req_str(params, "title")?;
    if title.trim().is_empty() {
        return Err(HandlerErr::new("validation_error", "title must not be empty")
            .with_details(json!({ "field": "title" })));
    }
    let instructions = opt_str(params, "instructions");
    let policy = parse_policy_params(params)?;
    validate_policy(&policy)?;

    conn.execute(
        "UPDATE assignments SET
            title = ?, instructions = ?, due_date = ?, max_points = ?, submission_type = ?,
            allow_late_submission = ?, late_penalty = ?, allow_resubmission = ?,
            max_resubmissions = ?, resubmission_deadline = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            title.trim(),
            instructions,
            policy.due_date,
            policy.max_points,
            policy.submission_type.as_str(),
            policy.allow_late_submission,
            policy.late_penalty,
            policy.allow_resubmission,
            policy.max_resubmissions,
            policy.resubmission_deadline,
            Utc::now().to_rfc3339(),
            assignment_id,
        ],
    )
    .map_err(|e| db_update(e, "assignments"))?;

    assignment_json(conn, &assignment_id)
}

fn list_assignments(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = req_str(params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               a.id,
               a.title,
               a.due_date,
               a.max_points,
               a.submission_type,
               (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id) AS submission_count
             FROM assignments a
             WHERE a.course_id = ?
             ORDER BY a.due_date, a.title",
        )
        .map_err(db_query)?;

    let rows = stmt
        .query_map([&course_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "dueDate": row.get::<_, String>(2)?,
                "maxPoints": row.get::<_, f64>(3)?,
                "submissionType": row.get::<_, String>(4)?,
                "submissionCount": row.get::<_, i64>(5)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    Ok(json!({ "assignments": rows }))
}

fn delete_assignment(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = req_str(params, "assignmentId")?;
    let acting = actor(params)?;
    let (_, course_id) = fetch_policy(conn, &assignment_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    // Purge submissions and their full history with the assignment.
    let tx = conn.transaction().map_err(db_query)?;
    tx.execute(
        "DELETE FROM feedback_entries WHERE submission_id IN
           (SELECT id FROM submissions WHERE assignment_id = ?)",
        [&assignment_id],
    )
    .map_err(|e| db_update(e, "feedback_entries"))?;
    tx.execute(
        "DELETE FROM submission_versions WHERE submission_id IN
           (SELECT id FROM submissions WHERE assignment_id = ?)",
        [&assignment_id],
    )
    .map_err(|e| db_update(e, "submission_versions"))?;
    tx.execute(
        "DELETE FROM submissions WHERE assignment_id = ?",
        [&assignment_id],
    )
    .map_err(|e| db_update(e, "submissions"))?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id])
        .map_err(|e| db_update(e, "assignments"))?;
    tx.commit().map_err(db_query)?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" | "assignments.update" | "assignments.get" | "assignments.list" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "assignments.create" => create_assignment(conn, &req.params),
                "assignments.update" => update_assignment(conn, &req.params),
                "assignments.get" => req_str(&req.params, "assignmentId")
                    .and_then(|id| assignment_json(conn, &id)),
                _ => list_assignments(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "assignments.delete" => {
            let Some(conn) = state.db.as_mut() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match delete_assignment(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
