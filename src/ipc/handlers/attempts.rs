use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, bad_params, db_insert, db_query, db_update, ensure_course_teacher, not_found, opt_f64,
    opt_i64, opt_str, req_str, Actor, HandlerErr, Role,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, SubmittedAnswer};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::quizzes::{fetch_quiz_course, load_question_bank};

struct AttemptRow {
    id: String,
    quiz_id: String,
    student_id: String,
    attempt_number: i64,
    answers: String,
    score: f64,
    total_points: f64,
    percentage: i64,
    time_spent: i64,
    started_at: String,
    submitted_at: Option<String>,
    is_completed: bool,
    teacher_grade: Option<f64>,
    teacher_feedback: Option<String>,
}

fn fetch_attempt(conn: &Connection, attempt_id: &str) -> Result<AttemptRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, quiz_id, student_id, attempt_number, answers, score, total_points,
                    percentage, time_spent, started_at, submitted_at, is_completed,
                    teacher_grade, teacher_feedback
             FROM quiz_attempts WHERE id = ?",
            [attempt_id],
            |r| {
                Ok(AttemptRow {
                    id: r.get(0)?,
                    quiz_id: r.get(1)?,
                    student_id: r.get(2)?,
                    attempt_number: r.get(3)?,
                    answers: r.get(4)?,
                    score: r.get(5)?,
                    total_points: r.get(6)?,
                    percentage: r.get(7)?,
                    time_spent: r.get(8)?,
                    started_at: r.get(9)?,
                    submitted_at: r.get(10)?,
                    is_completed: r.get(11)?,
                    teacher_grade: r.get(12)?,
                    teacher_feedback: r.get(13)?,
                })
            },
        )
        .optional()
        .map_err(db_query)?;
    row.ok_or_else(|| not_found("quiz attempt not found", json!({ "attemptId": attempt_id })))
}

fn attempt_json(row: &AttemptRow) -> serde_json::Value {
    let answers: serde_json::Value =
        serde_json::from_str(&row.answers).unwrap_or_else(|_| json!([]));
    json!({
        "id": row.id,
        "quizId": row.quiz_id,
        "studentId": row.student_id,
        "attemptNumber": row.attempt_number,
        "answers": answers,
        "score": row.score,
        "totalPoints": row.total_points,
        "percentage": row.percentage,
        "timeSpent": row.time_spent,
        "startedAt": row.started_at,
        "submittedAt": row.submitted_at,
        "isCompleted": row.is_completed,
        "teacherGrade": row.teacher_grade,
        "teacherFeedback": row.teacher_feedback,
    })
}

fn ensure_attempt_access(
    conn: &Connection,
    row: &AttemptRow,
    acting: &Actor,
) -> Result<(), HandlerErr> {
    match acting.role {
        Role::Student => {
            if acting.user_id == row.student_id {
                Ok(())
            } else {
                Err(HandlerErr::new(
                    "authorization_denied",
                    "only the owning student may view this attempt",
                ))
            }
        }
        Role::Teacher => {
            let course_id = fetch_quiz_course(conn, &row.quiz_id)?;
            ensure_course_teacher(conn, &course_id, acting)
        }
    }
}

fn handle_start(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let quiz_id = req_str(params, "quizId")?;
    let acting = actor(params)?;
    acting.require_student()?;
    fetch_quiz_course(conn, &quiz_id)?;

    let attempt_id = Uuid::new_v4().to_string();
    let started_at = Utc::now().to_rfc3339();

    // The attempt counter is owned by the (quiz, student) pair; allocating it
    // inside the insert transaction keeps it gapless, and the UNIQUE
    // constraint rejects a collision outright.
    let tx = conn.transaction().map_err(db_query)?;
    let attempt_number: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM quiz_attempts
             WHERE quiz_id = ? AND student_id = ?",
            (&quiz_id, &acting.user_id),
            |r| r.get(0),
        )
        .map_err(db_query)?;
    tx.execute(
        "INSERT INTO quiz_attempts(id, quiz_id, student_id, attempt_number, started_at)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![attempt_id, quiz_id, acting.user_id, attempt_number, started_at],
    )
    .map_err(|e| db_insert(e, "quiz_attempts"))?;
    tx.commit().map_err(db_query)?;

    Ok(json!({
        "attemptId": attempt_id,
        "attemptNumber": attempt_number,
        "startedAt": started_at,
    }))
}

fn handle_submit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = req_str(params, "attemptId")?;
    let acting = actor(params)?;
    acting.require_student()?;

    let row = fetch_attempt(conn, &attempt_id)?;
    if row.student_id != acting.user_id {
        return Err(HandlerErr::new(
            "authorization_denied",
            "only the owning student may submit this attempt",
        ));
    }
    if row.is_completed {
        return Err(HandlerErr::new(
            "validation_error",
            "attempt has already been submitted",
        )
        .with_details(json!({ "attemptId": attempt_id })));
    }

    let answers_value = params
        .get("answers")
        .ok_or_else(|| bad_params("missing answers"))?;
    let answers: Vec<SubmittedAnswer> =
        serde_json::from_value(answers_value.clone()).map_err(|e| {
            bad_params("invalid answers").with_details(json!({ "parseError": e.to_string() }))
        })?;
    let time_spent = opt_i64(params, "timeSpent").unwrap_or(0);

    let bank = load_question_bank(conn, &row.quiz_id)?;
    let result = scoring::score_attempt(&answers, &bank)?;

    let answers_json = serde_json::to_string(&result.answers)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    conn.execute(
        "UPDATE quiz_attempts SET answers = ?, score = ?, total_points = ?, percentage = ?,
            time_spent = ?, submitted_at = ?, is_completed = 1
         WHERE id = ? AND is_completed = 0",
        rusqlite::params![
            answers_json,
            result.score,
            result.total_points,
            result.percentage,
            time_spent,
            Utc::now().to_rfc3339(),
            attempt_id,
        ],
    )
    .map_err(|e| db_update(e, "quiz_attempts"))?;

    Ok(attempt_json(&fetch_attempt(conn, &attempt_id)?))
}

fn handle_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = req_str(params, "attemptId")?;
    let acting = actor(params)?;
    let row = fetch_attempt(conn, &attempt_id)?;
    ensure_attempt_access(conn, &row, &acting)?;
    Ok(attempt_json(&row))
}

fn handle_list_for_quiz(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let quiz_id = req_str(params, "quizId")?;
    let acting = actor(params)?;
    let course_id = fetch_quiz_course(conn, &quiz_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, attempt_number, score, total_points, percentage,
                    is_completed, submitted_at, teacher_grade
             FROM quiz_attempts WHERE quiz_id = ?
             ORDER BY student_id, attempt_number",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([&quiz_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "attemptNumber": row.get::<_, i64>(2)?,
                "score": row.get::<_, f64>(3)?,
                "totalPoints": row.get::<_, f64>(4)?,
                "percentage": row.get::<_, i64>(5)?,
                "isCompleted": row.get::<_, bool>(6)?,
                "submittedAt": row.get::<_, Option<String>>(7)?,
                "teacherGrade": row.get::<_, Option<f64>>(8)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    Ok(json!({ "attempts": rows }))
}

fn handle_override(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = req_str(params, "attemptId")?;
    let acting = actor(params)?;
    let row = fetch_attempt(conn, &attempt_id)?;
    let course_id = fetch_quiz_course(conn, &row.quiz_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let teacher_grade = opt_f64(params, "teacherGrade");
    if let Some(g) = teacher_grade {
        if !g.is_finite() || g < 0.0 || g > row.total_points {
            return Err(HandlerErr::new(
                "validation_error",
                "teacherGrade must be between 0 and totalPoints",
            )
            .with_details(json!({
                "field": "teacherGrade",
                "value": g,
                "totalPoints": row.total_points,
            })));
        }
    }
    let teacher_feedback = opt_str(params, "teacherFeedback");

    // Last-write-wins: each call fully replaces the prior override. The
    // automatic score, percentage and per-answer flags are never touched.
    conn.execute(
        "UPDATE quiz_attempts SET teacher_grade = ?, teacher_feedback = ? WHERE id = ?",
        rusqlite::params![teacher_grade, teacher_feedback, attempt_id],
    )
    .map_err(|e| db_update(e, "quiz_attempts"))?;

    Ok(attempt_json(&fetch_attempt(conn, &attempt_id)?))
}

fn handle_rescore(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = req_str(params, "attemptId")?;
    let acting = actor(params)?;
    let row = fetch_attempt(conn, &attempt_id)?;
    let course_id = fetch_quiz_course(conn, &row.quiz_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    if !row.is_completed {
        return Err(HandlerErr::new(
            "validation_error",
            "only a submitted attempt can be rescored",
        )
        .with_details(json!({ "attemptId": attempt_id })));
    }

    // Manual re-run against the current question bank, after a bank
    // correction. The teacher override is left as-is.
    let stored: Vec<SubmittedAnswer> = serde_json::from_str(&row.answers).map_err(|e| {
        HandlerErr::new("db_query_failed", "stored answers are invalid")
            .with_details(json!({ "parseError": e.to_string() }))
    })?;
    let bank = load_question_bank(conn, &row.quiz_id)?;
    let result = scoring::score_attempt(&stored, &bank)?;

    let answers_json = serde_json::to_string(&result.answers)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    conn.execute(
        "UPDATE quiz_attempts SET answers = ?, score = ?, total_points = ?, percentage = ?
         WHERE id = ?",
        rusqlite::params![
            answers_json,
            result.score,
            result.total_points,
            result.percentage,
            attempt_id,
        ],
    )
    .map_err(|e| db_update(e, "quiz_attempts"))?;

    Ok(attempt_json(&fetch_attempt(conn, &attempt_id)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => {
            let Some(conn) = state.db.as_mut() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match handle_start(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "attempts.submit" | "attempts.get" | "attempts.listForQuiz" | "attempts.override"
        | "attempts.rescore" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "attempts.submit" => handle_submit(conn, &req.params),
                "attempts.get" => handle_get(conn, &req.params),
                "attempts.listForQuiz" => handle_list_for_quiz(conn, &req.params),
                "attempts.override" => handle_override(conn, &req.params),
                _ => handle_rescore(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
