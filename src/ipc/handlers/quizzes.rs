use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, ensure_course_teacher, not_found, opt_str, req_str,
    HandlerErr, Role,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{OptionSpec, QuestionKind, QuestionSpec};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

pub(crate) fn fetch_quiz_course(conn: &Connection, quiz_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT course_id FROM quizzes WHERE id = ?", [quiz_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| not_found("quiz not found", json!({ "quizId": quiz_id })))
}

/// Authoritative question data for the scoring engine, keyed by question id.
pub(crate) fn load_question_bank(
    conn: &Connection,
    quiz_id: &str,
) -> Result<HashMap<String, QuestionSpec>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, points, options, correct_answer
             FROM quiz_questions WHERE quiz_id = ?",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([quiz_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    let mut bank = HashMap::with_capacity(rows.len());
    for (id, kind_raw, points, options_raw, correct_answer) in rows {
        let kind = QuestionKind::parse(&kind_raw).ok_or_else(|| {
            HandlerErr::new("db_query_failed", "stored question kind is invalid")
                .with_details(json!({ "questionId": id, "kind": kind_raw }))
        })?;
        let options: Vec<OptionSpec> = serde_json::from_str(&options_raw).map_err(|e| {
            HandlerErr::new("db_query_failed", "stored question options are invalid")
                .with_details(json!({ "questionId": id, "parseError": e.to_string() }))
        })?;
        bank.insert(
            id.clone(),
            QuestionSpec {
                id,
                kind,
                points,
                options,
                correct_answer,
            },
        );
    }
    Ok(bank)
}

fn handle_create(
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

    let quiz_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO quizzes(id, course_id, title, description, created_at) VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![
            quiz_id,
            course_id,
            title.trim(),
            opt_str(params, "description"),
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| db_insert(e, "quizzes"))?;

    Ok(json!({ "quizId": quiz_id }))
}

fn handle_add_question(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let quiz_id = req_str(params, "quizId")?;
    let acting = actor(params)?;
    let course_id = fetch_quiz_course(conn, &quiz_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let question = params
        .get("question")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing question"))?;
    let text = question
        .get("text")
        .and_then(|v| v.as_str())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            HandlerErr::new("validation_error", "question text must not be empty")
                .with_details(json!({ "field": "question.text" }))
        })?;
    let kind_raw = question
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let kind = QuestionKind::parse(kind_raw).ok_or_else(|| {
        HandlerErr::new(
            "validation_error",
            "question kind must be one of: multiple_choice, true_false, short_answer",
        )
        .with_details(json!({ "field": "question.kind", "value": kind_raw }))
    })?;
    let points = question.get("points").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if points <= 0.0 {
        return Err(HandlerErr::new("validation_error", "question points must be > 0")
            .with_details(json!({ "field": "question.points", "value": points })));
    }

    let options: Vec<OptionSpec> = match question.get("options") {
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::new("bad_params", "invalid question.options")
                .with_details(json!({ "parseError": e.to_string() }))
        })?,
        None => Vec::new(),
    };
    let correct_answer = question
        .get("correctAnswer")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match kind {
        QuestionKind::MultipleChoice | QuestionKind::TrueFalse => {
            if options.len() < 2 {
                return Err(HandlerErr::new(
                    "validation_error",
                    "choice questions need at least two options",
                )
                .with_details(json!({ "field": "question.options" })));
            }
            if !options.iter().any(|o| o.is_correct) {
                return Err(HandlerErr::new(
                    "validation_error",
                    "choice questions need at least one correct option",
                )
                .with_details(json!({ "field": "question.options" })));
            }
        }
        QuestionKind::ShortAnswer => {
            if correct_answer.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(HandlerErr::new(
                    "validation_error",
                    "short answer questions need a correctAnswer",
                )
                .with_details(json!({ "field": "question.correctAnswer" })));
            }
        }
    }

    let next_idx: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM quiz_questions WHERE quiz_id = ?",
            [&quiz_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;

    let question_id = Uuid::new_v4().to_string();
    let options_json = serde_json::to_string(&options)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    conn.execute(
        "INSERT INTO quiz_questions(id, quiz_id, idx, text, kind, points, options, correct_answer)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            question_id,
            quiz_id,
            next_idx,
            text.trim(),
            kind.as_str(),
            points,
            options_json,
            correct_answer,
        ],
    )
    .map_err(|e| db_insert(e, "quiz_questions"))?;

    Ok(json!({ "questionId": question_id, "idx": next_idx }))
}

fn handle_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let quiz_id = req_str(params, "quizId")?;
    let acting = actor(params)?;

    let quiz = conn
        .query_row(
            "SELECT id, course_id, title, description, created_at FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "courseId": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "description": r.get::<_, Option<String>>(3)?,
                    "createdAt": r.get::<_, String>(4)?,
                }))
            },
        )
        .optional()
        .map_err(db_query)?;
    let mut quiz =
        quiz.ok_or_else(|| not_found("quiz not found", json!({ "quizId": quiz_id })))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, idx, text, kind, points, options, correct_answer
             FROM quiz_questions WHERE quiz_id = ? ORDER BY idx",
        )
        .map_err(db_query)?;
    // Students get the questions without the answer key.
    let include_answers = acting.role == Role::Teacher;
    let questions = stmt
        .query_map([&quiz_id], |row| {
            let options_raw: String = row.get(5)?;
            let mut options: serde_json::Value =
                serde_json::from_str(&options_raw).unwrap_or_else(|_| json!([]));
            if !include_answers {
                if let Some(arr) = options.as_array_mut() {
                    for opt in arr {
                        if let Some(obj) = opt.as_object_mut() {
                            obj.remove("isCorrect");
                        }
                    }
                }
            }
            let mut q = json!({
                "id": row.get::<_, String>(0)?,
                "idx": row.get::<_, i64>(1)?,
                "text": row.get::<_, String>(2)?,
                "kind": row.get::<_, String>(3)?,
                "points": row.get::<_, f64>(4)?,
                "options": options,
            });
            if include_answers {
                q["correctAnswer"] = json!(row.get::<_, Option<String>>(6)?);
            }
            Ok(q)
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    quiz["questions"] = json!(questions);
    Ok(quiz)
}

fn handle_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = req_str(params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               q.id,
               q.title,
               q.created_at,
               (SELECT COUNT(*) FROM quiz_questions qq WHERE qq.quiz_id = q.id) AS question_count,
               (SELECT COUNT(*) FROM quiz_attempts qa WHERE qa.quiz_id = q.id) AS attempt_count
             FROM quizzes q
             WHERE q.course_id = ?
             ORDER BY q.title",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([&course_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "createdAt": row.get::<_, String>(2)?,
                "questionCount": row.get::<_, i64>(3)?,
                "attemptCount": row.get::<_, i64>(4)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    Ok(json!({ "quizzes": rows }))
}

fn handle_delete(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let quiz_id = req_str(params, "quizId")?;
    let acting = actor(params)?;
    let course_id = fetch_quiz_course(conn, &quiz_id)?;
    ensure_course_teacher(conn, &course_id, &acting)?;

    let tx = conn.transaction().map_err(db_query)?;
    tx.execute("DELETE FROM quiz_attempts WHERE quiz_id = ?", [&quiz_id])
        .map_err(|e| db_update(e, "quiz_attempts"))?;
    tx.execute("DELETE FROM quiz_questions WHERE quiz_id = ?", [&quiz_id])
        .map_err(|e| db_update(e, "quiz_questions"))?;
    tx.execute("DELETE FROM quizzes WHERE id = ?", [&quiz_id])
        .map_err(|e| db_update(e, "quizzes"))?;
    tx.commit().map_err(db_query)?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quizzes.create" | "quizzes.addQuestion" | "quizzes.get" | "quizzes.list" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            let outcome = match req.method.as_str() {
                "quizzes.create" => handle_create(conn, &req.params),
                "quizzes.addQuestion" => handle_add_question(conn, &req.params),
                "quizzes.get" => handle_get(conn, &req.params),
                _ => handle_list(conn, &req.params),
            };
            Some(match outcome {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "quizzes.delete" => {
            let Some(conn) = state.db.as_mut() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match handle_delete(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
