use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_insert, db_query, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn create_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = req_str(params, "name")?;
    let teacher_id = req_str(params, "teacherId")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::new("validation_error", "course name must not be empty")
            .with_details(json!({ "field": "name" })));
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, teacher_id, created_at) VALUES(?, ?, ?, ?)",
        (&course_id, name.trim(), &teacher_id, Utc::now().to_rfc3339()),
    )
    .map_err(|e| db_insert(e, "courses"))?;

    Ok(json!({ "courseId": course_id }))
}

fn list_courses(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Include basic counts so the UI can show a useful dashboard.
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.teacher_id,
               (SELECT COUNT(*) FROM assignments a WHERE a.course_id = c.id) AS assignment_count,
               (SELECT COUNT(*) FROM quizzes q WHERE q.course_id = c.id) AS quiz_count
             FROM courses c
             ORDER BY c.name",
        )
        .map_err(db_query)?;

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "teacherId": row.get::<_, String>(2)?,
                "assignmentCount": row.get::<_, i64>(3)?,
                "quizCount": row.get::<_, i64>(4)?,
            }))
        })
        .map_err(db_query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_query)?;

    Ok(json!({ "courses": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match create_course(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        "courses.list" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(ok(&req.id, json!({ "courses": [] })));
            };
            Some(match list_courses(conn) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
