use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::lifecycle::LifecycleError;
use crate::scoring::ScoreError;

/// Handler-internal error carrier; maps onto the wire error object at the
/// handler boundary.
pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<LifecycleError> for HandlerErr {
    fn from(e: LifecycleError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

impl From<ScoreError> for HandlerErr {
    fn from(e: ScoreError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn not_found(message: impl Into<String>, details: serde_json::Value) -> HandlerErr {
    HandlerErr::new("not_found", message).with_details(details)
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_insert(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
}

pub fn db_update(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
}

// --- param extraction ------------------------------------------------------

pub fn req_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn req_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| bad_params(format!("missing/invalid {}", key)))
}

pub fn opt_f64(params: &serde_json::Value, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

pub fn opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn opt_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// RFC 3339 timestamps on the wire and in the store.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, HandlerErr> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            bad_params(format!("{} must be an RFC 3339 timestamp", field))
                .with_details(json!({ "field": field, "value": raw, "parseError": e.to_string() }))
        })
}

// --- identity context ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
}

/// Acting user, supplied by the authentication collaborator. The core only
/// checks ownership and course-teacher membership with it.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

pub fn actor(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let obj = params
        .get("actor")
        .ok_or_else(|| bad_params("missing actor"))?;
    let user_id = obj
        .get("userId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params("missing actor.userId"))?;
    let role = match obj.get("role").and_then(|v| v.as_str()) {
        Some("student") => Role::Student,
        Some("teacher") => Role::Teacher,
        _ => return Err(bad_params("actor.role must be 'student' or 'teacher'")),
    };
    Ok(Actor {
        user_id: user_id.to_string(),
        role,
    })
}

impl Actor {
    pub fn require_student(&self) -> Result<(), HandlerErr> {
        if self.role != Role::Student {
            return Err(HandlerErr::new(
                "authorization_denied",
                "only a student can perform this action",
            ));
        }
        Ok(())
    }
}

/// Teacher-of-the-course check (role and membership in one shot).
pub fn ensure_course_teacher(
    conn: &Connection,
    course_id: &str,
    actor: &Actor,
) -> Result<(), HandlerErr> {
    if actor.role != Role::Teacher {
        return Err(HandlerErr::new(
            "authorization_denied",
            "only a teacher can perform this action",
        ));
    }
    let teacher_id: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM courses WHERE id = ?",
            [course_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let teacher_id = teacher_id
        .ok_or_else(|| not_found("course not found", json!({ "courseId": course_id })))?;
    if teacher_id != actor.user_id {
        return Err(HandlerErr::new(
            "authorization_denied",
            "actor is not the teacher of this course",
        )
        .with_details(json!({ "courseId": course_id })));
    }
    Ok(())
}
