use crate::calc;
use crate::grading::{self, GradeError, QuarterKey, YearKey};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        GradeError::db(code, e).into()
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<GradeError> for HandlerErr {
    fn from(e: GradeError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

/// Runs a read-mostly handler against the open workspace.
pub fn with_conn<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Runs a handler that needs its own transactions; `retries` is the
/// configured busy-retry budget for grade writes.
pub fn with_conn_mut<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&mut Connection, &Value, u32) -> Result<Value, HandlerErr>,
{
    let retries = state.config.recalc_retries;
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params, retries) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let s = required_str(params, key)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))
            .with_details(json!({ key: s }))
    })
}

/// A grade on the 1..5 scale, rejected at the boundary when out of range.
pub fn check_grade(key: &str, value: i64) -> Result<i64, HandlerErr> {
    if !calc::is_valid_grade(value) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be between {} and {}",
            key,
            calc::GRADE_MIN,
            calc::GRADE_MAX
        ))
        .with_details(json!({ key: value })));
    }
    Ok(value)
}

/// Absent leaves the stored grade alone, `null` clears it, an integer sets it.
pub fn grade_patch(params: &Value, key: &str) -> Result<Option<Option<i64>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => {
            let Some(n) = v.as_i64() else {
                return Err(HandlerErr::bad_params(format!("{} must be an integer or null", key)));
            };
            Ok(Some(Some(check_grade(key, n)?)))
        }
    }
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    Ok(grading::require_row(conn, table, id, what)?)
}

pub fn quarter_key(params: &Value) -> Result<QuarterKey, HandlerErr> {
    Ok(QuarterKey {
        student_id: required_str(params, "studentId")?,
        subject_id: required_str(params, "subjectId")?,
        quarter_id: required_str(params, "quarterId")?,
    })
}

pub fn year_key(params: &Value) -> Result<YearKey, HandlerErr> {
    Ok(YearKey {
        student_id: required_str(params, "studentId")?,
        subject_id: required_str(params, "subjectId")?,
        academic_year_id: required_str(params, "yearId")?,
    })
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}
