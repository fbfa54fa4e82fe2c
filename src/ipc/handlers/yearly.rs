use crate::grading::{self, ManualPatch, YearlyMethod};
use crate::ipc::helpers::{
    grade_patch, optional_str, required_str, to_json, with_conn, with_conn_mut, year_key,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

fn yearly_set_quarters(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let key = year_key(params)?;
    let Some(raw) = params.get("quarterlyGradeIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("quarterlyGradeIds must be an array"));
    };
    let mut ids = Vec::with_capacity(raw.len());
    for v in raw {
        match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => ids.push(s.to_string()),
            _ => {
                return Err(HandlerErr::bad_params("quarterlyGradeIds must hold ids")
                    .with_details(json!({ "value": v })))
            }
        }
    }
    let row = grading::set_yearly_quarters(conn, &key, &ids, retries)?;
    Ok(json!({ "yearly": to_json(&row)? }))
}

fn yearly_recalculate(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let key = year_key(params)?;
    let row = grading::recalculate_yearly(conn, &key, retries)?;
    Ok(json!({ "yearly": to_json(&row)? }))
}

fn yearly_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = year_key(params)?;
    let row = grading::load_yearly(conn, &key)?;
    Ok(json!({ "yearly": to_json(&row)? }))
}

fn yearly_save(conn: &mut Connection, params: &Value, retries: u32) -> Result<Value, HandlerErr> {
    let key = year_key(params)?;
    let method = match optional_str(params, "calculationMethod")? {
        Some(m) => Some(YearlyMethod::parse(&m)?),
        None => None,
    };
    let patch = ManualPatch {
        grade: grade_patch(params, "grade")?,
        comment: optional_str(params, "comment")?,
        method,
    };
    let row = grading::save_yearly(conn, &key, &patch, retries)?;
    Ok(json!({ "yearly": to_json(&row)? }))
}

fn yearly_finalize(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let key = year_key(params)?;
    let teacher_id = required_str(params, "teacherId")?;
    let row = grading::finalize_yearly(conn, &key, &teacher_id, retries)?;
    info!(yearly_grade_id = %row.id, teacher_id = %teacher_id, "yearly grade finalized");
    Ok(json!({ "yearly": to_json(&row)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "yearly.setQuarters" => Some(with_conn_mut(state, req, yearly_set_quarters)),
        "yearly.recalculate" => Some(with_conn_mut(state, req, yearly_recalculate)),
        "yearly.get" => Some(with_conn(state, req, yearly_get)),
        "yearly.save" => Some(with_conn_mut(state, req, yearly_save)),
        "yearly.finalize" => Some(with_conn_mut(state, req, yearly_finalize)),
        _ => None,
    }
}
