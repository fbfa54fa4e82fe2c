use crate::grading::{self, GradeError, ManualPatch, QuarterKey};
use crate::ipc::helpers::{
    grade_patch, optional_str, quarter_key, require_row, required_str, to_json, with_conn,
    with_conn_mut, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

fn quarterly_recalculate(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let key = quarter_key(params)?;
    let row = grading::recalculate_quarterly(conn, &key, retries)?;
    Ok(json!({ "quarterly": to_json(&row)? }))
}

fn quarterly_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = quarter_key(params)?;
    let row = grading::load_quarterly(conn, &key)?;
    Ok(json!({ "quarterly": to_json(&row)? }))
}

fn quarterly_save(conn: &mut Connection, params: &Value, retries: u32) -> Result<Value, HandlerErr> {
    let key = quarter_key(params)?;
    let patch = ManualPatch {
        grade: grade_patch(params, "grade")?,
        comment: optional_str(params, "comment")?,
        method: None,
    };
    let row = grading::save_quarterly(conn, &key, &patch, retries)?;
    Ok(json!({ "quarterly": to_json(&row)? }))
}

fn quarterly_finalize(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let key = quarter_key(params)?;
    let teacher_id = required_str(params, "teacherId")?;
    let row = grading::finalize_quarterly(conn, &key, &teacher_id, retries)?;
    info!(quarterly_grade_id = %row.id, teacher_id = %teacher_id, "quarterly grade finalized");
    Ok(json!({ "quarterly": to_json(&row)? }))
}

/// The quarterly grading sheet: every active student of the class gets a
/// fresh calculation in one write cycle.
fn quarterly_class_open(
    conn: &mut Connection,
    params: &Value,
    retries: u32,
) -> Result<Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let quarter_id = required_str(params, "quarterId")?;
    require_row(conn, "class_groups", &class_id, "class")?;

    let sheet = grading::with_write_lock(conn, retries, |tx| {
        let mut stmt = tx
            .prepare(
                "SELECT id, last_name, first_name
                 FROM students
                 WHERE class_id = ? AND active = 1
                 ORDER BY last_name, first_name",
            )
            .map_err(|e| GradeError::db("db_query_failed", e))?;
        let students: Vec<(String, String)> = stmt
            .query_map([&class_id], |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok((r.get(0)?, format!("{}, {}", last, first)))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| GradeError::db("db_query_failed", e))?;

        let mut sheet = Vec::with_capacity(students.len());
        for (student_id, display_name) in students {
            let key = QuarterKey {
                student_id: student_id.clone(),
                subject_id: subject_id.clone(),
                quarter_id: quarter_id.clone(),
            };
            let row = grading::recalculate_quarterly_locked(tx, &key)?;
            let marks_count = row
                .calculation_details
                .as_ref()
                .and_then(|d| d.get("entryCount"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            sheet.push(json!({
                "studentId": student_id,
                "displayName": display_name,
                "marksCount": marks_count,
                "average": row.calculated_grade,
                "suggestedGrade": row.suggested_grade,
                "quarterly": serde_json::to_value(&row)
                    .map_err(|e| GradeError::new("internal", e.to_string()))?,
            }));
        }
        Ok(sheet)
    })?;

    info!(class_id = %class_id, students = sheet.len(), "quarterly sheet opened");
    Ok(json!({
        "classId": class_id,
        "subjectId": subject_id,
        "quarterId": quarter_id,
        "students": sheet,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quarterly.recalculate" => Some(with_conn_mut(state, req, quarterly_recalculate)),
        "quarterly.get" => Some(with_conn(state, req, quarterly_get)),
        "quarterly.save" => Some(with_conn_mut(state, req, quarterly_save)),
        "quarterly.finalize" => Some(with_conn_mut(state, req, quarterly_finalize)),
        "quarterly.classOpen" => Some(with_conn_mut(state, req, quarterly_class_open)),
        _ => None,
    }
}
