use crate::db::now_rfc3339;
use crate::grading::{self, GradeError, QuarterKey};
use crate::ipc::helpers::{
    check_grade, optional_bool, optional_str, require_row, required_i64, required_str, to_json,
    with_conn, with_conn_mut, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

/// The (subject, quarter) a column's marks count towards.
fn column_scope(conn: &Connection, column_id: &str) -> Result<(String, String), HandlerErr> {
    let scope: Option<(String, String)> = conn
        .query_row(
            "SELECT l.subject_id, l.quarter_id
             FROM lesson_columns lc
             JOIN lessons l ON l.id = lc.lesson_id
             WHERE lc.id = ?",
            [column_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    scope.ok_or_else(|| {
        HandlerErr::new("not_found", "lesson column not found")
            .with_details(json!({ "id": column_id }))
    })
}

fn marks_set(conn: &mut Connection, params: &Value, retries: u32) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let column_id = required_str(params, "columnId")?;
    // Fractional values fail `required_i64` before the range check.
    let value = check_grade("value", required_i64(params, "value")?)?;
    let comment = optional_str(params, "comment")?.unwrap_or_default();
    let teacher_id = optional_str(params, "teacherId")?.filter(|s| !s.is_empty());
    let recalculate = optional_bool(params, "recalculate")?.unwrap_or(false);

    require_row(conn, "students", &student_id, "student")?;
    let (subject_id, quarter_id) = column_scope(conn, &column_id)?;
    if let Some(t) = &teacher_id {
        require_row(conn, "teachers", t, "teacher")?;
    }
    let key = QuarterKey {
        student_id: student_id.clone(),
        subject_id,
        quarter_id,
    };

    let (mark_id, quarterly) = grading::with_write_lock(conn, retries, |tx| {
        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO marks(id, student_id, column_id, value, comment, teacher_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, column_id) DO UPDATE SET
               value = excluded.value,
               comment = excluded.comment,
               teacher_id = excluded.teacher_id,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &column_id,
                value,
                &comment,
                &teacher_id,
                &now,
                &now,
            ),
        )
        .map_err(|e| {
            GradeError::db("db_insert_failed", e).with_details(json!({ "table": "marks" }))
        })?;
        let mark_id: String = tx
            .query_row(
                "SELECT id FROM marks WHERE student_id = ? AND column_id = ?",
                (&student_id, &column_id),
                |r| r.get(0),
            )
            .map_err(|e| GradeError::db("db_query_failed", e))?;
        let quarterly = if recalculate {
            Some(grading::recalculate_quarterly_locked(tx, &key)?)
        } else {
            None
        };
        Ok((mark_id, quarterly))
    })?;

    debug!(mark_id = %mark_id, value, recalculated = recalculate, "mark stored");
    Ok(json!({
        "markId": mark_id,
        "value": value,
        "quarterly": to_json(&quarterly)?,
    }))
}

fn marks_delete(conn: &mut Connection, params: &Value, retries: u32) -> Result<Value, HandlerErr> {
    let mark_id = required_str(params, "markId")?;
    let recalculate = optional_bool(params, "recalculate")?.unwrap_or(false);

    let owner: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, column_id FROM marks WHERE id = ?",
            [&mark_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((student_id, column_id)) = owner else {
        return Err(HandlerErr::new("not_found", "mark not found")
            .with_details(json!({ "id": mark_id })));
    };
    let (subject_id, quarter_id) = column_scope(conn, &column_id)?;
    let key = QuarterKey {
        student_id,
        subject_id,
        quarter_id,
    };

    let quarterly = grading::with_write_lock(conn, retries, |tx| {
        tx.execute("DELETE FROM marks WHERE id = ?", [&mark_id])
            .map_err(|e| GradeError::db("db_delete_failed", e))?;
        if recalculate {
            grading::recalculate_quarterly_locked(tx, &key).map(Some)
        } else {
            Ok(None)
        }
    })?;

    Ok(json!({ "deleted": true, "markId": mark_id, "quarterly": to_json(&quarterly)? }))
}

fn mark_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "columnId": r.get::<_, String>(2)?,
        "value": r.get::<_, i64>(3)?,
        "comment": r.get::<_, String>(4)?,
        "teacherId": r.get::<_, Option<String>>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
        "gradeTypeTitle": r.get::<_, String>(7)?,
        "weight": r.get::<_, f64>(8)?,
        "lessonId": r.get::<_, String>(9)?,
        "date": r.get::<_, String>(10)?,
    }))
}

const MARK_SELECT: &str = "SELECT m.id, m.student_id, m.column_id, m.value, m.comment,
        m.teacher_id, m.updated_at, gt.title, gt.weight, l.id, l.date
     FROM marks m
     JOIN lesson_columns lc ON lc.id = m.column_id
     JOIN grade_types gt ON gt.id = lc.grade_type_id
     JOIN lessons l ON l.id = lc.lesson_id";

/// Lists either every mark on one lesson (`lessonId`) or one student's
/// marks in a subject and quarter.
fn marks_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let marks = if let Some(lesson_id) = optional_str(params, "lessonId")? {
        require_row(conn, "lessons", &lesson_id, "lesson")?;
        let mut stmt = conn
            .prepare(&format!(
                "{MARK_SELECT} WHERE l.id = ? ORDER BY lc.sort_order, m.student_id"
            ))
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let rows = stmt
            .query_map([&lesson_id], mark_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        rows
    } else {
        let student_id = required_str(params, "studentId")?;
        let subject_id = required_str(params, "subjectId")?;
        let quarter_id = required_str(params, "quarterId")?;
        let mut stmt = conn
            .prepare(&format!(
                "{MARK_SELECT}
                 WHERE m.student_id = ? AND l.subject_id = ? AND l.quarter_id = ?
                 ORDER BY l.date, l.lesson_number, lc.sort_order"
            ))
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let rows = stmt
            .query_map((&student_id, &subject_id, &quarter_id), mark_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        rows
    };
    Ok(json!({ "marks": marks }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.set" => Some(with_conn_mut(state, req, marks_set)),
        "marks.delete" => Some(with_conn_mut(state, req, marks_delete)),
        "marks.list" => Some(with_conn(state, req, marks_list)),
        _ => None,
    }
}
