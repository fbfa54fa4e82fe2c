use crate::ipc::handlers::grade_types::ensure_default_column;
use crate::ipc::helpers::{
    optional_i64, optional_str, require_row, required_date, required_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn lessons_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = required_str(params, "subjectId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let class_id = required_str(params, "classId")?;
    let quarter_id = required_str(params, "quarterId")?;
    let date = required_date(params, "date")?;
    let lesson_number = optional_i64(params, "lessonNumber")?.unwrap_or(1);
    if lesson_number < 1 {
        return Err(HandlerErr::bad_params("lessonNumber must be positive"));
    }
    let classroom = optional_str(params, "classroom")?.unwrap_or_default();
    let topic = optional_str(params, "topic")?.unwrap_or_default();

    require_row(conn, "subjects", &subject_id, "subject")?;
    require_row(conn, "teachers", &teacher_id, "teacher")?;
    require_row(conn, "class_groups", &class_id, "class")?;
    let bounds: Option<(String, String)> = conn
        .query_row(
            "SELECT start_date, end_date FROM quarters WHERE id = ?",
            [&quarter_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((start, end)) = bounds else {
        return Err(HandlerErr::new("not_found", "quarter not found")
            .with_details(json!({ "id": quarter_id })));
    };
    let day = date.to_string();
    if day < start || day > end {
        return Err(HandlerErr::new(
            "lesson_outside_quarter",
            "lesson date is outside the quarter",
        )
        .with_details(json!({ "date": day, "startDate": start, "endDate": end })));
    }

    let lesson_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO lessons(id, subject_id, teacher_id, class_id, quarter_id, date, lesson_number,
                             classroom, topic)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &lesson_id,
            &subject_id,
            &teacher_id,
            &class_id,
            &quarter_id,
            &day,
            lesson_number,
            &classroom,
            &topic,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "lessons" })))?;
    let column_id = ensure_default_column(&tx, &lesson_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "lessonId": lesson_id, "defaultColumnId": column_id }))
}

fn lessons_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let quarter_id = required_str(params, "quarterId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               l.id,
               l.date,
               l.lesson_number,
               l.teacher_id,
               l.classroom,
               l.topic,
               (SELECT COUNT(*) FROM lesson_columns lc WHERE lc.lesson_id = l.id) AS column_count
             FROM lessons l
             WHERE l.class_id = ? AND l.subject_id = ? AND l.quarter_id = ?
             ORDER BY l.date, l.lesson_number",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let lessons = stmt
        .query_map((&class_id, &subject_id, &quarter_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "lessonNumber": r.get::<_, i64>(2)?,
                "teacherId": r.get::<_, String>(3)?,
                "classroom": r.get::<_, String>(4)?,
                "topic": r.get::<_, String>(5)?,
                "columnCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "lessons": lessons }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessons.create" => Some(with_conn(state, req, lessons_create)),
        "lessons.list" => Some(with_conn(state, req, lessons_list)),
        _ => None,
    }
}
