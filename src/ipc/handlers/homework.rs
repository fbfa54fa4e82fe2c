use crate::db::now_rfc3339;
use crate::ipc::helpers::{
    optional_str, require_row, required_date, required_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn homework_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;
    let content = required_str(params, "content")?;
    let deadline = required_date(params, "deadline")?;

    let lesson_date: Option<String> = conn
        .query_row("SELECT date FROM lessons WHERE id = ?", [&lesson_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(lesson_date) = lesson_date else {
        return Err(HandlerErr::new("not_found", "lesson not found")
            .with_details(json!({ "id": lesson_id })));
    };
    if deadline.to_string() < lesson_date {
        return Err(HandlerErr::bad_params("deadline must not be before the lesson date")
            .with_details(json!({ "deadline": deadline.to_string(), "lessonDate": lesson_date })));
    }

    let homework_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO homework(id, lesson_id, content, deadline, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            &homework_id,
            &lesson_id,
            &content,
            deadline.to_string(),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "homework" })))?;
    Ok(json!({ "homeworkId": homework_id }))
}

/// Homework for one lesson, or for a class across lessons when `classId`
/// is given (optionally bounded below by `from`).
fn homework_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let row_json = |r: &rusqlite::Row<'_>| -> rusqlite::Result<Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "lessonId": r.get::<_, String>(1)?,
            "content": r.get::<_, String>(2)?,
            "deadline": r.get::<_, String>(3)?,
            "createdAt": r.get::<_, String>(4)?,
            "subjectId": r.get::<_, String>(5)?,
        }))
    };

    let items = if let Some(lesson_id) = optional_str(params, "lessonId")? {
        require_row(conn, "lessons", &lesson_id, "lesson")?;
        let mut stmt = conn
            .prepare(
                "SELECT h.id, h.lesson_id, h.content, h.deadline, h.created_at, l.subject_id
                 FROM homework h
                 JOIN lessons l ON l.id = h.lesson_id
                 WHERE h.lesson_id = ?
                 ORDER BY h.deadline, h.created_at",
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let rows = stmt
            .query_map([&lesson_id], row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        rows
    } else {
        let class_id = required_str(params, "classId")?;
        require_row(conn, "class_groups", &class_id, "class")?;
        let from = optional_str(params, "from")?.filter(|s| !s.is_empty());
        let mut stmt = conn
            .prepare(
                "SELECT h.id, h.lesson_id, h.content, h.deadline, h.created_at, l.subject_id
                 FROM homework h
                 JOIN lessons l ON l.id = h.lesson_id
                 WHERE l.class_id = ?1 AND (?2 IS NULL OR h.deadline >= ?2)
                 ORDER BY h.deadline, h.created_at",
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let rows = stmt
            .query_map((&class_id, &from), row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        rows
    };
    Ok(json!({ "homework": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "homework.create" => Some(with_conn(state, req, homework_create)),
        "homework.list" => Some(with_conn(state, req, homework_list)),
        _ => None,
    }
}
