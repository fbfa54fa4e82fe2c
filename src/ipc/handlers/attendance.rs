use crate::ipc::helpers::{optional_str, require_row, required_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttendanceStatus {
    Present,
    Absent,
    Ill,
    Late,
}

impl AttendanceStatus {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Some(Self::Present),
            "ABSENT" => Some(Self::Absent),
            "ILL" => Some(Self::Ill),
            "LATE" => Some(Self::Late),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Absent => "ABSENT",
            Self::Ill => "ILL",
            Self::Late => "LATE",
        }
    }
}

/// The lesson's class, used to check the student is on its roster.
fn lesson_class(conn: &Connection, lesson_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM lessons WHERE id = ?",
        [lesson_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "lesson not found").with_details(json!({ "id": lesson_id }))
    })
}

fn attendance_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let lesson_id = required_str(params, "lessonId")?;
    let raw_status = required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&raw_status) else {
        return Err(HandlerErr::bad_params("status must be PRESENT, ABSENT, ILL or LATE")
            .with_details(json!({ "status": raw_status })));
    };
    let note = optional_str(params, "note")?.unwrap_or_default();

    let class_id = lesson_class(conn, &lesson_id)?;
    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match student_class {
        None => {
            return Err(HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "id": student_id })))
        }
        Some(c) if c != class_id => {
            return Err(HandlerErr::bad_params("student is not in the lesson's class")
                .with_details(json!({ "studentId": student_id, "lessonId": lesson_id })))
        }
        Some(_) => {}
    }

    // Present is the implicit default, so it is stored as "no row".
    if status == AttendanceStatus::Present {
        conn.execute(
            "DELETE FROM attendance WHERE student_id = ? AND lesson_id = ?",
            (&student_id, &lesson_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    } else {
        conn.execute(
            "INSERT INTO attendance(id, student_id, lesson_id, status, note)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, lesson_id) DO UPDATE SET
               status = excluded.status,
               note = excluded.note",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &lesson_id,
                status.as_str(),
                &note,
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "attendance" }))
        })?;
    }

    Ok(json!({
        "studentId": student_id,
        "lessonId": lesson_id,
        "status": status.as_str(),
    }))
}

/// Whole-class roster for one lesson; students without a row are PRESENT.
fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;
    let class_id = lesson_class(conn, &lesson_id)?;
    require_row(conn, "class_groups", &class_id, "class")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, a.status, a.note
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.lesson_id = ?
             WHERE s.class_id = ? AND s.active = 1
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map((&lesson_id, &class_id), |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let status: Option<String> = r.get(3)?;
            let note: Option<String> = r.get(4)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "status": status.unwrap_or_else(|| AttendanceStatus::Present.as_str().to_string()),
                "note": note.unwrap_or_default(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "lessonId": lesson_id, "attendance": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.set" => Some(with_conn(state, req, attendance_set)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::AttendanceStatus;

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(AttendanceStatus::parse("ill"), Some(AttendanceStatus::Ill));
        assert_eq!(AttendanceStatus::parse(" Late "), Some(AttendanceStatus::Late));
        assert_eq!(AttendanceStatus::parse("excused"), None);
    }
}
