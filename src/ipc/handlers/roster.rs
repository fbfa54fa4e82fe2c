use crate::ipc::helpers::{
    optional_bool, optional_str, require_row, required_i64, required_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let title = required_str(params, "title")?;
    let short_title = optional_str(params, "shortTitle")?.unwrap_or_default();
    let description = optional_str(params, "description")?.unwrap_or_default();
    let is_active = optional_bool(params, "isActive")?.unwrap_or(true);

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, title, short_title, description, is_active) VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &title, &short_title, &description, is_active as i64),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" })))?;
    Ok(json!({ "subjectId": subject_id, "title": title }))
}

fn subjects_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let include_inactive = optional_bool(params, "includeInactive")?.unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT id, title, short_title, description, is_active
             FROM subjects
             WHERE is_active = 1 OR ?
             ORDER BY title",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let subjects = stmt
        .query_map([include_inactive as i64], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "shortTitle": r.get::<_, String>(2)?,
                "description": r.get::<_, String>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "subjects": subjects }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let year_of_study = required_i64(params, "yearOfStudy")?;
    if !(1..=11).contains(&year_of_study) {
        return Err(HandlerErr::bad_params("yearOfStudy must be between 1 and 11"));
    }
    let year_id = required_str(params, "yearId")?;
    require_row(conn, "academic_years", &year_id, "academic year")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_groups(id, name, year_of_study, academic_year_id) VALUES(?, ?, ?, ?)",
        (&class_id, &name, year_of_study, &year_id),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "class_groups" }))
    })?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = optional_str(params, "yearId")?;
    // Correlated subquery keeps the student count free of join duplicates.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.year_of_study,
               c.academic_year_id,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM class_groups c
             WHERE ?1 IS NULL OR c.academic_year_id = ?1
             ORDER BY c.year_of_study, c.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let classes = stmt
        .query_map([&year_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "yearOfStudy": r.get::<_, i64>(2)?,
                "yearId": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classes": classes }))
}

fn teachers_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, last_name, first_name) VALUES(?, ?, ?)",
        (&teacher_id, &last_name, &first_name),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "teachers" })))?;
    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, last_name, first_name FROM teachers ORDER BY last_name, first_name")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let teachers = stmt
        .query_map([], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "teachers": teachers }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    require_row(conn, "class_groups", &class_id, "class")?;

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, sort_order, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&student_id, &class_id, &last_name, &first_name, next_sort),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_row(conn, "class_groups", &class_id, "class")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY last_name, first_name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "sortOrder": r.get::<_, i64>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.list" => Some(with_conn(state, req, classes_list)),
        "teachers.create" => Some(with_conn(state, req, teachers_create)),
        "teachers.list" => Some(with_conn(state, req, teachers_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.list" => Some(with_conn(state, req, students_list)),
        _ => None,
    }
}
