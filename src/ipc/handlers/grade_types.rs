use crate::db::{self, SingletonFlag};
use crate::ipc::helpers::{
    optional_bool, optional_f64, optional_i64, optional_str, require_row, required_str,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

/// Grade types created by `gradeTypes.seedDefaults`: (title, short, weight, default).
const SEED_TYPES: &[(&str, &str, f64, bool)] = &[
    ("Oral response", "Oral", 1.0, true),
    ("Homework", "HW", 1.0, false),
    ("Independent work", "IW", 1.2, false),
    ("Test", "Test", 1.5, false),
    ("Quiz", "Quiz", 1.0, false),
    ("Project", "Proj", 1.3, false),
    ("Lab work", "Lab", 1.2, false),
];

fn grade_type_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "shortTitle": r.get::<_, String>(2)?,
        "color": r.get::<_, String>(3)?,
        "description": r.get::<_, String>(4)?,
        "weight": r.get::<_, f64>(5)?,
        "sortOrder": r.get::<_, i64>(6)?,
        "isDefault": r.get::<_, i64>(7)? != 0,
    }))
}

/// Creates the default-grade-type column on a lesson unless it already has
/// one. Returns the new column id, or `None` when nothing was created.
pub fn ensure_default_column(
    conn: &Connection,
    lesson_id: &str,
) -> Result<Option<String>, HandlerErr> {
    let default_type: Option<(String, String)> = conn
        .query_row(
            "SELECT id, title FROM grade_types WHERE is_default = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((type_id, title)) = default_type else {
        return Ok(None);
    };

    let column_id = Uuid::new_v4().to_string();
    let inserted = conn
        .execute(
            "INSERT INTO lesson_columns(id, lesson_id, grade_type_id, title, sort_order)
             VALUES(?, ?, ?, ?, 0)
             ON CONFLICT(lesson_id, grade_type_id) DO NOTHING",
            (&column_id, lesson_id, &type_id, &title),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "lesson_columns" }))
        })?;
    Ok((inserted > 0).then_some(column_id))
}

fn grade_types_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, short_title, color, description, weight, sort_order, is_default
             FROM grade_types
             ORDER BY sort_order, title",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let types = stmt
        .query_map([], grade_type_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "gradeTypes": types }))
}

fn grade_types_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = optional_str(params, "id")?.filter(|s| !s.is_empty());
    let title = required_str(params, "title")?;
    let short_title = optional_str(params, "shortTitle")?.unwrap_or_default();
    let color = optional_str(params, "color")?.unwrap_or_default();
    let description = optional_str(params, "description")?.unwrap_or_default();
    let weight = optional_f64(params, "weight")?.unwrap_or(1.0);
    if !weight.is_finite() || weight < 0.0 {
        return Err(HandlerErr::bad_params("weight must be a non-negative number")
            .with_details(json!({ "weight": weight })));
    }
    let sort_order = optional_i64(params, "sortOrder")?.unwrap_or(0);
    let is_default = optional_bool(params, "isDefault")?.unwrap_or(false);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let type_id = match id {
        Some(id) => {
            let changed = tx
                .execute(
                    "UPDATE grade_types
                     SET title = ?, short_title = ?, color = ?, description = ?, weight = ?,
                         sort_order = ?
                     WHERE id = ?",
                    (
                        &title,
                        &short_title,
                        &color,
                        &description,
                        weight,
                        sort_order,
                        &id,
                    ),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            if changed == 0 {
                return Err(HandlerErr::new("not_found", "grade type not found")
                    .with_details(json!({ "id": id })));
            }
            id
        }
        None => {
            let taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM grade_types WHERE title = ?",
                    [&title],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            if let Some(existing) = taken {
                return Err(HandlerErr::new("duplicate", "grade type title already exists")
                    .with_details(json!({ "id": existing, "title": title })));
            }
            let new_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO grade_types(id, title, short_title, color, description, weight, sort_order)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &new_id,
                    &title,
                    &short_title,
                    &color,
                    &description,
                    weight,
                    sort_order,
                ),
            )
            .map_err(|e| {
                HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "grade_types" }))
            })?;
            new_id
        }
    };

    if is_default {
        db::set_singleton_flag(&tx, SingletonFlag::DefaultGradeType, &type_id)
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "gradeTypeId": type_id }))
}

fn grade_types_set_default(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let type_id = required_str(params, "gradeTypeId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let found = db::set_singleton_flag(&tx, SingletonFlag::DefaultGradeType, &type_id)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if !found {
        return Err(HandlerErr::new("not_found", "grade type not found")
            .with_details(json!({ "id": type_id })));
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "gradeTypeId": type_id, "isDefault": true }))
}

fn grade_types_seed_defaults(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let mut created = 0usize;
    for (idx, (title, short, weight, is_default)) in SEED_TYPES.iter().enumerate() {
        let existing: Option<String> = tx
            .query_row("SELECT id FROM grade_types WHERE title = ?", [title], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let type_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO grade_types(id, title, short_title, weight, sort_order)
                     VALUES(?, ?, ?, ?, ?)",
                    (&id, title, short, weight, idx as i64),
                )
                .map_err(|e| {
                    HandlerErr::db("db_insert_failed", e)
                        .with_details(json!({ "table": "grade_types" }))
                })?;
                created += 1;
                id
            }
        };
        // Only claim the default flag when nobody holds it yet.
        if *is_default {
            let holder = db::singleton_flag_holder(&tx, SingletonFlag::DefaultGradeType)
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            if holder.is_none() {
                db::set_singleton_flag(&tx, SingletonFlag::DefaultGradeType, &type_id)
                    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            }
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    info!(created, "default grade types seeded");
    grade_types_list(conn, &Value::Null).map(|mut v| {
        v["created"] = json!(created);
        v
    })
}

fn lesson_columns_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;
    let type_id = required_str(params, "gradeTypeId")?;
    require_row(conn, "lessons", &lesson_id, "lesson")?;
    let type_title: Option<String> = conn
        .query_row(
            "SELECT title FROM grade_types WHERE id = ?",
            [&type_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(type_title) = type_title else {
        return Err(HandlerErr::new("not_found", "grade type not found")
            .with_details(json!({ "id": type_id })));
    };
    let title = optional_str(params, "title")?
        .filter(|s| !s.is_empty())
        .unwrap_or(type_title);

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM lesson_columns WHERE lesson_id = ? AND grade_type_id = ?",
            (&lesson_id, &type_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(column_id) = existing {
        return Err(HandlerErr::new("duplicate", "lesson already has a column of this type")
            .with_details(json!({ "columnId": column_id })));
    }

    let sort_order = match optional_i64(params, "sortOrder")? {
        Some(n) => n,
        None => conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM lesson_columns WHERE lesson_id = ?",
                [&lesson_id],
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
    };

    let column_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO lesson_columns(id, lesson_id, grade_type_id, title, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&column_id, &lesson_id, &type_id, &title, sort_order),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "lesson_columns" }))
    })?;
    Ok(json!({ "columnId": column_id, "title": title, "sortOrder": sort_order }))
}

fn lesson_columns_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;
    require_row(conn, "lessons", &lesson_id, "lesson")?;
    let mut stmt = conn
        .prepare(
            "SELECT lc.id, lc.title, lc.sort_order, gt.id, gt.title, gt.weight
             FROM lesson_columns lc
             JOIN grade_types gt ON gt.id = lc.grade_type_id
             WHERE lc.lesson_id = ?
             ORDER BY lc.sort_order, lc.title",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let columns = stmt
        .query_map([&lesson_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "sortOrder": r.get::<_, i64>(2)?,
                "gradeTypeId": r.get::<_, String>(3)?,
                "gradeTypeTitle": r.get::<_, String>(4)?,
                "weight": r.get::<_, f64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "columns": columns }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeTypes.list" => Some(with_conn(state, req, grade_types_list)),
        "gradeTypes.upsert" => Some(with_conn(state, req, grade_types_upsert)),
        "gradeTypes.setDefault" => Some(with_conn(state, req, grade_types_set_default)),
        "gradeTypes.seedDefaults" => Some(with_conn(state, req, grade_types_seed_defaults)),
        "lessonColumns.create" => Some(with_conn(state, req, lesson_columns_create)),
        "lessonColumns.list" => Some(with_conn(state, req, lesson_columns_list)),
        _ => None,
    }
}
