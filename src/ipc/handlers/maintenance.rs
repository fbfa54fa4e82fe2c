use crate::calc;
use crate::db::{self, SingletonFlag};
use crate::ipc::handlers::grade_types::ensure_default_column;
use crate::ipc::helpers::{optional_bool, optional_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Consistency report over the journal, optionally limited to one quarter.
/// With `fix: true` every lesson lacking columns gets the default one.
fn journal_check(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let quarter_id = optional_str(params, "quarterId")?.filter(|s| !s.is_empty());
    let fix = optional_bool(params, "fix")?.unwrap_or(false);

    let mut stmt = conn
        .prepare(
            "SELECT l.id, l.date, l.class_id, l.subject_id
             FROM lessons l
             WHERE (?1 IS NULL OR l.quarter_id = ?1)
               AND NOT EXISTS (SELECT 1 FROM lesson_columns lc WHERE lc.lesson_id = l.id)
             ORDER BY l.date, l.lesson_number",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let bare: Vec<(String, String, String, String)> = stmt
        .query_map([&quarter_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let (total_lessons, total_marks, mark_sum): (i64, i64, Option<i64>) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM lessons l WHERE ?1 IS NULL OR l.quarter_id = ?1),
               COUNT(m.id),
               SUM(m.value)
             FROM marks m
             JOIN lesson_columns lc ON lc.id = m.column_id
             JOIN lessons l ON l.id = lc.lesson_id
             WHERE ?1 IS NULL OR l.quarter_id = ?1",
            [&quarter_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let average = match (total_marks, mark_sum) {
        (n, Some(sum)) if n > 0 => Some(calc::round_2_decimals(sum as f64 / n as f64)),
        _ => None,
    };

    let mut fixed = 0usize;
    let mut warnings: Vec<String> = Vec::new();
    if fix && !bare.is_empty() {
        let default_type = db::singleton_flag_holder(conn, SingletonFlag::DefaultGradeType)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if default_type.is_none() {
            warn!("journal.check fix skipped: no default grade type");
            warnings.push("no default grade type; nothing fixed".to_string());
        } else {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
            for (lesson_id, _, _, _) in &bare {
                if ensure_default_column(&tx, lesson_id)?.is_some() {
                    fixed += 1;
                }
            }
            tx.commit()
                .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
            info!(fixed, "journal.check created default columns");
        }
    }

    let lessons_without_columns: Vec<Value> = bare
        .iter()
        .map(|(id, date, class_id, subject_id)| {
            json!({
                "lessonId": id,
                "date": date,
                "classId": class_id,
                "subjectId": subject_id,
            })
        })
        .collect();

    Ok(json!({
        "totalLessons": total_lessons,
        "totalMarks": total_marks,
        "averageMark": average,
        "lessonsWithoutColumns": lessons_without_columns,
        "fixedColumns": fixed,
        "warnings": warnings,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "journal.check" => Some(with_conn(state, req, journal_check)),
        _ => None,
    }
}
