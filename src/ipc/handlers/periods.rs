use crate::db::{self, SingletonFlag};
use crate::ipc::helpers::{
    optional_bool, optional_str, require_row, required_date, required_i64, required_str,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

fn year_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "label": r.get::<_, String>(1)?,
        "startDate": r.get::<_, String>(2)?,
        "endDate": r.get::<_, String>(3)?,
        "isCurrent": r.get::<_, i64>(4)? != 0,
    }))
}

fn quarter_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "yearId": r.get::<_, String>(1)?,
        "number": r.get::<_, i64>(2)?,
        "name": r.get::<_, String>(3)?,
        "startDate": r.get::<_, String>(4)?,
        "endDate": r.get::<_, String>(5)?,
        "isCurrent": r.get::<_, i64>(6)? != 0,
    }))
}

fn years_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let label = required_str(params, "label")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    let is_current = optional_bool(params, "isCurrent")?.unwrap_or(false);

    let year_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO academic_years(id, label, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&year_id, &label, start.to_string(), end.to_string()),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "academic_years" }))
    })?;
    if is_current {
        db::set_singleton_flag(&tx, SingletonFlag::CurrentYear, &year_id)
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "yearId": year_id, "label": label, "isCurrent": is_current }))
}

fn years_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, label, start_date, end_date, is_current
             FROM academic_years
             ORDER BY start_date DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let years = stmt
        .query_map([], year_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "years": years }))
}

fn set_current(
    conn: &Connection,
    flag: SingletonFlag,
    id: &str,
    what: &str,
) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let found = db::set_singleton_flag(&tx, flag, id)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if !found {
        return Err(HandlerErr::new("not_found", format!("{} not found", what))
            .with_details(json!({ "id": id })));
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(())
}

fn years_set_current(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    set_current(conn, SingletonFlag::CurrentYear, &year_id, "academic year")?;
    Ok(json!({ "yearId": year_id, "isCurrent": true }))
}

fn quarters_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let number = required_i64(params, "number")?;
    if !(1..=4).contains(&number) {
        return Err(HandlerErr::bad_params("number must be between 1 and 4")
            .with_details(json!({ "number": number })));
    }
    let name = optional_str(params, "name")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("Quarter {}", number));
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    let is_current = optional_bool(params, "isCurrent")?.unwrap_or(false);

    require_row(conn, "academic_years", &year_id, "academic year")?;

    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM quarters WHERE academic_year_id = ? AND number = ?",
            (&year_id, number),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new("duplicate", "quarter number already used in this year")
            .with_details(json!({ "quarterId": existing, "number": number })));
    }

    // ISO dates compare correctly as text.
    let overlapping: Option<String> = conn
        .query_row(
            "SELECT id FROM quarters
             WHERE academic_year_id = ? AND start_date <= ? AND end_date >= ?
             LIMIT 1",
            (&year_id, end.to_string(), start.to_string()),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(other) = overlapping {
        return Err(HandlerErr::new(
            "quarter_overlap",
            "quarter dates overlap an existing quarter",
        )
        .with_details(json!({ "quarterId": other })));
    }

    let quarter_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO quarters(id, academic_year_id, number, name, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &quarter_id,
            &year_id,
            number,
            &name,
            start.to_string(),
            end.to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "quarters" })))?;
    if is_current {
        db::set_singleton_flag(&tx, SingletonFlag::CurrentQuarter, &quarter_id)
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "quarterId": quarter_id, "number": number, "name": name }))
}

fn quarters_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, academic_year_id, number, name, start_date, end_date, is_current
             FROM quarters
             WHERE academic_year_id = ?
             ORDER BY number",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let quarters = stmt
        .query_map([&year_id], quarter_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "quarters": quarters }))
}

fn quarters_set_current(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let quarter_id = required_str(params, "quarterId")?;
    set_current(conn, SingletonFlag::CurrentQuarter, &quarter_id, "quarter")?;
    Ok(json!({ "quarterId": quarter_id, "isCurrent": true }))
}

fn quarters_current(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let quarter = conn
        .query_row(
            "SELECT id, academic_year_id, number, name, start_date, end_date, is_current
             FROM quarters
             WHERE is_current = 1",
            [],
            quarter_json,
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "quarter": quarter }))
}

/// Standard quarter windows of the school year starting in September of
/// `start_year`: (number, first day, last day).
fn standard_quarters(start_year: i32) -> Option<[(i64, NaiveDate, NaiveDate); 4]> {
    let d = |y: i32, m: u32, day: u32| NaiveDate::from_ymd_opt(y, m, day);
    Some([
        (1, d(start_year, 9, 1)?, d(start_year, 10, 27)?),
        (2, d(start_year, 11, 5)?, d(start_year, 12, 29)?),
        (3, d(start_year + 1, 1, 9)?, d(start_year + 1, 3, 22)?),
        (4, d(start_year + 1, 4, 1)?, d(start_year + 1, 5, 31)?),
    ])
}

fn periods_setup_current(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let today = match params.get("today") {
        None | Some(Value::Null) => Local::now().date_naive(),
        Some(_) => required_date(params, "today")?,
    };
    // January to August still belong to the year that began last September.
    let start_year = if today.month() >= 9 {
        today.year()
    } else {
        today.year() - 1
    };
    let label = format!("{}-{}", start_year, start_year + 1);
    let Some(windows) = standard_quarters(start_year) else {
        return Err(HandlerErr::bad_params("today is out of range")
            .with_details(json!({ "today": today.to_string() })));
    };
    let year_start = windows[0].1;
    let year_end = windows[3].2;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let existing_year: Option<String> = tx
        .query_row(
            "SELECT id FROM academic_years WHERE label = ?",
            [&label],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let year_created = existing_year.is_none();
    let year_id = match existing_year {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO academic_years(id, label, start_date, end_date) VALUES(?, ?, ?, ?)",
                (&id, &label, year_start.to_string(), year_end.to_string()),
            )
            .map_err(|e| {
                HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "academic_years" }))
            })?;
            id
        }
    };
    db::set_singleton_flag(&tx, SingletonFlag::CurrentYear, &year_id)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    let mut quarter_id: Option<String> = None;
    let mut quarter_created = false;
    if let Some((number, start, end)) = windows
        .into_iter()
        .find(|(_, start, end)| *start <= today && today <= *end)
    {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM quarters WHERE academic_year_id = ? AND number = ?",
                (&year_id, number),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let id = match existing {
            Some(id) => id,
            None => {
                let overlapping: Option<String> = tx
                    .query_row(
                        "SELECT id FROM quarters
                         WHERE academic_year_id = ? AND start_date <= ? AND end_date >= ?
                         LIMIT 1",
                        (&year_id, end.to_string(), start.to_string()),
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(|e| HandlerErr::db("db_query_failed", e))?;
                if let Some(other) = overlapping {
                    return Err(HandlerErr::new(
                        "quarter_overlap",
                        "quarter dates overlap an existing quarter",
                    )
                    .with_details(json!({ "quarterId": other, "number": number })));
                }
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO quarters(id, academic_year_id, number, name, start_date, end_date)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        &id,
                        &year_id,
                        number,
                        format!("Quarter {}", number),
                        start.to_string(),
                        end.to_string(),
                    ),
                )
                .map_err(|e| {
                    HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "quarters" }))
                })?;
                quarter_created = true;
                id
            }
        };
        db::set_singleton_flag(&tx, SingletonFlag::CurrentQuarter, &id)
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        quarter_id = Some(id);
    }

    let year = tx
        .query_row(
            "SELECT id, label, start_date, end_date, is_current FROM academic_years WHERE id = ?",
            [&year_id],
            year_json,
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let quarter = match &quarter_id {
        Some(id) => Some(
            tx.query_row(
                "SELECT id, academic_year_id, number, name, start_date, end_date, is_current
                 FROM quarters
                 WHERE id = ?",
                [id],
                quarter_json,
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
        ),
        None => None,
    };
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    info!(
        year = %label,
        year_created,
        quarter_created,
        in_quarter = quarter_id.is_some(),
        "current period set up"
    );
    Ok(json!({
        "today": today.to_string(),
        "year": year,
        "yearCreated": year_created,
        "quarter": quarter,
        "quarterCreated": quarter_created,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(with_conn(state, req, years_create)),
        "years.list" => Some(with_conn(state, req, years_list)),
        "years.setCurrent" => Some(with_conn(state, req, years_set_current)),
        "quarters.create" => Some(with_conn(state, req, quarters_create)),
        "quarters.list" => Some(with_conn(state, req, quarters_list)),
        "quarters.setCurrent" => Some(with_conn(state, req, quarters_set_current)),
        "quarters.current" => Some(with_conn(state, req, quarters_current)),
        "periods.setupCurrent" => Some(with_conn(state, req, periods_setup_current)),
        _ => None,
    }
}
