//! Quarterly and yearly grade calculators.
//!
//! Each recalculation is one "read inputs -> aggregate -> upsert row" cycle
//! run under `BEGIN IMMEDIATE`, so the SQLite write lock is held from the
//! first read and concurrent writers serialize per workspace.

use crate::calc::{self, MarkEntry, QuarterInput};
use crate::db::now_rfc3339;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct GradeError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradeError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        if e.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
            return Self::new("db_busy", e.to_string());
        }
        Self::new(code, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarterKey {
    pub student_id: String,
    pub subject_id: String,
    pub quarter_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearKey {
    pub student_id: String,
    pub subject_id: String,
    pub academic_year_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearlyMethod {
    Average,
    Manual,
}

impl YearlyMethod {
    pub fn parse(s: &str) -> Result<Self, GradeError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVERAGE" => Ok(Self::Average),
            "MANUAL" => Ok(Self::Manual),
            "WEIGHTED" => Err(GradeError::new(
                "unsupported_method",
                "WEIGHTED yearly calculation is not supported",
            )),
            other => Err(GradeError::new(
                "bad_params",
                format!("unknown calculation method: {}", other),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterlyGradeRow {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub quarter_id: String,
    pub grade: Option<i64>,
    pub calculated_grade: Option<f64>,
    pub suggested_grade: Option<i64>,
    pub calculation_details: Option<serde_json::Value>,
    pub comment: String,
    pub is_finalized: bool,
    pub finalized_by: Option<String>,
    pub finalized_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyGradeRow {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub academic_year_id: String,
    pub grade: Option<i64>,
    pub calculation_method: String,
    pub calculated_grade: Option<f64>,
    pub suggested_grade: Option<i64>,
    pub calculation_details: Option<serde_json::Value>,
    pub comment: String,
    pub is_finalized: bool,
    pub finalized_by: Option<String>,
    pub finalized_at: Option<String>,
    pub updated_at: String,
    pub quarterly_grade_ids: Vec<String>,
}

/// Field patch for the human-entered parts of a grade row.
/// `grade: Some(None)` clears the grade; `None` leaves it alone.
#[derive(Debug, Clone, Default)]
pub struct ManualPatch {
    pub grade: Option<Option<i64>>,
    pub comment: Option<String>,
    pub method: Option<YearlyMethod>,
}

/// Runs `f` inside an IMMEDIATE transaction, retrying when the database
/// is locked by another writer.
pub fn with_write_lock<T, F>(conn: &mut Connection, retries: u32, f: F) -> Result<T, GradeError>
where
    F: Fn(&Connection) -> Result<T, GradeError>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| GradeError::db("db_tx_failed", e))
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit().map_err(|e| GradeError::db("db_commit_failed", e))?;
                Ok(value)
            });
        match result {
            Err(e) if e.code == "db_busy" && attempt < retries => {
                attempt += 1;
                warn!(attempt, retries, "workspace locked, retrying grade write");
            }
            other => return other,
        }
    }
}

/// `not_found` unless `table` has a row with this id.
pub fn require_row(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), GradeError> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    if found.is_none() {
        return Err(GradeError::new("not_found", format!("{} not found", what))
            .with_details(json!({ "id": id })));
    }
    Ok(())
}

fn require_quarter_key(conn: &Connection, key: &QuarterKey) -> Result<(), GradeError> {
    require_row(conn, "students", &key.student_id, "student")?;
    require_row(conn, "subjects", &key.subject_id, "subject")?;
    require_row(conn, "quarters", &key.quarter_id, "quarter")
}

fn require_year_key(conn: &Connection, key: &YearKey) -> Result<(), GradeError> {
    require_row(conn, "students", &key.student_id, "student")?;
    require_row(conn, "subjects", &key.subject_id, "subject")?;
    require_row(conn, "academic_years", &key.academic_year_id, "academic year")
}

fn parse_details(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

// ---------------------------------------------------------------------------
// Quarterly
// ---------------------------------------------------------------------------

/// All marks of a student in one subject and quarter, with the weight and
/// label of each mark's grade type.
pub fn collect_quarter_entries(
    conn: &Connection,
    key: &QuarterKey,
) -> Result<Vec<MarkEntry>, GradeError> {
    let mut stmt = conn
        .prepare(
            "SELECT m.value, gt.weight, gt.title
             FROM marks m
             JOIN lesson_columns lc ON lc.id = m.column_id
             JOIN lessons l ON l.id = lc.lesson_id
             JOIN grade_types gt ON gt.id = lc.grade_type_id
             WHERE m.student_id = ? AND l.subject_id = ? AND l.quarter_id = ?
             ORDER BY l.date, l.lesson_number, lc.sort_order",
        )
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let entries = stmt
        .query_map(
            (&key.student_id, &key.subject_id, &key.quarter_id),
            |r| Ok(MarkEntry::new(r.get(0)?, r.get(1)?, r.get::<_, String>(2)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    Ok(entries)
}

fn get_or_create_quarterly(conn: &Connection, key: &QuarterKey) -> Result<String, GradeError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO quarterly_grades(id, student_id, subject_id, quarter_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, quarter_id) DO NOTHING",
        (
            Uuid::new_v4().to_string(),
            &key.student_id,
            &key.subject_id,
            &key.quarter_id,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        GradeError::db("db_insert_failed", e).with_details(json!({ "table": "quarterly_grades" }))
    })?;
    conn.query_row(
        "SELECT id FROM quarterly_grades WHERE student_id = ? AND subject_id = ? AND quarter_id = ?",
        (&key.student_id, &key.subject_id, &key.quarter_id),
        |r| r.get(0),
    )
    .map_err(|e| GradeError::db("db_query_failed", e))
}

pub fn load_quarterly(
    conn: &Connection,
    key: &QuarterKey,
) -> Result<Option<QuarterlyGradeRow>, GradeError> {
    conn.query_row(
        "SELECT id, grade, calculated_grade, suggested_grade, calculation_details, comment,
                is_finalized, finalized_by, finalized_at, updated_at
         FROM quarterly_grades
         WHERE student_id = ? AND subject_id = ? AND quarter_id = ?",
        (&key.student_id, &key.subject_id, &key.quarter_id),
        |r| {
            Ok(QuarterlyGradeRow {
                id: r.get(0)?,
                student_id: key.student_id.clone(),
                subject_id: key.subject_id.clone(),
                quarter_id: key.quarter_id.clone(),
                grade: r.get(1)?,
                calculated_grade: r.get(2)?,
                suggested_grade: r.get(3)?,
                calculation_details: parse_details(r.get(4)?),
                comment: r.get(5)?,
                is_finalized: r.get::<_, i64>(6)? != 0,
                finalized_by: r.get(7)?,
                finalized_at: r.get(8)?,
                updated_at: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(|e| GradeError::db("db_query_failed", e))
}

fn load_quarterly_required(
    conn: &Connection,
    key: &QuarterKey,
) -> Result<QuarterlyGradeRow, GradeError> {
    load_quarterly(conn, key)?
        .ok_or_else(|| GradeError::new("not_found", "quarterly grade not found"))
}

/// Recomputes one quarterly row. The caller must hold the write lock.
pub fn recalculate_quarterly_locked(
    conn: &Connection,
    key: &QuarterKey,
) -> Result<QuarterlyGradeRow, GradeError> {
    require_quarter_key(conn, key)?;
    let id = get_or_create_quarterly(conn, key)?;
    let entries = collect_quarter_entries(conn, key)?;
    let agg = calc::aggregate(&entries);
    let now = now_rfc3339();

    let mut details = serde_json::to_value(&agg)
        .map_err(|e| GradeError::new("internal", e.to_string()))?;
    details["method"] = json!("WEIGHTED_AVERAGE");
    details["calculatedAt"] = json!(now);

    conn.execute(
        "UPDATE quarterly_grades
         SET calculated_grade = ?, suggested_grade = ?, calculation_details = ?, updated_at = ?
         WHERE id = ?",
        (
            agg.weighted_average,
            agg.suggested_grade,
            details.to_string(),
            &now,
            &id,
        ),
    )
    .map_err(|e| GradeError::db("db_update_failed", e))?;

    debug!(
        quarterly_grade_id = %id,
        entries = agg.entry_count,
        average = ?agg.weighted_average,
        suggested = ?agg.suggested_grade,
        "quarterly grade recalculated"
    );
    load_quarterly_required(conn, key)
}

pub fn recalculate_quarterly(
    conn: &mut Connection,
    key: &QuarterKey,
    retries: u32,
) -> Result<QuarterlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| recalculate_quarterly_locked(tx, key))
}

/// Writes the human-entered fields. Never touches the calculated value.
pub fn save_quarterly(
    conn: &mut Connection,
    key: &QuarterKey,
    patch: &ManualPatch,
    retries: u32,
) -> Result<QuarterlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| {
        require_quarter_key(tx, key)?;
        let id = get_or_create_quarterly(tx, key)?;
        let now = now_rfc3339();
        if let Some(grade) = patch.grade {
            tx.execute(
                "UPDATE quarterly_grades SET grade = ?, updated_at = ? WHERE id = ?",
                (grade, &now, &id),
            )
            .map_err(|e| GradeError::db("db_update_failed", e))?;
        }
        if let Some(comment) = &patch.comment {
            tx.execute(
                "UPDATE quarterly_grades SET comment = ?, updated_at = ? WHERE id = ?",
                (comment, &now, &id),
            )
            .map_err(|e| GradeError::db("db_update_failed", e))?;
        }
        load_quarterly_required(tx, key)
    })
}

pub fn finalize_quarterly(
    conn: &mut Connection,
    key: &QuarterKey,
    teacher_id: &str,
    retries: u32,
) -> Result<QuarterlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| {
        require_quarter_key(tx, key)?;
        require_row(tx, "teachers", teacher_id, "teacher")?;
        let id = get_or_create_quarterly(tx, key)?;
        let now = now_rfc3339();
        tx.execute(
            "UPDATE quarterly_grades
             SET is_finalized = 1, finalized_by = ?, finalized_at = ?, updated_at = ?
             WHERE id = ?",
            (teacher_id, &now, &now, &id),
        )
        .map_err(|e| GradeError::db("db_update_failed", e))?;
        load_quarterly_required(tx, key)
    })
}

// ---------------------------------------------------------------------------
// Yearly
// ---------------------------------------------------------------------------

fn get_or_create_yearly(conn: &Connection, key: &YearKey) -> Result<String, GradeError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO yearly_grades(id, student_id, subject_id, academic_year_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, academic_year_id) DO NOTHING",
        (
            Uuid::new_v4().to_string(),
            &key.student_id,
            &key.subject_id,
            &key.academic_year_id,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        GradeError::db("db_insert_failed", e).with_details(json!({ "table": "yearly_grades" }))
    })?;
    conn.query_row(
        "SELECT id FROM yearly_grades
         WHERE student_id = ? AND subject_id = ? AND academic_year_id = ?",
        (&key.student_id, &key.subject_id, &key.academic_year_id),
        |r| r.get(0),
    )
    .map_err(|e| GradeError::db("db_query_failed", e))
}

/// Linked quarterly rows in quarter order.
fn collect_linked_quarters(
    conn: &Connection,
    yearly_id: &str,
) -> Result<Vec<QuarterInput>, GradeError> {
    let mut stmt = conn
        .prepare(
            "SELECT q.number, qg.id, qg.grade
             FROM yearly_grade_quarters ygq
             JOIN quarterly_grades qg ON qg.id = ygq.quarterly_grade_id
             JOIN quarters q ON q.id = qg.quarter_id
             WHERE ygq.yearly_grade_id = ?
             ORDER BY q.number",
        )
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let quarters = stmt
        .query_map([yearly_id], |r| {
            Ok(QuarterInput {
                number: r.get(0)?,
                quarterly_grade_id: r.get(1)?,
                grade: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    Ok(quarters)
}

pub fn load_yearly(conn: &Connection, key: &YearKey) -> Result<Option<YearlyGradeRow>, GradeError> {
    let row = conn
        .query_row(
            "SELECT id, grade, calculation_method, calculated_grade, suggested_grade,
                    calculation_details, comment, is_finalized, finalized_by, finalized_at,
                    updated_at
             FROM yearly_grades
             WHERE student_id = ? AND subject_id = ? AND academic_year_id = ?",
            (&key.student_id, &key.subject_id, &key.academic_year_id),
            |r| {
                Ok(YearlyGradeRow {
                    id: r.get(0)?,
                    student_id: key.student_id.clone(),
                    subject_id: key.subject_id.clone(),
                    academic_year_id: key.academic_year_id.clone(),
                    grade: r.get(1)?,
                    calculation_method: r.get(2)?,
                    calculated_grade: r.get(3)?,
                    suggested_grade: r.get(4)?,
                    calculation_details: parse_details(r.get(5)?),
                    comment: r.get(6)?,
                    is_finalized: r.get::<_, i64>(7)? != 0,
                    finalized_by: r.get(8)?,
                    finalized_at: r.get(9)?,
                    updated_at: r.get(10)?,
                    quarterly_grade_ids: Vec::new(),
                })
            },
        )
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let Some(mut row) = row else {
        return Ok(None);
    };
    row.quarterly_grade_ids = collect_linked_quarters(conn, &row.id)?
        .into_iter()
        .map(|q| q.quarterly_grade_id)
        .collect();
    Ok(Some(row))
}

fn load_yearly_required(conn: &Connection, key: &YearKey) -> Result<YearlyGradeRow, GradeError> {
    load_yearly(conn, key)?.ok_or_else(|| GradeError::new("not_found", "yearly grade not found"))
}

/// Replaces the set of quarterly rows a yearly grade is computed from.
/// Every row must belong to the same student and subject and to a quarter
/// of the same academic year.
pub fn set_yearly_quarters(
    conn: &mut Connection,
    key: &YearKey,
    quarterly_grade_ids: &[String],
    retries: u32,
) -> Result<YearlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| {
        require_year_key(tx, key)?;

        let mut ids: Vec<&String> = Vec::new();
        for id in quarterly_grade_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        for id in &ids {
            let owner: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT qg.student_id, qg.subject_id, q.academic_year_id
                     FROM quarterly_grades qg
                     JOIN quarters q ON q.id = qg.quarter_id
                     WHERE qg.id = ?",
                    [id.as_str()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(|e| GradeError::db("db_query_failed", e))?;
            let Some((student_id, subject_id, year_id)) = owner else {
                return Err(GradeError::new("not_found", "quarterly grade not found")
                    .with_details(json!({ "quarterlyGradeId": id })));
            };
            if student_id != key.student_id
                || subject_id != key.subject_id
                || year_id != key.academic_year_id
            {
                return Err(GradeError::new(
                    "bad_params",
                    "quarterly grade belongs to a different student, subject or year",
                )
                .with_details(json!({ "quarterlyGradeId": id })));
            }
        }

        let yearly_id = get_or_create_yearly(tx, key)?;
        tx.execute(
            "DELETE FROM yearly_grade_quarters WHERE yearly_grade_id = ?",
            [&yearly_id],
        )
        .map_err(|e| GradeError::db("db_delete_failed", e))?;
        for id in &ids {
            tx.execute(
                "INSERT INTO yearly_grade_quarters(yearly_grade_id, quarterly_grade_id) VALUES(?, ?)",
                (&yearly_id, id.as_str()),
            )
            .map_err(|e| GradeError::db("db_insert_failed", e))?;
        }
        tx.execute(
            "UPDATE yearly_grades SET updated_at = ? WHERE id = ?",
            (now_rfc3339(), &yearly_id),
        )
        .map_err(|e| GradeError::db("db_update_failed", e))?;
        load_yearly_required(tx, key)
    })
}

/// Recomputes one yearly row from its linked quarters. The caller must
/// hold the write lock.
pub fn recalculate_yearly_locked(
    conn: &Connection,
    key: &YearKey,
) -> Result<YearlyGradeRow, GradeError> {
    require_year_key(conn, key)?;
    let id = get_or_create_yearly(conn, key)?;
    let method: String = conn
        .query_row(
            "SELECT calculation_method FROM yearly_grades WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let method = YearlyMethod::parse(&method)?;

    let quarters = collect_linked_quarters(conn, &id)?;
    let agg = calc::yearly_from_quarters(&quarters);
    let now = now_rfc3339();

    let mut details = serde_json::to_value(&agg)
        .map_err(|e| GradeError::new("internal", e.to_string()))?;
    details["method"] = json!(method.as_str());
    details["calculatedAt"] = json!(now);

    conn.execute(
        "UPDATE yearly_grades
         SET calculated_grade = ?, suggested_grade = ?, calculation_details = ?, updated_at = ?
         WHERE id = ?",
        (agg.average, agg.suggested_grade, details.to_string(), &now, &id),
    )
    .map_err(|e| GradeError::db("db_update_failed", e))?;

    debug!(
        yearly_grade_id = %id,
        method = method.as_str(),
        quarters_used = agg.quarters_used,
        suggested = ?agg.suggested_grade,
        "yearly grade recalculated"
    );
    load_yearly_required(conn, key)
}

pub fn recalculate_yearly(
    conn: &mut Connection,
    key: &YearKey,
    retries: u32,
) -> Result<YearlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| recalculate_yearly_locked(tx, key))
}

pub fn save_yearly(
    conn: &mut Connection,
    key: &YearKey,
    patch: &ManualPatch,
    retries: u32,
) -> Result<YearlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| {
        require_year_key(tx, key)?;
        let id = get_or_create_yearly(tx, key)?;
        let now = now_rfc3339();
        if let Some(grade) = patch.grade {
            tx.execute(
                "UPDATE yearly_grades SET grade = ?, updated_at = ? WHERE id = ?",
                (grade, &now, &id),
            )
            .map_err(|e| GradeError::db("db_update_failed", e))?;
        }
        if let Some(comment) = &patch.comment {
            tx.execute(
                "UPDATE yearly_grades SET comment = ?, updated_at = ? WHERE id = ?",
                (comment, &now, &id),
            )
            .map_err(|e| GradeError::db("db_update_failed", e))?;
        }
        if let Some(method) = patch.method {
            tx.execute(
                "UPDATE yearly_grades SET calculation_method = ?, updated_at = ? WHERE id = ?",
                (method.as_str(), &now, &id),
            )
            .map_err(|e| GradeError::db("db_update_failed", e))?;
        }
        load_yearly_required(tx, key)
    })
}

pub fn finalize_yearly(
    conn: &mut Connection,
    key: &YearKey,
    teacher_id: &str,
    retries: u32,
) -> Result<YearlyGradeRow, GradeError> {
    with_write_lock(conn, retries, |tx| {
        require_year_key(tx, key)?;
        require_row(tx, "teachers", teacher_id, "teacher")?;
        let id = get_or_create_yearly(tx, key)?;
        let now = now_rfc3339();
        tx.execute(
            "UPDATE yearly_grades
             SET is_finalized = 1, finalized_by = ?, finalized_at = ?, updated_at = ?
             WHERE id = ?",
            (teacher_id, &now, &now, &id),
        )
        .map_err(|e| GradeError::db("db_update_failed", e))?;
        load_yearly_required(tx, key)
    })
}
