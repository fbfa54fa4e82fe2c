use crate::calc::{self, MarkEntry};
use crate::ipc::helpers::{quarter_key, require_row, to_json, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
struct StudentMark {
    value: i64,
    weight: f64,
    type_title: String,
    date: String,
    updated_at: String,
    column_title: String,
    comment: String,
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    count: usize,
    sum: i64,
}

impl Bucket {
    fn push(&mut self, value: i64) {
        self.count += 1;
        self.sum += value;
    }

    fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(calc::round_2_decimals(self.sum as f64 / self.count as f64))
    }
}

fn parse_day(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn load_student_marks(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    quarter_id: &str,
) -> Result<Vec<StudentMark>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT m.value, gt.weight, gt.title, l.date, m.updated_at, lc.title, m.comment
             FROM marks m
             JOIN lesson_columns lc ON lc.id = m.column_id
             JOIN lessons l ON l.id = lc.lesson_id
             JOIN grade_types gt ON gt.id = lc.grade_type_id
             WHERE m.student_id = ? AND l.subject_id = ? AND l.quarter_id = ?
             ORDER BY l.date, l.lesson_number, lc.sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let marks = stmt
        .query_map((student_id, subject_id, quarter_id), |r| {
            Ok(StudentMark {
                value: r.get(0)?,
                weight: r.get(1)?,
                type_title: r.get(2)?,
                date: r.get(3)?,
                updated_at: r.get(4)?,
                column_title: r.get(5)?,
                comment: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(marks)
}

/// Attendance over the subject's lessons in the quarter. Lessons with no
/// attendance row count as present.
fn attendance_counts(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    quarter_id: &str,
) -> Result<Value, HandlerErr> {
    let lessons: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM lessons l
             JOIN students s ON s.class_id = l.class_id
             WHERE s.id = ? AND l.subject_id = ? AND l.quarter_id = ?",
            (student_id, subject_id, quarter_id),
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut stmt = conn
        .prepare(
            "SELECT a.status, COUNT(*)
             FROM attendance a
             JOIN lessons l ON l.id = a.lesson_id
             WHERE a.student_id = ? AND l.subject_id = ? AND l.quarter_id = ?
             GROUP BY a.status",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map((student_id, subject_id, quarter_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut counts: BTreeMap<&str, i64> =
        [("ABSENT", 0), ("ILL", 0), ("LATE", 0)].into_iter().collect();
    let mut recorded = 0;
    for (status, n) in &rows {
        if let Some(slot) = counts.get_mut(status.as_str()) {
            *slot += n;
        }
        recorded += n;
    }
    Ok(json!({
        "lessons": lessons,
        "PRESENT": (lessons - recorded).max(0),
        "ABSENT": counts["ABSENT"],
        "ILL": counts["ILL"],
        "LATE": counts["LATE"],
    }))
}

/// 7-day windows starting at the quarter start, covering the whole quarter.
fn weekly_progress(marks: &[StudentMark], start: NaiveDate, end: NaiveDate) -> Vec<Value> {
    let days = (end - start).num_days().max(0) + 1;
    let weeks = ((days + 6) / 7) as usize;
    let mut buckets = vec![Bucket::default(); weeks];
    for m in marks {
        let Some(day) = parse_day(&m.date) else {
            continue;
        };
        let offset = (day - start).num_days();
        if offset < 0 {
            continue;
        }
        if let Some(bucket) = buckets.get_mut((offset / 7) as usize) {
            bucket.push(m.value);
        }
    }
    buckets
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let week_start = start + Duration::days(7 * i as i64);
            let week_end = (week_start + Duration::days(6)).min(end);
            json!({
                "week": i + 1,
                "startDate": week_start.to_string(),
                "endDate": week_end.to_string(),
                "marksCount": b.count,
                "average": b.average(),
            })
        })
        .collect()
}

fn stats_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = quarter_key(params)?;
    require_row(conn, "students", &key.student_id, "student")?;
    require_row(conn, "subjects", &key.subject_id, "subject")?;
    let bounds: Option<(String, String)> = conn
        .query_row(
            "SELECT start_date, end_date FROM quarters WHERE id = ?",
            [&key.quarter_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((start_raw, end_raw)) = bounds else {
        return Err(HandlerErr::new("not_found", "quarter not found")
            .with_details(json!({ "id": key.quarter_id })));
    };

    let marks = load_student_marks(conn, &key.student_id, &key.subject_id, &key.quarter_id)?;

    let mut by_type: BTreeMap<&str, (Bucket, f64)> = BTreeMap::new();
    for m in &marks {
        let slot = by_type
            .entry(m.type_title.as_str())
            .or_insert_with(|| (Bucket::default(), m.weight));
        slot.0.push(m.value);
    }
    let by_type: Vec<Value> = by_type
        .iter()
        .map(|(title, (bucket, weight))| {
            json!({
                "gradeType": title,
                "weight": weight,
                "count": bucket.count,
                "average": bucket.average(),
            })
        })
        .collect();

    let weekly = match (parse_day(&start_raw), parse_day(&end_raw)) {
        (Some(start), Some(end)) => weekly_progress(&marks, start, end),
        _ => Vec::new(),
    };

    let mut recent: Vec<&StudentMark> = marks.iter().collect();
    recent.sort_by(|a, b| (&b.date, &b.updated_at).cmp(&(&a.date, &a.updated_at)));
    let recent: Vec<Value> = recent
        .into_iter()
        .take(RECENT_LIMIT)
        .map(|m| {
            json!({
                "value": m.value,
                "date": m.date,
                "gradeType": m.type_title,
                "column": m.column_title,
                "comment": m.comment,
            })
        })
        .collect();

    let entries: Vec<MarkEntry> = marks
        .iter()
        .map(|m| MarkEntry::new(m.value, m.weight, m.type_title.clone()))
        .collect();
    let aggregate = calc::aggregate(&entries);
    let attendance = attendance_counts(conn, &key.student_id, &key.subject_id, &key.quarter_id)?;

    Ok(json!({
        "studentId": key.student_id,
        "subjectId": key.subject_id,
        "quarterId": key.quarter_id,
        "totalMarks": marks.len(),
        "aggregate": to_json(&aggregate)?,
        "byType": by_type,
        "attendance": attendance,
        "weekly": weekly,
        "recent": recent,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.student" => Some(with_conn(state, req, stats_student)),
        _ => None,
    }
}
