use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "journal.sqlite3";

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(busy_timeout)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // At most one current year; setters clear siblings in the same transaction.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_academic_years_current
         ON academic_years(is_current) WHERE is_current = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quarters(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            number INTEGER NOT NULL CHECK(number BETWEEN 1 AND 4),
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(academic_year_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_quarters_current
         ON quarters(is_current) WHERE is_current = 1",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarters_year ON quarters(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            short_title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            year_of_study INTEGER NOT NULL CHECK(year_of_study BETWEEN 1 AND 11),
            academic_year_id TEXT NOT NULL,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(name, academic_year_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES class_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            quarter_id TEXT NOT NULL,
            date TEXT NOT NULL,
            lesson_number INTEGER NOT NULL,
            classroom TEXT NOT NULL DEFAULT '',
            topic TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES class_groups(id),
            FOREIGN KEY(quarter_id) REFERENCES quarters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_journal ON lessons(class_id, subject_id, quarter_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_subject_quarter ON lessons(subject_id, quarter_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_types(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL UNIQUE,
            short_title TEXT NOT NULL DEFAULT '',
            color TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            weight REAL NOT NULL CHECK(weight >= 0),
            sort_order INTEGER NOT NULL DEFAULT 0,
            is_default INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grade_types_default
         ON grade_types(is_default) WHERE is_default = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_columns(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            grade_type_id TEXT NOT NULL,
            title TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            FOREIGN KEY(grade_type_id) REFERENCES grade_types(id),
            UNIQUE(lesson_id, grade_type_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_columns_lesson ON lesson_columns(lesson_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            column_id TEXT NOT NULL,
            value INTEGER NOT NULL CHECK(value BETWEEN 1 AND 5),
            comment TEXT NOT NULL DEFAULT '',
            teacher_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(column_id) REFERENCES lesson_columns(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(student_id, column_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_column ON marks(column_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('ABSENT', 'ILL', 'LATE')),
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            UNIQUE(student_id, lesson_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_lesson_status ON attendance(lesson_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS homework(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            content TEXT NOT NULL,
            deadline TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_homework_lesson_deadline ON homework(lesson_id, deadline)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quarterly_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            quarter_id TEXT NOT NULL,
            grade INTEGER CHECK(grade IS NULL OR grade BETWEEN 1 AND 5),
            calculated_grade REAL,
            suggested_grade INTEGER,
            calculation_details TEXT,
            comment TEXT NOT NULL DEFAULT '',
            is_finalized INTEGER NOT NULL DEFAULT 0,
            finalized_by TEXT,
            finalized_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(quarter_id) REFERENCES quarters(id),
            FOREIGN KEY(finalized_by) REFERENCES teachers(id),
            UNIQUE(student_id, subject_id, quarter_id)
        )",
        [],
    )?;
    ensure_suggested_grade(&conn, "quarterly_grades")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarterly_grades_subject_quarter
         ON quarterly_grades(subject_id, quarter_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS yearly_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade INTEGER CHECK(grade IS NULL OR grade BETWEEN 1 AND 5),
            calculation_method TEXT NOT NULL DEFAULT 'AVERAGE',
            calculated_grade REAL,
            suggested_grade INTEGER,
            calculation_details TEXT,
            comment TEXT NOT NULL DEFAULT '',
            is_finalized INTEGER NOT NULL DEFAULT 0,
            finalized_by TEXT,
            finalized_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(finalized_by) REFERENCES teachers(id),
            UNIQUE(student_id, subject_id, academic_year_id)
        )",
        [],
    )?;
    ensure_suggested_grade(&conn, "yearly_grades")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS yearly_grade_quarters(
            yearly_grade_id TEXT NOT NULL,
            quarterly_grade_id TEXT NOT NULL,
            PRIMARY KEY(yearly_grade_id, quarterly_grade_id),
            FOREIGN KEY(yearly_grade_id) REFERENCES yearly_grades(id),
            FOREIGN KEY(quarterly_grade_id) REFERENCES quarterly_grades(id)
        )",
        [],
    )?;

    Ok(conn)
}

/// Workspaces created before suggestions were stored only kept the average.
fn ensure_suggested_grade(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, "suggested_grade")? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN suggested_grade INTEGER", table),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Tables that carry a single-designated-record flag.
#[derive(Debug, Clone, Copy)]
pub enum SingletonFlag {
    CurrentYear,
    CurrentQuarter,
    DefaultGradeType,
}

impl SingletonFlag {
    fn table_and_column(self) -> (&'static str, &'static str) {
        match self {
            Self::CurrentYear => ("academic_years", "is_current"),
            Self::CurrentQuarter => ("quarters", "is_current"),
            Self::DefaultGradeType => ("grade_types", "is_default"),
        }
    }
}

/// Moves a singleton flag onto `id`. Must run inside the caller's
/// transaction so no reader sees zero or two flagged rows.
/// Returns false when `id` does not exist (nothing is changed then).
pub fn set_singleton_flag(
    conn: &Connection,
    flag: SingletonFlag,
    id: &str,
) -> rusqlite::Result<bool> {
    let (table, column) = flag.table_and_column();
    let exists = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", table),
            [id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !exists {
        return Ok(false);
    }
    conn.execute(
        &format!("UPDATE {table} SET {column} = 0 WHERE {column} = 1 AND id <> ?"),
        [id],
    )?;
    conn.execute(&format!("UPDATE {table} SET {column} = 1 WHERE id = ?"), [id])?;
    Ok(true)
}

pub fn singleton_flag_holder(
    conn: &Connection,
    flag: SingletonFlag,
) -> rusqlite::Result<Option<String>> {
    let (table, column) = flag.table_and_column();
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE {column} = 1"),
        [],
        |r| r.get(0),
    )
    .optional()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
