use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_journald");
    let mut child = Command::new(exe)
        .env_remove("JOURNALD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn journald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_at(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct Journal {
    quarter_id: String,
    subject_id: String,
    class_id: String,
    teacher_id: String,
    student_id: String,
}

fn seed_journal(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Journal {
    let year = request_ok(
        stdin,
        reader,
        "seed-year",
        "years.create",
        json!({ "label": "2024-2025", "startDate": "2024-09-01", "endDate": "2025-05-31" }),
    );
    let year_id = str_at(&year, "yearId");
    let quarter = request_ok(
        stdin,
        reader,
        "seed-quarter",
        "quarters.create",
        json!({ "yearId": year_id, "number": 1, "startDate": "2024-09-02", "endDate": "2024-10-27" }),
    );
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "title": "Chemistry" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "10A", "yearOfStudy": 10, "yearId": year_id }),
    );
    let class_id = str_at(&class, "classId");
    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "teachers.create",
        json!({ "lastName": "Morozov", "firstName": "Gleb" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        json!({ "classId": class_id, "lastName": "Egorova", "firstName": "Nina" }),
    );
    Journal {
        quarter_id: str_at(&quarter, "quarterId"),
        subject_id: str_at(&subject, "subjectId"),
        class_id,
        teacher_id: str_at(&teacher, "teacherId"),
        student_id: str_at(&student, "studentId"),
    }
}

fn create_lesson(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    j: &Journal,
    date: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "lessons.create",
        json!({
            "subjectId": j.subject_id,
            "teacherId": j.teacher_id,
            "classId": j.class_id,
            "quarterId": j.quarter_id,
            "date": date,
        }),
    )
}

#[test]
fn student_stats_group_marks_by_type_week_and_attendance() {
    let workspace = temp_dir("journald-student-stats");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let j = seed_journal(&mut stdin, &mut reader);
    let seeded = request_ok(&mut stdin, &mut reader, "2", "gradeTypes.seedDefaults", json!({}));
    let test_type = seeded["gradeTypes"]
        .as_array()
        .expect("gradeTypes")
        .iter()
        .find(|t| t["title"] == "Test")
        .map(|t| str_at(t, "id"))
        .expect("Test type");

    let week1 = create_lesson(&mut stdin, &mut reader, "3", &j, "2024-09-03");
    let week2 = create_lesson(&mut stdin, &mut reader, "4", &j, "2024-09-10");
    let test_col = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "lessonColumns.create",
        json!({ "lessonId": str_at(&week2, "lessonId"), "gradeTypeId": test_type }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "marks.set",
        json!({ "studentId": j.student_id, "columnId": str_at(&week1, "defaultColumnId"), "value": 5 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.set",
        json!({ "studentId": j.student_id, "columnId": str_at(&test_col, "columnId"), "value": 4 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.set",
        json!({ "studentId": j.student_id, "lessonId": str_at(&week2, "lessonId"), "status": "LATE" }),
    );

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "stats.student",
        json!({ "studentId": j.student_id, "subjectId": j.subject_id, "quarterId": j.quarter_id }),
    );

    assert_eq!(stats["totalMarks"], 2);
    // (5 * 1.0 + 4 * 1.5) / 2.5 = 4.4
    assert_eq!(stats["aggregate"]["weightedAverage"], 4.4);
    assert_eq!(stats["aggregate"]["suggestedGrade"], 4);

    let by_type = stats["byType"].as_array().expect("byType");
    assert_eq!(by_type.len(), 2);
    assert_eq!(by_type[0]["gradeType"], "Oral response");
    assert_eq!(by_type[0]["average"], 5.0);
    assert_eq!(by_type[1]["gradeType"], "Test");
    assert_eq!(by_type[1]["weight"], 1.5);

    let weekly = stats["weekly"].as_array().expect("weekly");
    assert_eq!(weekly.len(), 8);
    assert_eq!(weekly[0]["startDate"], "2024-09-02");
    assert_eq!(weekly[0]["marksCount"], 1);
    assert_eq!(weekly[1]["marksCount"], 1);
    assert_eq!(weekly[1]["average"], 4.0);
    assert_eq!(weekly[2]["marksCount"], 0);

    let attendance = &stats["attendance"];
    assert_eq!(attendance["lessons"], 2);
    assert_eq!(attendance["LATE"], 1);
    assert_eq!(attendance["PRESENT"], 1);
    assert_eq!(attendance["ABSENT"], 0);

    let recent = stats["recent"].as_array().expect("recent");
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["date"], "2024-09-10");
    assert_eq!(recent[0]["value"], 4);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn journal_check_reports_and_fixes_bare_lessons() {
    let workspace = temp_dir("journald-journal-check");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let j = seed_journal(&mut stdin, &mut reader);

    // Created before any default grade type exists, so it has no column.
    let bare = create_lesson(&mut stdin, &mut reader, "2", &j, "2024-09-04");
    assert!(bare["defaultColumnId"].is_null());

    let fix_without_default = request_ok(&mut stdin, &mut reader, "3", "journal.check", json!({ "fix": true }));
    assert_eq!(fix_without_default["fixedColumns"], 0);
    assert_eq!(fix_without_default["warnings"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(&mut stdin, &mut reader, "4", "gradeTypes.seedDefaults", json!({}));
    let graded = create_lesson(&mut stdin, &mut reader, "5", &j, "2024-09-05");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "marks.set",
        json!({ "studentId": j.student_id, "columnId": str_at(&graded, "defaultColumnId"), "value": 3 }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "journal.check",
        json!({ "quarterId": j.quarter_id }),
    );
    assert_eq!(report["totalLessons"], 2);
    assert_eq!(report["totalMarks"], 1);
    assert_eq!(report["averageMark"], 3.0);
    let missing = report["lessonsWithoutColumns"].as_array().expect("lessonsWithoutColumns");
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0]["lessonId"], str_at(&bare, "lessonId").as_str());
    assert_eq!(report["fixedColumns"], 0);

    let fixed = request_ok(&mut stdin, &mut reader, "8", "journal.check", json!({ "fix": true }));
    assert_eq!(fixed["fixedColumns"], 1);

    let after = request_ok(&mut stdin, &mut reader, "9", "journal.check", json!({}));
    assert_eq!(after["lessonsWithoutColumns"].as_array().map(|a| a.len()), Some(0));

    let columns = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "lessonColumns.list",
        json!({ "lessonId": str_at(&bare, "lessonId") }),
    );
    let columns = columns["columns"].as_array().expect("columns");
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0]["gradeTypeTitle"], "Oral response");

    drop(stdin);
    let _ = child.wait();
}
