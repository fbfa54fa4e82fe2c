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

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value["error"]["code"].as_str().unwrap_or("").to_string()
}

fn str_at(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct YearFixture {
    year_id: String,
    quarter_ids: Vec<String>,
    subject_id: String,
    class_id: String,
    teacher_id: String,
    student_id: String,
}

fn seed_year(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> YearFixture {
    let year = request_ok(
        stdin,
        reader,
        "seed-year",
        "years.create",
        json!({ "label": "2024-2025", "startDate": "2024-09-01", "endDate": "2025-05-31" }),
    );
    let year_id = str_at(&year, "yearId");
    let ranges = [
        ("2024-09-02", "2024-10-27"),
        ("2024-11-05", "2024-12-28"),
        ("2025-01-09", "2025-03-22"),
    ];
    let mut quarter_ids = Vec::new();
    for (i, (start, end)) in ranges.iter().enumerate() {
        let q = request_ok(
            stdin,
            reader,
            &format!("seed-q{}", i + 1),
            "quarters.create",
            json!({ "yearId": year_id, "number": i + 1, "startDate": start, "endDate": end }),
        );
        quarter_ids.push(str_at(&q, "quarterId"));
    }
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "title": "History" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "9B", "yearOfStudy": 9, "yearId": year_id }),
    );
    let class_id = str_at(&class, "classId");
    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "teachers.create",
        json!({ "lastName": "Petrov", "firstName": "Ilya" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        json!({ "classId": class_id, "lastName": "Belova", "firstName": "Dasha" }),
    );
    YearFixture {
        year_id,
        quarter_ids,
        subject_id: str_at(&subject, "subjectId"),
        class_id,
        teacher_id: str_at(&teacher, "teacherId"),
        student_id: str_at(&student, "studentId"),
    }
}

/// Saves a manual quarterly grade (or just creates the row) and returns its id.
fn save_quarter(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    subject_id: &str,
    quarter_id: &str,
    grade: Option<i64>,
) -> String {
    let mut params = json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "quarterId": quarter_id,
        "comment": "",
    });
    if let Some(g) = grade {
        params["grade"] = json!(g);
    }
    let saved = request_ok(stdin, reader, id, "quarterly.save", params);
    str_at(&saved["quarterly"], "id")
}

#[test]
fn yearly_mean_skips_ungraded_quarters_and_rounds_half_up() {
    let workspace = temp_dir("journald-yearly");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let f = seed_year(&mut stdin, &mut reader);

    let q1 = save_quarter(&mut stdin, &mut reader, "2", &f.student_id, &f.subject_id, &f.quarter_ids[0], None);
    let q2 = save_quarter(&mut stdin, &mut reader, "3", &f.student_id, &f.subject_id, &f.quarter_ids[1], Some(4));
    let q3 = save_quarter(&mut stdin, &mut reader, "4", &f.student_id, &f.subject_id, &f.quarter_ids[2], Some(5));

    let key = json!({ "studentId": f.student_id, "subjectId": f.subject_id, "yearId": f.year_id });

    // Nothing linked yet.
    let empty = request_ok(&mut stdin, &mut reader, "5", "yearly.recalculate", key.clone());
    assert!(empty["yearly"]["calculatedGrade"].is_null());
    assert!(empty["yearly"]["suggestedGrade"].is_null());
    assert_eq!(empty["yearly"]["calculationDetails"]["quartersUsed"], 0);
    assert_eq!(empty["yearly"]["calculationMethod"], "AVERAGE");

    let mut link = key.clone();
    link["quarterlyGradeIds"] = json!([q3, q1, q2]);
    let linked = request_ok(&mut stdin, &mut reader, "6", "yearly.setQuarters", link);
    assert_eq!(linked["yearly"]["quarterlyGradeIds"].as_array().map(|a| a.len()), Some(3));

    // [empty, 4, 5] -> 4.5 -> 5 with two quarters used.
    let calc = request_ok(&mut stdin, &mut reader, "7", "yearly.recalculate", key.clone());
    let y = &calc["yearly"];
    assert_eq!(y["calculatedGrade"], 4.5);
    assert_eq!(y["suggestedGrade"], 5);
    let details = &y["calculationDetails"];
    assert_eq!(details["quartersUsed"], 2);
    assert_eq!(details["method"], "AVERAGE");
    let by_quarter = details["byQuarter"].as_array().expect("byQuarter");
    assert_eq!(by_quarter.len(), 3);
    assert_eq!(by_quarter[0]["quarter"], 1);
    assert!(by_quarter[0]["grade"].is_null());
    assert_eq!(by_quarter[2]["grade"], 5);

    // [2, 3] -> 2.5 -> 3.
    let _ = save_quarter(&mut stdin, &mut reader, "8", &f.student_id, &f.subject_id, &f.quarter_ids[1], Some(2));
    let _ = save_quarter(&mut stdin, &mut reader, "9", &f.student_id, &f.subject_id, &f.quarter_ids[2], Some(3));
    let mut relink = key.clone();
    relink["quarterlyGradeIds"] = json!([q2, q3]);
    let _ = request_ok(&mut stdin, &mut reader, "10", "yearly.setQuarters", relink);
    let calc = request_ok(&mut stdin, &mut reader, "11", "yearly.recalculate", key.clone());
    assert_eq!(calc["yearly"]["calculatedGrade"], 2.5);
    assert_eq!(calc["yearly"]["suggestedGrade"], 3);
    assert_eq!(calc["yearly"]["calculationDetails"]["quartersUsed"], 2);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn yearly_methods_save_and_finalize() {
    let workspace = temp_dir("journald-yearly-methods");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let f = seed_year(&mut stdin, &mut reader);
    let q1 = save_quarter(&mut stdin, &mut reader, "2", &f.student_id, &f.subject_id, &f.quarter_ids[0], Some(3));
    let q2 = save_quarter(&mut stdin, &mut reader, "3", &f.student_id, &f.subject_id, &f.quarter_ids[1], Some(4));

    let key = json!({ "studentId": f.student_id, "subjectId": f.subject_id, "yearId": f.year_id });
    let mut link = key.clone();
    link["quarterlyGradeIds"] = json!([q1, q2]);
    let _ = request_ok(&mut stdin, &mut reader, "4", "yearly.setQuarters", link);

    let mut weighted = key.clone();
    weighted["calculationMethod"] = json!("WEIGHTED");
    let code = request_err(&mut stdin, &mut reader, "5", "yearly.save", weighted);
    assert_eq!(code, "unsupported_method");

    let mut manual = key.clone();
    manual["calculationMethod"] = json!("MANUAL");
    manual["grade"] = json!(5);
    manual["comment"] = json!("olympiad winner");
    let saved = request_ok(&mut stdin, &mut reader, "6", "yearly.save", manual);
    assert_eq!(saved["yearly"]["calculationMethod"], "MANUAL");
    assert_eq!(saved["yearly"]["grade"], 5);
    // Save never recomputes.
    assert!(saved["yearly"]["calculatedGrade"].is_null());

    // MANUAL still computes a suggestion for display.
    let calc = request_ok(&mut stdin, &mut reader, "7", "yearly.recalculate", key.clone());
    assert_eq!(calc["yearly"]["calculatedGrade"], 3.5);
    assert_eq!(calc["yearly"]["suggestedGrade"], 4);
    assert_eq!(calc["yearly"]["grade"], 5);
    assert_eq!(calc["yearly"]["calculationDetails"]["method"], "MANUAL");

    let mut bad_grade = key.clone();
    bad_grade["grade"] = json!(7);
    let code = request_err(&mut stdin, &mut reader, "8", "yearly.save", bad_grade);
    assert_eq!(code, "bad_params");

    let finalized = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "yearly.finalize",
        json!({
            "studentId": f.student_id,
            "subjectId": f.subject_id,
            "yearId": f.year_id,
            "teacherId": f.teacher_id
        }),
    );
    assert_eq!(finalized["yearly"]["isFinalized"], true);
    assert_eq!(finalized["yearly"]["finalizedBy"], f.teacher_id.as_str());

    let fetched = request_ok(&mut stdin, &mut reader, "10", "yearly.get", key);
    assert_eq!(fetched["yearly"]["comment"], "olympiad winner");
    assert_eq!(fetched["yearly"]["isFinalized"], true);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn linked_quarters_must_match_student_subject_and_year() {
    let workspace = temp_dir("journald-yearly-links");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let f = seed_year(&mut stdin, &mut reader);
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": f.class_id, "lastName": "Orlov", "firstName": "Pavel" }),
    );
    let other_id = str_at(&other, "studentId");
    let foreign = save_quarter(&mut stdin, &mut reader, "3", &other_id, &f.subject_id, &f.quarter_ids[0], Some(5));

    let key = json!({ "studentId": f.student_id, "subjectId": f.subject_id, "yearId": f.year_id });
    let mut link = key.clone();
    link["quarterlyGradeIds"] = json!([foreign]);
    let code = request_err(&mut stdin, &mut reader, "4", "yearly.setQuarters", link);
    assert_eq!(code, "bad_params");

    let mut missing = key.clone();
    missing["quarterlyGradeIds"] = json!(["no-such-row"]);
    let code = request_err(&mut stdin, &mut reader, "5", "yearly.setQuarters", missing);
    assert_eq!(code, "not_found");

    let mut not_array = key.clone();
    not_array["quarterlyGradeIds"] = json!("q1");
    let code = request_err(&mut stdin, &mut reader, "6", "yearly.setQuarters", not_array);
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "yearly.recalculate",
        json!({ "studentId": f.student_id, "subjectId": f.subject_id, "yearId": "no-such-year" }),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let _ = child.wait();
}
