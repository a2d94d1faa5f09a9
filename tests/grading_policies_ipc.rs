use serde_json::{json, Value};
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
    let exe = env!("CARGO_BIN_EXE_quizd");
    let mut child = Command::new(exe)
        .env_remove("QUIZD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn quizd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

fn error_code(value: &Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn take_attempt(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    user: &str,
    fraction: f64,
    now: i64,
) -> Value {
    let started = request_ok(
        stdin,
        reader,
        &format!("start-{}", now),
        "attempts.start",
        json!({ "assessmentId": "graded", "userId": user, "now": now }),
    );
    request_ok(
        stdin,
        reader,
        &format!("finish-{}", now),
        "attempts.finish",
        json!({
            "attemptId": started["attempt"]["id"],
            "responses": [{ "slot": 1, "response": format!("r{}", fraction), "fraction": fraction }],
            "now": now + 10
        }),
    )
}

fn user_grade(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> Value {
    let grades = request_ok(
        stdin,
        reader,
        id,
        "grades.get",
        json!({ "assessmentId": "graded", "userId": "u1" }),
    );
    grades["grades"][0]["grade"].clone()
}

#[test]
fn grade_method_changes_regrade_stored_grades() {
    let workspace = temp_dir("quizd-grading-policies");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "questions.upsert",
        json!({ "id": 1, "name": "Q1", "qtype": "numerical", "category": "c" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "id": "graded",
            "courseId": "c1",
            "name": "Graded",
            "gradeMethod": "first",
            "layout": "1,0",
            "now": 100
        }),
    );

    let first = take_attempt(&mut stdin, &mut reader, "u1", 0.5, 1000);
    assert_eq!(first["attempt"]["attempt"], 1);
    assert_eq!(first["grade"], 5.0);
    take_attempt(&mut stdin, &mut reader, "u1", 1.0, 2000);
    let third = take_attempt(&mut stdin, &mut reader, "u1", 0.2, 3000);
    assert_eq!(third["attempt"]["attempt"], 3);
    assert_eq!(user_grade(&mut stdin, &mut reader, "4"), 5.0);

    for (i, (method, expected)) in [("last", 2.0), ("highest", 10.0), ("average", 5.67)]
        .into_iter()
        .enumerate()
    {
        let updated = request_ok(
            &mut stdin,
            &mut reader,
            &format!("update-{}", i),
            "assessments.update",
            json!({ "assessmentId": "graded", "gradeMethod": method, "now": 4000 + i as i64 }),
        );
        assert_eq!(updated["assessment"]["gradeMethod"], method);
        assert!(!updated["regraded"].is_null());
        assert_eq!(
            user_grade(&mut stdin, &mut reader, &format!("grade-{}", i)),
            expected,
            "{}",
            method
        );
    }

    // Same method again: nothing to regrade.
    let unchanged = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.update",
        json!({ "assessmentId": "graded", "name": "Renamed", "now": 4100 }),
    );
    assert!(unchanged["regraded"].is_null());
    assert_eq!(unchanged["assessment"]["name"], "Renamed");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn max_grade_change_scales_grades_and_feedback() {
    let workspace = temp_dir("quizd-grading-maxgrade");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "questions.upsert",
        json!({ "id": 1, "name": "Q1", "qtype": "numerical", "category": "c" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "id": "graded",
            "courseId": "c1",
            "name": "Graded",
            "gradeMethod": "average",
            "layout": "1,0",
            "now": 100
        }),
    );
    let bands = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "feedback.set",
        json!({
            "assessmentId": "graded",
            "texts": ["Great", "OK", "Poor"],
            "boundaries": ["50%", 2.5]
        }),
    );
    assert_eq!(bands["feedback"].as_array().map(|b| b.len()), Some(3));

    for (fraction, now) in [(0.5, 1000), (1.0, 2000), (0.2, 3000)] {
        take_attempt(&mut stdin, &mut reader, "u1", fraction, now);
    }
    assert_eq!(user_grade(&mut stdin, &mut reader, "5"), 5.67);

    let bad = request(
        &mut stdin,
        &mut reader,
        "6",
        "feedback.set",
        json!({ "assessmentId": "graded", "texts": ["A", "B"], "boundaries": [11.0] }),
    );
    assert_eq!(error_code(&bad), "config_error");

    let changed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "assessments.setMaxGrade",
        json!({ "assessmentId": "graded", "grade": 20.0, "now": 5000 }),
    );
    assert_eq!(changed["grade"], 20.0);
    assert_eq!(user_grade(&mut stdin, &mut reader, "8"), 11.33);

    for (grade, text) in [(11.33, "Great"), (7.0, "OK"), (4.99, "Poor")] {
        let fb = request_ok(
            &mut stdin,
            &mut reader,
            &format!("fb-{}", grade),
            "feedback.forGrade",
            json!({ "assessmentId": "graded", "grade": grade }),
        );
        assert_eq!(fb["feedback"], text, "grade {}", grade);
    }

    let conn = rusqlite::Connection::open(workspace.join("quiz.sqlite3")).expect("open db");
    let published: f64 = conn
        .query_row(
            "SELECT grade FROM gradebook_grades WHERE assessment_id = 'graded' AND user_id = 'u1'",
            [],
            |r| r.get(0),
        )
        .expect("gradebook row");
    assert!((published - 34.0 / 3.0).abs() < 1e-6);

    drop(stdin);
    let _ = child.wait();
}
