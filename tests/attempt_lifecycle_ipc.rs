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

fn setup_questions(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    for id in 1..=3 {
        request_ok(
            stdin,
            reader,
            &format!("q{}", id),
            "questions.upsert",
            json!({
                "id": id,
                "name": format!("Q{}", id),
                "qtype": "shortanswer",
                "category": "c",
                "defaultMark": 1.0
            }),
        );
    }
}

#[test]
fn grace_period_attempt_goes_overdue_then_abandoned() {
    let workspace = temp_dir("quizd-lifecycle-grace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    setup_questions(&mut stdin, &mut reader);
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.create",
        json!({
            "id": "quiz1",
            "courseId": "c1",
            "name": "Grace quiz",
            "timeOpen": 1000,
            "timeClose": 5000,
            "gracePeriod": 600,
            "overdueHandling": "graceperiod",
            "layout": "1,2,0,3",
            "now": 1000
        }),
    );
    assert_eq!(created["numberOfPages"], 2);
    assert_eq!(created["assessment"]["sumGrades"], 3.0);

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attempts.start",
        json!({ "assessmentId": "quiz1", "userId": "u1", "now": 2000 }),
    );
    let attempt_id = started["attempt"]["id"].as_str().expect("attempt id").to_string();
    assert_eq!(started["attempt"]["state"], "inprogress");
    assert_eq!(started["attempt"]["timeCheckState"], 5000);
    assert_eq!(started["resumed"], false);
    assert_eq!(started["slots"].as_array().map(|s| s.len()), Some(2));

    // Starting again resumes the open attempt.
    let resumed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.start",
        json!({ "assessmentId": "quiz1", "userId": "u1", "now": 2100 }),
    );
    assert_eq!(resumed["resumed"], true);
    assert_eq!(resumed["attempt"]["id"], attempt_id.as_str());

    let processed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attempts.process",
        json!({
            "attemptId": attempt_id,
            "responses": [{ "slot": 1, "response": "A", "fraction": 1.0 }],
            "now": 3000
        }),
    );
    assert_eq!(processed["state"], "inprogress");

    let overdue = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attempts.checkState",
        json!({ "attemptId": attempt_id, "online": false, "now": 5100 }),
    );
    assert_eq!(overdue["attempt"]["state"], "overdue");
    assert_eq!(overdue["dueDate"], 5600);

    let still = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.get",
        json!({ "attemptId": attempt_id, "now": 5200 }),
    );
    assert_eq!(still["attempt"]["state"], "overdue");
    assert_eq!(still["attempt"]["timeCheckState"], 5600);

    let abandoned = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.checkState",
        json!({ "attemptId": attempt_id, "online": false, "now": 5700 }),
    );
    assert_eq!(abandoned["attempt"]["state"], "abandoned");
    assert!(abandoned["attempt"]["timeCheckState"].is_null());
    assert!(abandoned["dueDate"].is_null());

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.get",
        json!({ "assessmentId": "quiz1" }),
    );
    assert_eq!(grades["grades"].as_array().map(|g| g.len()), Some(0));

    let conn = rusqlite::Connection::open(workspace.join("quiz.sqlite3")).expect("open db");
    let events: Vec<String> = conn
        .prepare("SELECT name FROM event_log WHERE attempt_id = ? ORDER BY id")
        .expect("prepare")
        .query_map([&attempt_id], |r| r.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(
        events,
        vec!["attempt_started", "attempt_becameoverdue", "attempt_abandoned"]
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn autosubmit_finishes_at_deadline_with_autosaved_answers() {
    let workspace = temp_dir("quizd-lifecycle-autosubmit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    setup_questions(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.create",
        json!({
            "id": "quiz2",
            "courseId": "c1",
            "name": "Auto quiz",
            "timeClose": 5000,
            "overdueHandling": "autosubmit",
            "layout": "1,2,3",
            "now": 1000
        }),
    );
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attempts.start",
        json!({ "assessmentId": "quiz2", "userId": "u1", "now": 2000, "seed": 7 }),
    );
    let attempt_id = started["attempt"]["id"].as_str().expect("attempt id").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.autosave",
        json!({
            "attemptId": attempt_id,
            "responses": [{ "slot": 1, "response": "B", "fraction": 1.0 }]
        }),
    );

    let finished = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attempts.checkState",
        json!({ "attemptId": attempt_id, "online": false, "now": 5100 }),
    );
    assert_eq!(finished["attempt"]["state"], "finished");
    assert_eq!(finished["attempt"]["timeFinish"], 5000);
    assert_eq!(finished["attempt"]["sumGrades"], 1.0);
    // One of three questions right, rescaled onto the default maximum of 10.
    assert_eq!(finished["grade"], 3.33);

    let slots = finished["slots"].as_array().expect("slots");
    assert_eq!(slots[0]["state"], "gradedright");
    assert_eq!(slots[1]["state"], "gaveup");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.get",
        json!({ "assessmentId": "quiz2", "userId": "u1" }),
    );
    assert_eq!(grades["grades"][0]["grade"], 3.33);

    // Finishing again changes nothing.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.finish",
        json!({ "attemptId": attempt_id, "now": 6000 }),
    );
    assert_eq!(again["attempt"]["timeFinish"], 5000);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn time_limit_requires_preflight_and_password() {
    let workspace = temp_dir("quizd-lifecycle-preflight");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    setup_questions(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.create",
        json!({
            "id": "quiz3",
            "courseId": "c1",
            "name": "Timed quiz",
            "timeLimit": 600,
            "password": "secret",
            "layout": "1,0",
            "now": 0
        }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "attempts.start",
        json!({ "assessmentId": "quiz3", "userId": "u1", "now": 100 }),
    );
    assert_eq!(error_code(&refused), "access_denied");

    let wrong = request(
        &mut stdin,
        &mut reader,
        "4",
        "preflight.check",
        json!({ "assessmentId": "quiz3", "userId": "u1", "password": "nope", "now": 100 }),
    );
    assert_eq!(error_code(&wrong), "access_denied");

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "preflight.check",
        json!({ "assessmentId": "quiz3", "userId": "u1", "password": "secret", "now": 100 }),
    );
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attempts.start",
        json!({ "assessmentId": "quiz3", "userId": "u1", "now": 100 }),
    );
    assert_eq!(started["endTime"], 700);

    // A page submitted a second before the end counts as time up.
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.process",
        json!({
            "attemptId": started["attempt"]["id"],
            "responses": [{ "slot": 1, "response": "x", "fraction": 0.5 }],
            "now": 699
        }),
    );
    assert_eq!(submitted["state"], "finished");
    assert_eq!(submitted["grade"], 5.0);

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "preflight.status",
        json!({ "assessmentId": "quiz3", "userId": "u1", "now": 800 }),
    );
    assert_eq!(status["required"], true);

    drop(stdin);
    let _ = child.wait();
}
