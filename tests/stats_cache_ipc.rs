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

fn answer(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    user: &str,
    right: [bool; 2],
    now: i64,
) {
    let started = request_ok(
        stdin,
        reader,
        &format!("start-{}", user),
        "attempts.start",
        json!({ "assessmentId": "stats", "userId": user, "now": now }),
    );
    let responses: Vec<Value> = right
        .iter()
        .enumerate()
        .map(|(i, ok)| {
            json!({
                "slot": i + 1,
                "response": if *ok { "right" } else { "wrong" },
                "fraction": if *ok { 1.0 } else { 0.0 },
            })
        })
        .collect();
    request_ok(
        stdin,
        reader,
        &format!("finish-{}", user),
        "attempts.finish",
        json!({ "attemptId": started["attempt"]["id"], "responses": responses, "now": now + 30 }),
    );
}

fn stats(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    extra: Value,
) -> Value {
    let mut params = json!({ "assessmentId": "stats" });
    if let (Some(p), Some(e)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            p.insert(k.clone(), v.clone());
        }
    }
    request_ok(stdin, reader, id, method, params)
}

#[test]
fn statistics_are_cached_until_the_ttl_runs_out() {
    let workspace = temp_dir("quizd-stats-cache");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    let ttl = health["statsCacheTtlS"].as_i64().expect("ttl");
    assert!(ttl > 200);

    for id in [1, 2] {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("q{}", id),
            "questions.upsert",
            json!({ "id": id, "name": format!("Q{}", id), "qtype": "truefalse", "category": "c" }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({ "id": "stats", "courseId": "c1", "name": "Stats", "layout": "1,2,0", "now": 0 }),
    );
    answer(&mut stdin, &mut reader, "u1", [true, true], 1000);
    answer(&mut stdin, &mut reader, "u2", [true, false], 1100);
    answer(&mut stdin, &mut reader, "u3", [false, true], 1200);
    answer(&mut stdin, &mut reader, "u4", [false, false], 1300);

    let fresh = stats(&mut stdin, &mut reader, "4", "stats.get", json!({ "now": 10_000 }));
    assert_eq!(fresh["fromCache"], false);
    assert_eq!(fresh["sampleSize"], 4);
    assert_eq!(fresh["quiz"]["firstAttemptsAvg"], 1.0);
    assert_eq!(fresh["percentages"]["firstAttemptsAvg"], 50.0);
    assert_eq!(fresh["quiz"]["median"], 1.0);
    let questions = fresh["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 2);
    for q in questions {
        assert_eq!(q["s"], 4);
        assert_eq!(q["facility"], 0.5);
    }
    let right_rows: Vec<&Value> = fresh["responses"]
        .as_array()
        .expect("responses")
        .iter()
        .filter(|r| r["questionId"] == 1 && r["response"] == "right")
        .collect();
    assert_eq!(right_rows.len(), 1);
    assert_eq!(right_rows[0]["count"], 2);

    let cached = stats(&mut stdin, &mut reader, "5", "stats.get", json!({ "now": 10_100 }));
    assert_eq!(cached["fromCache"], true);
    assert_eq!(cached["quiz"]["hashCode"], fresh["quiz"]["hashCode"]);

    // A new attempt does not invalidate the snapshot.
    answer(&mut stdin, &mut reader, "u5", [true, true], 10_150);
    let stale = stats(&mut stdin, &mut reader, "6", "stats.get", json!({ "now": 10_200 }));
    assert_eq!(stale["fromCache"], true);
    assert_eq!(stale["sampleSize"], 4);

    let expired = stats(
        &mut stdin,
        &mut reader,
        "7",
        "stats.get",
        json!({ "now": 10_000 + ttl + 1 }),
    );
    assert_eq!(expired["fromCache"], false);
    assert_eq!(expired["sampleSize"], 5);
    assert_eq!(expired["quiz"]["firstAttemptsAvg"], 1.2);

    let forced = stats(
        &mut stdin,
        &mut reader,
        "8",
        "stats.recalculate",
        json!({ "now": 10_000 + ttl + 2 }),
    );
    assert_eq!(forced["fromCache"], false);

    let cleared = stats(&mut stdin, &mut reader, "9", "stats.clear", json!({}));
    assert_eq!(cleared["cleared"], 1);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn group_and_attempt_selection_have_separate_snapshots() {
    let workspace = temp_dir("quizd-stats-groups");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for id in [1, 2] {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("q{}", id),
            "questions.upsert",
            json!({ "id": id, "name": format!("Q{}", id), "qtype": "truefalse", "category": "c" }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.create",
        json!({ "id": "stats", "courseId": "c1", "name": "Stats", "layout": "1,2,0", "now": 0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "groups.setMembers",
        json!({ "groupId": "g1", "userIds": ["u1", "u2"] }),
    );
    answer(&mut stdin, &mut reader, "u1", [true, true], 1000);
    answer(&mut stdin, &mut reader, "u2", [true, false], 1100);
    answer(&mut stdin, &mut reader, "u3", [false, false], 1200);

    let group = stats(
        &mut stdin,
        &mut reader,
        "4",
        "stats.get",
        json!({ "groupId": "g1", "now": 5000 }),
    );
    assert_eq!(group["sampleSize"], 2);
    assert_eq!(group["quiz"]["firstAttemptsAvg"], 1.5);
    assert_eq!(group["quiz"]["groupId"], "g1");

    let everyone = stats(
        &mut stdin,
        &mut reader,
        "5",
        "stats.get",
        json!({ "useAllAttempts": true, "now": 5000 }),
    );
    assert_eq!(everyone["fromCache"], false);
    assert_eq!(everyone["sampleSize"], 3);
    assert_eq!(everyone["quiz"]["whichAttempts"], "all");
    assert_ne!(everyone["quiz"]["hashCode"], group["quiz"]["hashCode"]);

    drop(stdin);
    let _ = child.wait();
}
