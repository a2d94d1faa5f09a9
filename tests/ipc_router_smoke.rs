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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("quizd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "0", "assessments.get", json!({ "assessmentId": "x" }));
    assert_eq!(before["error"]["code"], "no_workspace");

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "questions.upsert",
        json!({ "id": 1, "name": "Q1", "qtype": "essay", "category": "c" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({ "id": "smoke", "courseId": "c1", "name": "Smoke", "layout": "1,0", "now": 0 }),
    );

    let calls = vec![
        ("assessments.get", json!({ "assessmentId": "smoke" })),
        ("assessments.update", json!({ "assessmentId": "smoke", "name": "Smoke 2" })),
        ("assessments.setLayout", json!({ "assessmentId": "smoke", "layout": "1" })),
        ("assessments.setMaxGrade", json!({ "assessmentId": "smoke", "grade": 10.0 })),
        ("feedback.set", json!({ "assessmentId": "smoke", "texts": ["All"] })),
        ("feedback.forGrade", json!({ "assessmentId": "smoke", "grade": 5.0 })),
        ("layout.clean", json!({ "layout": "1,,2" })),
        ("layout.repaginate", json!({ "layout": "1,2,3", "perPage": 2 })),
        ("layout.addPageBreak", json!({ "layout": "1,2,0", "index": 1 })),
        ("layout.deleteEmptyPage", json!({ "layout": "1,0,0", "index": 2 })),
        ("layout.moveQuestion", json!({ "layout": "1,2,0", "questionId": 2, "shift": -1 })),
        ("layout.movePageBreak", json!({ "layout": "1,0,2,0", "index": 1, "shift": 1 })),
        ("overrides.list", json!({ "assessmentId": "smoke" })),
        ("overrides.save", json!({ "assessmentId": "smoke", "userId": "u1", "attempts": 2 })),
        ("overrides.resolve", json!({ "assessmentId": "smoke", "userId": "u1" })),
        ("overrides.delete", json!({ "overrideId": "missing" })),
        ("groups.setMembers", json!({ "groupId": "g1", "userIds": ["u1"] })),
        ("preflight.status", json!({ "assessmentId": "smoke", "userId": "u1" })),
        ("preflight.check", json!({ "assessmentId": "smoke", "userId": "u1" })),
        ("attempts.start", json!({ "assessmentId": "smoke", "userId": "u1", "seed": 1 })),
        ("attempts.list", json!({ "assessmentId": "smoke" })),
        ("attempts.get", json!({ "attemptId": "missing" })),
        ("attempts.page", json!({ "attemptId": "missing", "page": 0 })),
        ("attempts.process", json!({ "attemptId": "missing" })),
        ("attempts.autosave", json!({ "attemptId": "missing" })),
        ("attempts.finish", json!({ "attemptId": "missing" })),
        ("attempts.abandon", json!({ "attemptId": "missing" })),
        ("attempts.checkState", json!({ "attemptId": "missing" })),
        ("attempts.delete", json!({ "attemptId": "missing" })),
        ("attempts.deletePreviews", json!({ "assessmentId": "smoke" })),
        ("grades.get", json!({ "assessmentId": "smoke" })),
        ("grades.recompute", json!({ "assessmentId": "smoke", "userId": "u1" })),
        ("grades.updateAll", json!({ "assessmentId": "smoke" })),
        ("stats.get", json!({ "assessmentId": "smoke" })),
        ("stats.recalculate", json!({ "assessmentId": "smoke", "useAllAttempts": true })),
        ("stats.clear", json!({ "assessmentId": "smoke" })),
        ("cron.updateOverdue", json!({})),
        ("questions.delete", json!({ "questionId": 99 })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let _ = request(&mut stdin, &mut reader, &format!("c{}", i), method, params);
    }

    drop(stdin);
    let _ = child.wait();
}
