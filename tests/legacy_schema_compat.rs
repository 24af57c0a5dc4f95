use chrono::{Duration, Utc};
use rusqlite::Connection;
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
    let exe = env!("CARGO_BIN_EXE_meritd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn meritd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
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

/// Writes the pre-points-migration activities table into a fresh workspace
/// database so the sidecar finds the old shape on open.
fn seed_legacy_database(workspace: &PathBuf) {
    let conn = Connection::open(workspace.join("merit.sqlite3")).expect("open workspace db");
    conn.execute(
        "CREATE TABLE activities(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            term_id TEXT NOT NULL,
            criterion_id TEXT NOT NULL,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            status TEXT NOT NULL,
            approval_status TEXT NOT NULL,
            max_seats INTEGER,
            location TEXT,
            organizer_id TEXT NOT NULL,
            approver_id TEXT,
            approved_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )
    .expect("create legacy activities table");
}

#[test]
fn legacy_workspace_reports_points_unsupported_and_rejects_points_input() {
    let workspace = temp_dir("meritd-legacy-reject");
    seed_legacy_database(&workspace);

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["capabilities"]["activityPoints"], false);
    assert_eq!(selected["capabilities"]["scoreRecords"], false);

    let term = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "terms.create",
        json!({ "name": "Fall 2025", "startDate": "2025-09-01" }),
    );
    let criterion = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.create",
        json!({ "name": "Volunteering", "groupNo": 1, "maxPoints": 30.0 }),
    );

    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({
            "actorId": "staff-1",
            "title": "Campus Cleanup",
            "termId": term["termId"],
            "criterionId": criterion["criterionId"],
            "startsAt": (Utc::now() - Duration::hours(1)).to_rfc3339(),
            "endsAt": (Utc::now() + Duration::hours(2)).to_rfc3339(),
            "points": 5.0
        }),
    );
    assert_eq!(rejected["error"]["code"], "validation");
    let flagged: Vec<String> = rejected["error"]["details"]["fields"]
        .as_array()
        .expect("fields list")
        .iter()
        .map(|f| f["field"].as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(flagged, vec!["points"], "only points should be flagged: {}", rejected);
}

#[test]
fn legacy_workspace_still_registers_and_scores_from_the_base() {
    let workspace = temp_dir("meritd-legacy-score");
    seed_legacy_database(&workspace);

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "terms.create",
        json!({ "name": "Fall 2025", "startDate": "2025-09-01" }),
    );
    let criterion = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.create",
        json!({ "name": "Volunteering", "groupNo": 1, "maxPoints": 30.0 }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({
            "actorId": "staff-1",
            "title": "Campus Cleanup",
            "termId": term["termId"],
            "criterionId": criterion["criterionId"],
            "startsAt": (Utc::now() - Duration::hours(1)).to_rfc3339(),
            "endsAt": (Utc::now() + Duration::hours(2)).to_rfc3339()
        }),
    );
    let activity_id = created["activityId"].as_str().unwrap().to_string();

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.get",
        json!({ "activityId": activity_id }),
    );
    assert!(fetched["points"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.approve",
        json!({ "activityId": activity_id, "actorId": "dean-1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "registrations.register",
        json!({ "activityId": activity_id, "studentId": "s1" }),
    );

    // With no points column the activity contributes nothing and the score
    // is the base, explicitly flagged as such.
    let score = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "score.compute",
        json!({ "studentId": "s1" }),
    );
    assert_eq!(score["pointsSupported"], false);
    assert_eq!(score["activityScore"], 0.0);
    assert_eq!(score["total"], 70.0);
    assert_eq!(score["classification"], "Fair");
    let breakdown = score["breakdown"].as_array().expect("breakdown");
    assert_eq!(breakdown.len(), 1);
    assert_eq!(breakdown[0]["earned"], 0.0);
}

#[test]
fn reselecting_the_workspace_picks_up_an_externally_added_table() {
    let workspace = temp_dir("meritd-legacy-redetect");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(first["capabilities"]["scoreRecords"], false);

    {
        let conn = Connection::open(workspace.join("merit.sqlite3")).expect("open workspace db");
        conn.execute(
            "CREATE TABLE score_records(
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                term_id TEXT NOT NULL,
                total REAL NOT NULL,
                status TEXT NOT NULL,
                UNIQUE(student_id, term_id)
            )",
            [],
        )
        .expect("create score_records");
    }

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(second["capabilities"]["scoreRecords"], true);
}
