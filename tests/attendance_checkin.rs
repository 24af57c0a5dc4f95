use chrono::{Duration, Utc};
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

struct Fixture {
    activity_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let term = request_ok(
        stdin,
        reader,
        "seed-term",
        "terms.create",
        json!({ "name": "Fall 2025", "startDate": "2025-09-01" }),
    );
    let criterion = request_ok(
        stdin,
        reader,
        "seed-criterion",
        "criteria.create",
        json!({ "name": "Arts", "groupNo": 3, "maxPoints": 15.0 }),
    );
    let created = request_ok(
        stdin,
        reader,
        "seed-activity",
        "activities.create",
        json!({
            "actorId": "staff-1",
            "title": "Choir Rehearsal",
            "termId": term["termId"],
            "criterionId": criterion["criterionId"],
            "startsAt": (Utc::now() - Duration::hours(1)).to_rfc3339(),
            "endsAt": (Utc::now() + Duration::hours(2)).to_rfc3339(),
            "points": 2.0
        }),
    );
    Fixture {
        activity_id: created["activityId"].as_str().unwrap().to_string(),
    }
}

fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    activity_id: &str,
    student_id: &str,
) -> String {
    let reg = request_ok(
        stdin,
        reader,
        "reg",
        "registrations.register",
        json!({ "activityId": activity_id, "studentId": student_id }),
    );
    reg["registrationId"].as_str().unwrap().to_string()
}

#[test]
fn marking_present_twice_is_an_idempotent_success() {
    let workspace = temp_dir("meritd-attendance-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = seed(&mut stdin, &mut reader, &workspace);
    let registration_id = register(&mut stdin, &mut reader, &fixture.activity_id, "s1");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({ "registrationId": registration_id, "present": true, "actorId": "staff-1" }),
    );
    assert_eq!(first["status"], "checked_in");
    assert_eq!(first["changed"], true);

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({ "registrationId": registration_id, "present": true, "actorId": "staff-1" }),
    );
    assert_eq!(second["status"], "checked_in");
    assert_eq!(second["changed"], false);

    let counts = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registrations.counts",
        json!({ "activityId": fixture.activity_id }),
    );
    assert_eq!(counts["registeredCount"], 1);
    assert_eq!(counts["checkedInCount"], 1);
}

#[test]
fn unmarking_reverts_to_registered_and_clears_checkin_time() {
    let workspace = temp_dir("meritd-attendance-revert");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = seed(&mut stdin, &mut reader, &workspace);
    let registration_id = register(&mut stdin, &mut reader, &fixture.activity_id, "s1");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({ "registrationId": registration_id, "present": true, "actorId": "staff-1" }),
    );
    let reverted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({ "registrationId": registration_id, "present": false, "actorId": "staff-1" }),
    );
    assert_eq!(reverted["status"], "registered");

    let counts = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registrations.counts",
        json!({ "activityId": fixture.activity_id }),
    );
    assert_eq!(counts["registeredCount"], 1);
    assert_eq!(counts["checkedInCount"], 0);

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({ "registrationId": "no-such-registration", "present": true, "actorId": "staff-1" }),
    );
    assert_eq!(missing["error"]["code"], "not_found");
}

#[test]
fn bulk_import_matches_ids_and_emails_once_and_skips_strangers() {
    let workspace = temp_dir("meritd-attendance-import");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = seed(&mut stdin, &mut reader, &workspace);

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "displayName": "Ada Eze", "email": "ada@example.edu" }),
    );
    let ada = student["studentId"].as_str().unwrap().to_string();

    let _ = register(&mut stdin, &mut reader, &fixture.activity_id, &ada);
    let _ = register(&mut stdin, &mut reader, &fixture.activity_id, "s-direct");

    // One by email, one by id, a duplicate, and two strangers.
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.import",
        json!({
            "activityId": fixture.activity_id,
            "identifiers": [
                "ada@example.edu",
                "s-direct",
                "s-direct",
                "ghost@example.edu",
                "s-not-registered"
            ],
            "actorId": "staff-1"
        }),
    );
    assert_eq!(imported["updated"], 2);
    assert_eq!(imported["skipped"], 2);

    let counts = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registrations.counts",
        json!({ "activityId": fixture.activity_id }),
    );
    assert_eq!(counts["checkedInCount"], 2);

    // Re-import is harmless: already-present rows still count as successes.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.import",
        json!({
            "activityId": fixture.activity_id,
            "identifiers": ["ada@example.edu", "s-direct"],
            "actorId": "staff-1"
        }),
    );
    assert_eq!(again["updated"], 2);
}
