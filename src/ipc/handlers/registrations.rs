use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, now_string, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ActivityGate {
    status: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    max_seats: Option<i64>,
}

fn load_gate(conn: &Connection, activity_id: &str) -> Result<ActivityGate, HandlerErr> {
    let row: Option<(String, String, String, Option<i64>)> = conn
        .query_row(
            "SELECT status, starts_at, ends_at, max_seats FROM activities WHERE id = ?",
            [activity_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((status, starts_raw, ends_raw, max_seats)) = row else {
        return Err(HandlerErr::not_found("activity not found"));
    };
    let parse = |raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| HandlerErr::new("db_query_failed", format!("bad stored timestamp: {}", e)))
    };
    Ok(ActivityGate {
        status,
        starts_at: parse(&starts_raw)?,
        ends_at: parse(&ends_raw)?,
        max_seats,
    })
}

fn active_count(conn: &Connection, activity_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM registrations
         WHERE activity_id = ? AND status IN ('registered', 'checked_in')",
        [activity_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let student_id = get_required_str(params, "studentId")?;

    // Fast-path precondition checks for good error messages. The store's
    // unique index and the guarded insert below remain the authority.
    let gate = load_gate(conn, &activity_id)?;
    if gate.status != "open" {
        return Err(HandlerErr::conflict("activity is not open for registration"));
    }
    if Utc::now() > gate.ends_at {
        return Err(HandlerErr::conflict("registration window has closed"));
    }

    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM registrations
             WHERE activity_id = ? AND student_id = ?
               AND status IN ('registered', 'checked_in')",
            (&activity_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if duplicate.is_some() {
        return Err(HandlerErr::conflict("already registered"));
    }
    if let Some(cap) = gate.max_seats {
        if active_count(conn, &activity_id)? >= cap {
            return Err(HandlerErr::conflict("activity full"));
        }
    }

    // Capacity re-checked inside the insert itself: under concurrent
    // writers the last seat goes to exactly one of them.
    let registration_id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO registrations(id, activity_id, student_id, status, registered_at)
         SELECT ?, ?, ?, 'registered', ?
         WHERE (SELECT COUNT(*) FROM registrations
                 WHERE activity_id = ? AND status IN ('registered', 'checked_in'))
               < (SELECT COALESCE(max_seats, 9223372036854775807)
                    FROM activities WHERE id = ?)",
        (
            &registration_id,
            &activity_id,
            &student_id,
            now_string(),
            &activity_id,
            &activity_id,
        ),
    );
    match inserted {
        Ok(0) => return Err(HandlerErr::conflict("activity full")),
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // Lost a duplicate race: report it as the business conflict it
            // is, not as a storage failure.
            return Err(HandlerErr::conflict("already registered"));
        }
        Err(e) => return Err(HandlerErr::new("db_insert_failed", e.to_string())),
    }

    audit::record_event(
        conn,
        &student_id,
        "REGISTER",
        json!({ "activityId": activity_id, "registrationId": registration_id }),
    );
    Ok(json!({ "registrationId": registration_id }))
}

fn unregister(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let student_id = get_required_str(params, "studentId")?;

    let gate = load_gate(conn, &activity_id)?;
    if gate.status != "open" {
        return Err(HandlerErr::conflict("activity is not open"));
    }
    if Utc::now() >= gate.starts_at {
        return Err(HandlerErr::conflict("activity has already started"));
    }

    let reg: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM registrations
             WHERE activity_id = ? AND student_id = ?
               AND status IN ('registered', 'checked_in')",
            (&activity_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((registration_id, status)) = reg else {
        return Err(HandlerErr::not_found("registration not found"));
    };
    if status == "checked_in" {
        return Err(HandlerErr::conflict("attendance already recorded"));
    }

    // Cancel rather than delete: the row stays as history.
    conn.execute(
        "UPDATE registrations SET status = 'cancelled' WHERE id = ?",
        [&registration_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &student_id,
        "UNREGISTER",
        json!({ "activityId": activity_id, "registrationId": registration_id }),
    );
    Ok(json!({ "ok": true }))
}

fn counts(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM activities WHERE id = ?", [&activity_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("activity not found"));
    }

    let (registered, checked_in): (i64, i64) = conn
        .query_row(
            "SELECT
               COUNT(*) FILTER (WHERE status IN ('registered', 'checked_in')),
               COUNT(*) FILTER (WHERE status = 'checked_in')
             FROM registrations WHERE activity_id = ?",
            [&activity_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "registeredCount": registered, "checkedInCount": checked_in }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "registrations.register" => Some(dispatch(state, req, register)),
        "registrations.unregister" => Some(dispatch(state, req, unregister)),
        "registrations.counts" => Some(dispatch(state, req, counts)),
        _ => None,
    }
}
