use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_bool, get_required_str, now_string, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

fn mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let registration_id = get_required_str(params, "registrationId")?;
    let present = get_required_bool(params, "present")?;
    let actor_id = get_required_str(params, "actorId")?;

    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM registrations WHERE id = ?",
            [&registration_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(status) = status else {
        return Err(HandlerErr::not_found("registration not found"));
    };
    if status == "cancelled" {
        return Err(HandlerErr::conflict("registration is cancelled"));
    }

    // Idempotent in both directions: re-marking the current state succeeds
    // without another write.
    let changed = match (present, status.as_str()) {
        (true, "checked_in") | (false, "registered") => false,
        (true, _) => {
            conn.execute(
                "UPDATE registrations SET status = 'checked_in', checked_in_at = ? WHERE id = ?",
                (now_string(), &registration_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            true
        }
        (false, _) => {
            conn.execute(
                "UPDATE registrations SET status = 'registered', checked_in_at = NULL WHERE id = ?",
                [&registration_id],
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            true
        }
    };

    if changed {
        audit::record_event(
            conn,
            &actor_id,
            "ATTENDANCE_MARK",
            json!({ "registrationId": registration_id, "present": present }),
        );
    }
    Ok(json!({
        "ok": true,
        "status": if present { "checked_in" } else { "registered" },
        "changed": changed
    }))
}

fn import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let Some(identifiers_json) = params.get("identifiers").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing identifiers"));
    };
    let identifiers: Vec<String> = identifiers_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM activities WHERE id = ?", [&activity_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("activity not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut updated: i64 = 0;
    let mut skipped: i64 = 0;
    let now = now_string();

    for ident in identifiers {
        // Duplicate identifiers in the sheet are processed once.
        if !seen.insert(ident.clone()) {
            continue;
        }

        // Each identifier is a student id, or an email resolved through
        // the student directory.
        let mut student_id = ident.clone();
        let reg = |sid: &str| -> Result<Option<(String, String)>, HandlerErr> {
            tx.query_row(
                "SELECT id, status FROM registrations
                 WHERE activity_id = ? AND student_id = ?
                   AND status IN ('registered', 'checked_in')",
                (&activity_id, sid),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(HandlerErr::db_query)
        };

        let mut found = reg(&student_id)?;
        if found.is_none() {
            let by_email: Option<String> = tx
                .query_row("SELECT id FROM students WHERE email = ?", [&ident], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(HandlerErr::db_query)?;
            if let Some(sid) = by_email {
                student_id = sid;
                found = reg(&student_id)?;
            }
        }

        match found {
            None => skipped += 1,
            Some((_, status)) if status == "checked_in" => updated += 1,
            Some((registration_id, _)) => {
                tx.execute(
                    "UPDATE registrations SET status = 'checked_in', checked_in_at = ?
                     WHERE id = ?",
                    (&now, &registration_id),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
                updated += 1;
            }
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        "ATTENDANCE_IMPORT",
        json!({ "activityId": activity_id, "updated": updated, "skipped": skipped }),
    );
    Ok(json!({ "updated": updated, "skipped": skipped }))
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
        "attendance.mark" => Some(dispatch(state, req, mark)),
        "attendance.import" => Some(dispatch(state, req, import)),
        _ => None,
    }
}
