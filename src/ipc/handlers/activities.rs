use crate::audit;
use crate::db::SchemaCaps;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    format_datetime, get_opt_i64, get_opt_str, get_required_str, now_string, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 4] = ["open", "closed", "full", "cancelled"];
const APPROVAL_STATUSES: [&str; 3] = ["pending", "approved", "rejected"];

const PAGE_SIZE_MIN: i64 = 5;
const PAGE_SIZE_MAX: i64 = 50;
const PAGE_SIZE_DEFAULT: i64 = 20;

fn parse_status(raw: &str) -> Option<String> {
    let t = raw.trim().to_ascii_lowercase();
    STATUSES.contains(&t.as_str()).then_some(t)
}

fn parse_approval_status(raw: &str) -> Option<String> {
    let t = raw.trim().to_ascii_lowercase();
    APPROVAL_STATUSES.contains(&t.as_str()).then_some(t)
}

/// "ALL"/empty/null collapse to no filter; anything else must be a member
/// of `allowed`.
fn parse_filter_value(
    params: &serde_json::Value,
    key: &str,
    allowed: &[&str],
) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_opt_str(params, key)? else {
        return Ok(None);
    };
    let t = raw.trim().to_ascii_lowercase();
    if t.is_empty() || t == "all" {
        return Ok(None);
    }
    if allowed.contains(&t.as_str()) {
        Ok(Some(t))
    } else {
        Err(HandlerErr::new(
            "bad_params",
            format!("{} must be one of {} or 'all'", key, allowed.join("/")),
        ))
    }
}

fn activity_exists(conn: &Connection, activity_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM activities WHERE id = ?", [activity_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn active_registration_count(conn: &Connection, activity_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM registrations
         WHERE activity_id = ? AND status IN ('registered', 'checked_in')",
        [activity_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

struct ActivityInput {
    title: String,
    description: Option<String>,
    term_id: String,
    criterion_id: String,
    starts_at: String,
    ends_at: String,
    max_seats: Option<i64>,
    points: Option<f64>,
    location: Option<String>,
    status: Option<String>,
}

/// Validate the full create/update payload before any write, collecting
/// every field error rather than stopping at the first one.
fn parse_activity_input(
    conn: &Connection,
    caps: SchemaCaps,
    params: &serde_json::Value,
) -> Result<ActivityInput, HandlerErr> {
    let mut fields: Vec<(&str, String)> = Vec::new();

    let title = get_opt_str(params, "title")?
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if title.is_empty() {
        fields.push(("title", "title is required".to_string()));
    }

    let term_id = get_opt_str(params, "termId")?.unwrap_or_default();
    if term_id.is_empty() {
        fields.push(("termId", "termId is required".to_string()));
    } else {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::db_query)?;
        if known.is_none() {
            fields.push(("termId", "unknown term".to_string()));
        }
    }

    let criterion_id = get_opt_str(params, "criterionId")?.unwrap_or_default();
    if criterion_id.is_empty() {
        fields.push(("criterionId", "criterionId is required".to_string()));
    } else {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM criteria WHERE id = ?", [&criterion_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        if known.is_none() {
            fields.push(("criterionId", "unknown criterion".to_string()));
        }
    }

    let mut window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    let starts_raw = get_opt_str(params, "startsAt")?.unwrap_or_default();
    let ends_raw = get_opt_str(params, "endsAt")?.unwrap_or_default();
    let starts = DateTime::parse_from_rfc3339(&starts_raw).map(|d| d.with_timezone(&Utc));
    let ends = DateTime::parse_from_rfc3339(&ends_raw).map(|d| d.with_timezone(&Utc));
    match (&starts, &ends) {
        (Ok(s), Ok(e)) => {
            if s < e {
                window = Some((*s, *e));
            } else {
                fields.push(("startsAt", "startsAt must be before endsAt".to_string()));
            }
        }
        _ => {
            if starts.is_err() {
                fields.push(("startsAt", "startsAt must be an RFC3339 timestamp".to_string()));
            }
            if ends.is_err() {
                fields.push(("endsAt", "endsAt must be an RFC3339 timestamp".to_string()));
            }
        }
    }

    let max_seats = get_opt_i64(params, "maxSeats")?;
    if let Some(s) = max_seats {
        if s < 0 {
            fields.push(("maxSeats", "maxSeats must be >= 0".to_string()));
        }
    }

    let points = match params.get("points") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(p) if p >= 0.0 => Some(p),
            Some(_) => {
                fields.push(("points", "points must be >= 0".to_string()));
                None
            }
            None => {
                fields.push(("points", "points must be a number".to_string()));
                None
            }
        },
    };
    if points.is_some() && !caps.activity_points {
        fields.push((
            "points",
            "this workspace schema has no points column".to_string(),
        ));
    }

    let status = match get_opt_str(params, "status")? {
        None => None,
        Some(raw) => match parse_status(&raw) {
            Some(s) => Some(s),
            None => {
                fields.push(("status", format!("status must be one of {}", STATUSES.join("/"))));
                None
            }
        },
    };

    if !fields.is_empty() {
        return Err(HandlerErr::validation(fields));
    }

    let (starts_at, ends_at) = window.expect("window validated above");
    Ok(ActivityInput {
        title,
        description: get_opt_str(params, "description")?,
        term_id,
        criterion_id,
        starts_at: format_datetime(starts_at),
        ends_at: format_datetime(ends_at),
        max_seats,
        points,
        location: get_opt_str(params, "location")?,
        status,
    })
}

fn activities_search(
    conn: &Connection,
    caps: SchemaCaps,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_opt_str(params, "termId")?.filter(|t| !t.is_empty() && t != "all");
    let criterion_id = get_opt_str(params, "criterionId")?.filter(|c| !c.is_empty() && c != "all");
    let status = parse_filter_value(params, "status", &STATUSES)?;
    let approval_status = parse_filter_value(params, "approvalStatus", &APPROVAL_STATUSES)?;
    let keyword = get_opt_str(params, "keyword")?
        .map(|k| k.trim().to_ascii_lowercase())
        .filter(|k| !k.is_empty());

    let page = get_opt_i64(params, "page")?.unwrap_or(1).max(1);
    let page_size = get_opt_i64(params, "pageSize")?
        .unwrap_or(PAGE_SIZE_DEFAULT)
        .clamp(PAGE_SIZE_MIN, PAGE_SIZE_MAX);

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(t) = &term_id {
        clauses.push("a.term_id = ?");
        binds.push(Value::Text(t.clone()));
    }
    if let Some(c) = &criterion_id {
        clauses.push("a.criterion_id = ?");
        binds.push(Value::Text(c.clone()));
    }
    if let Some(s) = &status {
        clauses.push("a.status = ?");
        binds.push(Value::Text(s.clone()));
    }
    if let Some(s) = &approval_status {
        clauses.push("a.approval_status = ?");
        binds.push(Value::Text(s.clone()));
    }
    if let Some(k) = &keyword {
        // Matched inside SQLite so large description fields are never
        // loaded into the process for rows that do not match.
        clauses.push("(instr(lower(a.title), ?) > 0 OR instr(lower(COALESCE(a.description, '')), ?) > 0)");
        binds.push(Value::Text(k.clone()));
        binds.push(Value::Text(k.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM activities a{}", where_sql),
            params_from_iter(binds.iter().cloned()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let points_expr = if caps.activity_points { "a.points" } else { "NULL" };
    let sql = format!(
        "SELECT a.id, a.title, a.term_id, a.criterion_id, a.starts_at, a.ends_at,
           a.status, a.approval_status, a.max_seats, {points_expr}, a.location,
           (SELECT COUNT(*) FROM registrations r
             WHERE r.activity_id = a.id AND r.status IN ('registered', 'checked_in')),
           (SELECT COUNT(*) FROM registrations r
             WHERE r.activity_id = a.id AND r.status = 'checked_in')
         FROM activities a{where_sql}
         ORDER BY a.starts_at DESC
         LIMIT ? OFFSET ?"
    );
    binds.push(Value::Integer(page_size));
    binds.push(Value::Integer((page - 1) * page_size));

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let items: Vec<serde_json::Value> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "termId": r.get::<_, String>(2)?,
                "criterionId": r.get::<_, String>(3)?,
                "startsAt": r.get::<_, String>(4)?,
                "endsAt": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "approvalStatus": r.get::<_, String>(7)?,
                "maxSeats": r.get::<_, Option<i64>>(8)?,
                "points": r.get::<_, Option<f64>>(9)?,
                "location": r.get::<_, Option<String>>(10)?,
                "registeredCount": r.get::<_, i64>(11)?,
                "checkedInCount": r.get::<_, i64>(12)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let total_pages = if total == 0 {
        0
    } else {
        (total + page_size - 1) / page_size
    };
    Ok(json!({
        "items": items,
        "total": total,
        "page": page,
        "pageSize": page_size,
        "totalPages": total_pages
    }))
}

fn activities_get(
    conn: &Connection,
    caps: SchemaCaps,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let points_expr = if caps.activity_points { "points" } else { "NULL" };
    let sql = format!(
        "SELECT id, title, description, term_id, criterion_id, starts_at, ends_at,
           status, approval_status, max_seats, {points_expr}, location,
           organizer_id, approver_id, approved_at, created_at
         FROM activities WHERE id = ?"
    );
    let row = conn
        .query_row(&sql, [&activity_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "termId": r.get::<_, String>(3)?,
                "criterionId": r.get::<_, String>(4)?,
                "startsAt": r.get::<_, String>(5)?,
                "endsAt": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
                "approvalStatus": r.get::<_, String>(8)?,
                "maxSeats": r.get::<_, Option<i64>>(9)?,
                "points": r.get::<_, Option<f64>>(10)?,
                "location": r.get::<_, Option<String>>(11)?,
                "organizerId": r.get::<_, String>(12)?,
                "approverId": r.get::<_, Option<String>>(13)?,
                "approvedAt": r.get::<_, Option<String>>(14)?,
                "createdAt": r.get::<_, String>(15)?
            }))
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(mut activity) = row else {
        return Err(HandlerErr::not_found("activity not found"));
    };

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
    activity["registeredCount"] = json!(registered);
    activity["checkedInCount"] = json!(checked_in);
    Ok(activity)
}

fn activities_create(
    conn: &Connection,
    caps: SchemaCaps,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let input = parse_activity_input(conn, caps, params)?;

    let activity_id = Uuid::new_v4().to_string();
    // Caller-supplied approval state is ignored: everything starts pending.
    let status = input.status.unwrap_or_else(|| "open".to_string());
    let created_at = now_string();

    let result = if caps.activity_points {
        conn.execute(
            "INSERT INTO activities(
               id, title, description, term_id, criterion_id, starts_at, ends_at,
               status, approval_status, max_seats, points, location,
               organizer_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
            rusqlite::params![
                activity_id,
                input.title,
                input.description,
                input.term_id,
                input.criterion_id,
                input.starts_at,
                input.ends_at,
                status,
                input.max_seats,
                input.points,
                input.location,
                actor_id,
                created_at,
            ],
        )
    } else {
        conn.execute(
            "INSERT INTO activities(
               id, title, description, term_id, criterion_id, starts_at, ends_at,
               status, approval_status, max_seats, location,
               organizer_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)",
            rusqlite::params![
                activity_id,
                input.title,
                input.description,
                input.term_id,
                input.criterion_id,
                input.starts_at,
                input.ends_at,
                status,
                input.max_seats,
                input.location,
                actor_id,
                created_at,
            ],
        )
    };
    result.map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        "ACTIVITY_CREATE",
        json!({ "activityId": activity_id, "title": input.title }),
    );
    Ok(json!({ "activityId": activity_id }))
}

fn activities_update(
    conn: &Connection,
    caps: SchemaCaps,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let activity_id = get_required_str(params, "activityId")?;
    if !activity_exists(conn, &activity_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }
    let input = parse_activity_input(conn, caps, params)?;

    // Approval state and organizer are never touched by an edit.
    let result = if caps.activity_points {
        conn.execute(
            "UPDATE activities SET
               title = ?, description = ?, term_id = ?, criterion_id = ?,
               starts_at = ?, ends_at = ?, max_seats = ?, points = ?, location = ?
             WHERE id = ?",
            rusqlite::params![
                input.title,
                input.description,
                input.term_id,
                input.criterion_id,
                input.starts_at,
                input.ends_at,
                input.max_seats,
                input.points,
                input.location,
                activity_id,
            ],
        )
    } else {
        conn.execute(
            "UPDATE activities SET
               title = ?, description = ?, term_id = ?, criterion_id = ?,
               starts_at = ?, ends_at = ?, max_seats = ?, location = ?
             WHERE id = ?",
            rusqlite::params![
                input.title,
                input.description,
                input.term_id,
                input.criterion_id,
                input.starts_at,
                input.ends_at,
                input.max_seats,
                input.location,
                activity_id,
            ],
        )
    };
    result.map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        "ACTIVITY_UPDATE",
        json!({ "activityId": activity_id, "title": input.title }),
    );
    Ok(json!({ "ok": true }))
}

fn activities_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let activity_id = get_required_str(params, "activityId")?;
    if !activity_exists(conn, &activity_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }
    // Active registrations forbid deletion; cancelled history rows go with
    // the activity so the ledger never points at a missing one.
    let active = active_registration_count(conn, &activity_id)?;
    if active > 0 {
        return Err(HandlerErr::conflict(format!(
            "activity has {} active registration(s)",
            active
        )));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM registrations WHERE activity_id = ?", [&activity_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM activities WHERE id = ?", [&activity_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        "ACTIVITY_DELETE",
        json!({ "activityId": activity_id }),
    );
    Ok(json!({ "ok": true }))
}

fn status_audit_action(status: &str) -> &'static str {
    match status {
        "open" => "ACTIVITY_OPEN",
        "closed" => "ACTIVITY_CLOSE",
        "full" => "ACTIVITY_FULL",
        _ => "ACTIVITY_CANCEL",
    }
}

fn activities_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let activity_id = get_required_str(params, "activityId")?;
    let raw = get_required_str(params, "status")?;
    let Some(status) = parse_status(&raw) else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("status must be one of {}", STATUSES.join("/")),
        ));
    };
    if !activity_exists(conn, &activity_id)? {
        return Err(HandlerErr::not_found("activity not found"));
    }

    conn.execute(
        "UPDATE activities SET status = ? WHERE id = ?",
        (&status, &activity_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        status_audit_action(&status),
        json!({ "activityId": activity_id, "status": status }),
    );
    Ok(json!({ "ok": true, "status": status }))
}

fn activities_mark_full(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let activity_id = get_required_str(params, "activityId")?;

    let max_seats: Option<Option<i64>> = conn
        .query_row(
            "SELECT max_seats FROM activities WHERE id = ?",
            [&activity_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(max_seats) = max_seats else {
        return Err(HandlerErr::not_found("activity not found"));
    };
    let Some(cap) = max_seats else {
        return Err(HandlerErr::conflict("activity has no seat cap"));
    };

    let active = active_registration_count(conn, &activity_id)?;
    if active < cap {
        return Err(HandlerErr::conflict("seats not yet exhausted"));
    }

    conn.execute(
        "UPDATE activities SET status = 'full' WHERE id = ?",
        [&activity_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        "ACTIVITY_FULL",
        json!({ "activityId": activity_id, "registeredCount": active }),
    );
    Ok(json!({ "ok": true, "status": "full" }))
}

fn activities_decide(
    conn: &Connection,
    params: &serde_json::Value,
    approve: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let activity_id = get_required_str(params, "activityId")?;

    let current: Option<String> = conn
        .query_row(
            "SELECT approval_status FROM activities WHERE id = ?",
            [&activity_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(current) = current else {
        return Err(HandlerErr::not_found("activity not found"));
    };
    // Repeating a decision is a conflict, not a silent success, so each
    // approval produces exactly one audit record.
    if current != "pending" {
        return Err(HandlerErr::conflict("approval already decided"));
    }

    let decided = if approve { "approved" } else { "rejected" };
    conn.execute(
        "UPDATE activities SET approval_status = ?, approver_id = ?, approved_at = ?
         WHERE id = ?",
        (decided, &actor_id, now_string(), &activity_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    audit::record_event(
        conn,
        &actor_id,
        if approve { "ACTIVITY_APPROVE" } else { "ACTIVITY_REJECT" },
        json!({ "activityId": activity_id }),
    );
    Ok(json!({ "ok": true, "approvalStatus": decided }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, SchemaCaps, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let (Some(conn), Some(caps)) = (state.db.as_ref(), state.caps) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, caps, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activities.search" => Some(dispatch(state, req, activities_search)),
        "activities.get" => Some(dispatch(state, req, activities_get)),
        "activities.create" => Some(dispatch(state, req, activities_create)),
        "activities.update" => Some(dispatch(state, req, activities_update)),
        "activities.delete" => Some(dispatch(state, req, |c, _, p| activities_delete(c, p))),
        "activities.setStatus" => Some(dispatch(state, req, |c, _, p| activities_set_status(c, p))),
        "activities.markFull" => Some(dispatch(state, req, |c, _, p| activities_mark_full(c, p))),
        "activities.approve" => Some(dispatch(state, req, |c, _, p| activities_decide(c, p, true))),
        "activities.reject" => Some(dispatch(state, req, |c, _, p| activities_decide(c, p, false))),
        _ => None,
    }
}
