use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn terms_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Canonical display order: newest term first.
    let mut stmt = conn
        .prepare("SELECT id, name, start_date FROM terms ORDER BY start_date DESC")
        .map_err(HandlerErr::db_query)?;
    let terms: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let start_date: String = r.get(2)?;
            Ok(json!({ "id": id, "name": name, "startDate": start_date }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "terms": terms }))
}

fn terms_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let start_date = get_required_str(params, "startDate")?.trim().to_string();

    let mut fields: Vec<(&str, String)> = Vec::new();
    if name.is_empty() {
        fields.push(("name", "name is required".to_string()));
    }
    if NaiveDate::parse_from_str(&start_date, "%Y-%m-%d").is_err() {
        fields.push(("startDate", "startDate must be YYYY-MM-DD".to_string()));
    }
    if !fields.is_empty() {
        return Err(HandlerErr::validation(fields));
    }

    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, name, start_date) VALUES(?, ?, ?)",
        (&term_id, &name, &start_date),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "termId": term_id, "name": name, "startDate": start_date }))
}

fn criteria_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.group_no, c.max_points,
               (SELECT COUNT(*) FROM activities a WHERE a.criterion_id = c.id) AS activity_count
             FROM criteria c
             ORDER BY c.group_no, c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let criteria: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let group_no: i64 = r.get(2)?;
            let max_points: f64 = r.get(3)?;
            let activity_count: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "groupNo": group_no,
                "maxPoints": max_points,
                "activityCount": activity_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "criteria": criteria }))
}

fn criteria_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let group_no = params.get("groupNo").and_then(|v| v.as_i64());
    let max_points = params.get("maxPoints").and_then(|v| v.as_f64());

    let mut fields: Vec<(&str, String)> = Vec::new();
    if name.is_empty() {
        fields.push(("name", "name is required".to_string()));
    }
    match group_no {
        Some(g) if g >= 0 => {}
        _ => fields.push(("groupNo", "groupNo must be a non-negative integer".to_string())),
    }
    match max_points {
        Some(m) if m >= 0.0 => {}
        _ => fields.push(("maxPoints", "maxPoints must be a non-negative number".to_string())),
    }
    if !fields.is_empty() {
        return Err(HandlerErr::validation(fields));
    }

    let criterion_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO criteria(id, name, group_no, max_points) VALUES(?, ?, ?, ?)",
        (&criterion_id, &name, group_no.unwrap_or(0), max_points.unwrap_or(0.0)),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "criterionId": criterion_id, "name": name }))
}

fn students_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, display_name, email FROM students ORDER BY display_name")
        .map_err(HandlerErr::db_query)?;
    let students: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let display_name: String = r.get(1)?;
            let email: Option<String> = r.get(2)?;
            Ok(json!({ "id": id, "displayName": display_name, "email": email }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?.trim().to_string();
    let email = get_opt_str(params, "email")?
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if display_name.is_empty() {
        return Err(HandlerErr::validation(vec![(
            "displayName",
            "displayName is required".to_string(),
        )]));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, display_name, email) VALUES(?, ?, ?)",
        (&student_id, &display_name, &email),
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HandlerErr::conflict("email already in use")
        }
        other => HandlerErr::new("db_insert_failed", other.to_string()),
    })?;
    Ok(json!({ "studentId": student_id, "displayName": display_name }))
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
        "terms.list" => Some(dispatch(state, req, |c, _| terms_list(c))),
        "terms.create" => Some(dispatch(state, req, terms_create)),
        "criteria.list" => Some(dispatch(state, req, |c, _| criteria_list(c))),
        "criteria.create" => Some(dispatch(state, req, criteria_create)),
        "students.list" => Some(dispatch(state, req, |c, _| students_list(c))),
        "students.create" => Some(dispatch(state, req, students_create)),
        _ => None,
    }
}
