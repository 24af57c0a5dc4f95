use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_f64, get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::score;
use serde_json::json;

fn score_error_response(id: &str, e: score::ScoreError) -> serde_json::Value {
    err(id, &e.code, e.message, None)
}

fn handle_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(caps)) = (state.db.as_ref(), state.caps) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let parsed = (|| -> Result<(String, Option<String>, f64), HandlerErr> {
        Ok((
            get_required_str(&req.params, "studentId")?,
            get_opt_str(&req.params, "termId")?,
            get_opt_f64(&req.params, "adjustment")?.unwrap_or(0.0),
        ))
    })();
    let (student_id, term_id, adjustment) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match score::compute_score(conn, caps, &student_id, term_id.as_deref(), adjustment) {
        Ok(model) => match serde_json::to_value(&model) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => score_error_response(&req.id, e),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(caps)) = (state.db.as_ref(), state.caps) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let parsed = (|| -> Result<(String, f64), HandlerErr> {
        Ok((
            get_required_str(&req.params, "studentId")?,
            get_opt_f64(&req.params, "adjustment")?.unwrap_or(0.0),
        ))
    })();
    let (student_id, adjustment) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match score::compute_history(conn, caps, &student_id, adjustment) {
        Ok(entries) => match serde_json::to_value(&entries) {
            Ok(v) => ok(&req.id, json!({ "entries": v })),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => score_error_response(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "score.compute" => Some(handle_compute(state, req)),
        "score.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
