use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            // Capability flags are probed once here and live as long as the
            // connection; the score engine never re-queries the schema.
            let caps = match db::detect_caps(&conn) {
                Ok(c) => c,
                Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
            };
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            state.caps = Some(caps);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "capabilities": {
                        "activityPoints": caps.activity_points,
                        "scoreRecords": caps.score_records
                    }
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
