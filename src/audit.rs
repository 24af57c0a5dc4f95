use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

/// Append one audit event at the end of a mutating operation.
///
/// Fire-and-forget: a failed audit write must never fail the business
/// operation, so errors are downgraded to a stderr warning.
pub fn record_event(conn: &Connection, actor_id: &str, action: &str, details: serde_json::Value) {
    let result = conn.execute(
        "INSERT INTO audit_events(id, actor_id, action, details, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor_id,
            action,
            details.to_string(),
            Utc::now().to_rfc3339(),
        ),
    );
    if let Err(e) = result {
        eprintln!("warn: audit write failed for {}: {}", action, e);
    }
}
