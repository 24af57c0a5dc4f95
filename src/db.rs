use rusqlite::Connection;
use std::path::Path;

/// Schema capabilities detected once when a workspace is opened.
///
/// Older workspaces predate the `points` column on activities, and the
/// `score_records` table is owned by an external review tool that may or may
/// not be deployed alongside us. The score engine adapts to both instead of
/// failing; these flags are probed once per open and never re-queried.
#[derive(Debug, Clone, Copy)]
pub struct SchemaCaps {
    pub activity_points: bool,
    pub score_records: bool,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("merit.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS criteria(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            group_no INTEGER NOT NULL,
            max_points REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            email TEXT UNIQUE
        )",
        [],
    )?;

    // Fresh workspaces get the modern schema including `points`. Workspaces
    // created before the points migration keep their old shape: backfilling
    // zeroes would corrupt scores that were already published, so there is
    // deliberately no ensure_* for this column (see SchemaCaps).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
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
            points REAL,
            location TEXT,
            organizer_id TEXT NOT NULL,
            approver_id TEXT,
            approved_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(criterion_id) REFERENCES criteria(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_term ON activities(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_criterion ON activities(criterion_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_starts_at ON activities(starts_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations(
            id TEXT PRIMARY KEY,
            activity_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            checked_in_at TEXT,
            FOREIGN KEY(activity_id) REFERENCES activities(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_activity ON registrations(activity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_student ON registrations(student_id)",
        [],
    )?;
    // The authoritative guard against double registration. Application-level
    // precondition checks exist only for good error messages; a race between
    // two writers lands here and is reported as "already registered".
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_registrations_active_pair
         ON registrations(activity_id, student_id)
         WHERE status IN ('registered', 'checked_in')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_events(
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_events_action ON audit_events(action)",
        [],
    )?;

    // score_records is NOT created here: it belongs to the external score
    // review tool. We only read it when present.

    Ok(conn)
}

pub fn detect_caps(conn: &Connection) -> anyhow::Result<SchemaCaps> {
    Ok(SchemaCaps {
        activity_points: table_has_column(conn, "activities", "points")?,
        score_records: table_exists(conn, "score_records")?,
    })
}

pub fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
