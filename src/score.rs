use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use crate::db::SchemaCaps;

/// Everyone starts the term from this base; activities and manual
/// adjustments move the total from here.
pub const BASE_SCORE: f64 = 70.0;

/// Fixed classification bands, inclusive lower bounds. Never interpolated.
pub fn classify(total: f64) -> &'static str {
    if total >= 90.0 {
        "Excellent"
    } else if total >= 80.0 {
        "Good"
    } else if total >= 65.0 {
        "Fair"
    } else if total >= 50.0 {
        "Average"
    } else if total >= 35.0 {
        "Weak"
    } else {
        "Poor"
    }
}

#[derive(Debug, Clone)]
pub struct ScoreError {
    pub code: String,
    pub message: String,
}

impl ScoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub criterion_id: String,
    pub name: String,
    pub group_no: i64,
    pub max_points: f64,
    pub earned: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreModel {
    pub student_id: String,
    pub term_id: Option<String>,
    pub term_name: Option<String>,
    pub base: f64,
    /// False on legacy workspaces whose activities table predates the
    /// points column; the breakdown is then defined as all-zero rather
    /// than silently wrong.
    pub points_supported: bool,
    pub breakdown: Vec<CriterionScore>,
    pub activity_score: f64,
    pub adjustment: f64,
    pub total: f64,
    pub classification: String,
    /// Status of a persisted score record for this (student, term), when
    /// the external review tool has one. Only "final" overrides the total.
    pub record_status: Option<String>,
    pub from_record: bool,
}

#[derive(Debug, Clone)]
struct TermRef {
    id: String,
    name: String,
}

fn resolve_term(
    conn: &Connection,
    explicit: Option<&str>,
    today: NaiveDate,
) -> Result<Option<TermRef>, ScoreError> {
    if let Some(term_id) = explicit {
        let found: Option<String> = conn
            .query_row("SELECT name FROM terms WHERE id = ?", [term_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
        if let Some(name) = found {
            return Ok(Some(TermRef {
                id: term_id.to_string(),
                name,
            }));
        }
        // Unknown explicit term falls through to the current-term rule.
    }

    let today_str = today.format("%Y-%m-%d").to_string();
    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT id, name FROM terms WHERE start_date <= ?
             ORDER BY start_date DESC LIMIT 1",
            [&today_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    if let Some((id, name)) = current {
        return Ok(Some(TermRef { id, name }));
    }

    let latest: Option<(String, String)> = conn
        .query_row(
            "SELECT id, name FROM terms ORDER BY start_date DESC LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    Ok(latest.map(|(id, name)| TermRef { id, name }))
}

fn list_criteria(conn: &Connection) -> Result<Vec<(String, String, i64, f64)>, ScoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name, group_no, max_points FROM criteria ORDER BY group_no, name")
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))
}

/// Points earned per criterion: approved activities in the term for which
/// the student holds an active registration.
fn earned_by_criterion(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<HashMap<String, f64>, ScoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.criterion_id, SUM(COALESCE(a.points, 0))
             FROM activities a
             JOIN registrations r ON r.activity_id = a.id
             WHERE a.term_id = ?
               AND a.approval_status = 'approved'
               AND r.student_id = ?
               AND r.status IN ('registered', 'checked_in')
             GROUP BY a.criterion_id",
        )
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((term_id, student_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    Ok(rows.into_iter().collect())
}

pub fn compute_score(
    conn: &Connection,
    caps: SchemaCaps,
    student_id: &str,
    term_id: Option<&str>,
    adjustment: f64,
) -> Result<ScoreModel, ScoreError> {
    let term = resolve_term(conn, term_id, Utc::now().date_naive())?;
    compute_for_term(conn, caps, student_id, term, adjustment)
}

/// Same computation repeated across every known term, newest first.
pub fn compute_history(
    conn: &Connection,
    caps: SchemaCaps,
    student_id: &str,
    adjustment: f64,
) -> Result<Vec<ScoreModel>, ScoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM terms ORDER BY start_date DESC")
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
    let terms: Vec<TermRef> = stmt
        .query_map([], |r| {
            Ok(TermRef {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;

    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        out.push(compute_for_term(
            conn,
            caps,
            student_id,
            Some(term),
            adjustment,
        )?);
    }
    Ok(out)
}

fn compute_for_term(
    conn: &Connection,
    caps: SchemaCaps,
    student_id: &str,
    term: Option<TermRef>,
    adjustment: f64,
) -> Result<ScoreModel, ScoreError> {
    let criteria = list_criteria(conn)?;

    let earned_map = match (&term, caps.activity_points) {
        (Some(t), true) => earned_by_criterion(conn, student_id, &t.id)?,
        _ => HashMap::new(),
    };

    let breakdown: Vec<CriterionScore> = criteria
        .into_iter()
        .map(|(id, name, group_no, max_points)| {
            let raw = earned_map.get(&id).copied().unwrap_or(0.0);
            CriterionScore {
                earned: raw.min(max_points),
                criterion_id: id,
                name,
                group_no,
                max_points,
            }
        })
        .collect();
    let activity_score: f64 = breakdown.iter().map(|c| c.earned).sum();

    let mut record_status: Option<String> = None;
    let mut from_record = false;
    let mut total = BASE_SCORE + activity_score + adjustment;
    if caps.score_records {
        if let Some(t) = &term {
            let record: Option<(f64, String)> = conn
                .query_row(
                    "SELECT total, status FROM score_records
                     WHERE student_id = ? AND term_id = ?",
                    (student_id, &t.id),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(|e| ScoreError::new("db_query_failed", e.to_string()))?;
            if let Some((persisted_total, status)) = record {
                if status == "final" {
                    total = persisted_total;
                    from_record = true;
                }
                record_status = Some(status);
            }
        }
    }

    Ok(ScoreModel {
        student_id: student_id.to_string(),
        term_id: term.as_ref().map(|t| t.id.clone()),
        term_name: term.map(|t| t.name),
        base: BASE_SCORE,
        points_supported: caps.activity_points,
        breakdown,
        activity_score,
        adjustment,
        classification: classify(total).to_string(),
        total,
        record_status,
        from_record,
    })
}
