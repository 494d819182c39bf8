use crate::gradestate::{ChangeState, GradeChange};
use crate::records::{
    self, fmt_time, ExpirationMode, FlowSession, GbResult, GradebookError, Opportunity,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

/// Stand-in for sessions without an access rule in rule-id choices.
pub const RULE_ID_NONE: &str = "<<<NONE>>>";

pub fn mangle_rule_id(rule_id: Option<&str>) -> String {
    match rule_id {
        Some(r) => r.to_string(),
        None => RULE_ID_NONE.to_string(),
    }
}

pub fn unmangle_rule_id(raw: &str) -> Option<String> {
    if raw == RULE_ID_NONE {
        None
    } else {
        Some(raw.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Expire,
    End,
    Regrade,
    Reopen,
}

impl SessionOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expire" => Some(Self::Expire),
            "end" => Some(Self::End),
            "regrade" => Some(Self::Regrade),
            "reopen" => Some(Self::Reopen),
            _ => None,
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Expire => "expired",
            Self::End => "ended",
            Self::Regrade => "regraded",
            Self::Reopen => "reopened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGrade {
    pub page_ordinal: i64,
    pub points: Option<f64>,
    pub max_points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrade {
    pub points: Option<f64>,
    pub max_points: f64,
}

/// Sums the current page grades. Points stay unknown while any page that
/// is worth something has no points yet.
pub fn total_page_grades(pages: &[PageGrade]) -> SessionGrade {
    let max_points = pages.iter().map(|p| p.max_points).sum();
    let fully_graded = pages
        .iter()
        .all(|p| p.points.is_some() || p.max_points <= 0.0);
    let points = if fully_graded {
        Some(pages.iter().filter_map(|p| p.points).sum())
    } else {
        None
    };
    SessionGrade { points, max_points }
}

/// Latest grade per page ordinal.
fn current_page_grades(conn: &Connection, session_id: &str) -> GbResult<Vec<PageGrade>> {
    let mut stmt = conn.prepare(
        "SELECT page_ordinal, points, max_points FROM flow_page_grades
         WHERE session_id = ?
         ORDER BY page_ordinal, grade_time, rowid",
    )?;
    let rows = stmt
        .query_map([session_id], |r| {
            Ok(PageGrade {
                page_ordinal: r.get(0)?,
                points: r.get(1)?,
                max_points: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: Vec<PageGrade> = Vec::new();
    for pg in rows {
        match out.last_mut() {
            Some(last) if last.page_ordinal == pg.page_ordinal => *last = pg,
            _ => out.push(pg),
        }
    }
    Ok(out)
}

pub struct NewSession<'a> {
    pub course_id: &'a str,
    pub participation_id: Option<&'a str>,
    pub flow_id: &'a str,
    pub access_rules_id: Option<&'a str>,
    pub expiration_mode: ExpirationMode,
    pub expiration_time: Option<DateTime<Utc>>,
}

pub fn start_session(
    conn: &Connection,
    new: &NewSession<'_>,
    now: DateTime<Utc>,
) -> GbResult<FlowSession> {
    let id = records::new_id();
    conn.execute(
        "INSERT INTO flow_sessions(id, course_id, participation_id, flow_id, access_rules_id,
            expiration_mode, expiration_time, start_time, in_progress)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &id,
            new.course_id,
            new.participation_id,
            new.flow_id,
            new.access_rules_id,
            new.expiration_mode.as_str(),
            new.expiration_time.map(fmt_time),
            fmt_time(now),
        ),
    )
    .map_err(|e| GradebookError::new("db_insert_failed", e.to_string()))?;
    records::get_session(conn, &id)
}

pub fn record_page_grade(
    conn: &Connection,
    session_id: &str,
    page: &PageGrade,
    now: DateTime<Utc>,
) -> GbResult<()> {
    records::get_session(conn, session_id)?;
    conn.execute(
        "INSERT INTO flow_page_grades(id, session_id, page_ordinal, points, max_points, grade_time)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            records::new_id(),
            session_id,
            page.page_ordinal,
            page.points,
            page.max_points,
            fmt_time(now),
        ),
    )
    .map_err(|e| GradebookError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

fn is_past_end(session: &FlowSession, now: DateTime<Utc>) -> bool {
    session.expiration_time.map(|t| now >= t).unwrap_or(false)
}

fn require_in_progress(session: &FlowSession, action: &str) -> GbResult<()> {
    if session.in_progress {
        Ok(())
    } else {
        Err(GradebookError::new(
            "bad_state",
            format!("cannot {} a session that is not in progress", action),
        ))
    }
}

fn require_ended(session: &FlowSession, action: &str) -> GbResult<()> {
    if session.in_progress {
        Err(GradebookError::new(
            "bad_state",
            format!("cannot {} a session that is in progress", action),
        ))
    } else {
        Ok(())
    }
}

/// `flow-<flow_id>`, or `flow-<flow_id>-<n>` when an opportunity that is not
/// attached to the flow already holds that identifier.
fn free_flow_identifier(conn: &Connection, course_id: &str, flow_id: &str) -> GbResult<String> {
    let base = format!("flow-{}", flow_id);
    let mut candidate = base.clone();
    let mut n = 2u32;
    loop {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM grading_opportunities
                           WHERE course_id = ? AND identifier = ?)",
            (course_id, &candidate),
            |r| r.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
}

/// The opportunity collecting a flow's session grades, created on first use.
fn opportunity_for_flow(
    conn: &Connection,
    course_id: &str,
    flow_id: &str,
    now: DateTime<Utc>,
) -> GbResult<Opportunity> {
    if let Some(opp) = records::find_opportunity_for_flow(conn, course_id, flow_id)? {
        return Ok(opp);
    }
    let identifier = free_flow_identifier(conn, course_id, flow_id)?;
    let id = records::new_id();
    conn.execute(
        "INSERT INTO grading_opportunities(id, course_id, identifier, name, flow_id,
            shown_in_grade_book, shown_in_student_grade_book, creation_time)
         VALUES(?, ?, ?, ?, ?, 1, 1, ?)",
        (
            &id,
            course_id,
            &identifier,
            format!("Flow: {}", flow_id),
            flow_id,
            fmt_time(now),
        ),
    )
    .map_err(|e| {
        GradebookError::new("db_insert_failed", e.to_string())
            .with_details(serde_json::json!({ "table": "grading_opportunities" }))
    })?;
    tracing::info!(course_id, flow_id, opportunity_id = %id, "created flow grading opportunity");
    records::get_opportunity(conn, &id)
}

/// Computes the session grade, stores it on the session and reports it to
/// the gradebook under the session's own attempt.
fn grade_session(
    conn: &Connection,
    session: &FlowSession,
    now: DateTime<Utc>,
) -> GbResult<SessionGrade> {
    let grade = total_page_grades(&current_page_grades(conn, &session.id)?);
    conn.execute(
        "UPDATE flow_sessions SET points = ?, max_points = ? WHERE id = ?",
        (grade.points, grade.max_points, &session.id),
    )
    .map_err(|e| GradebookError::new("db_update_failed", e.to_string()))?;

    let Some(participation_id) = &session.participation_id else {
        return Ok(grade);
    };
    let opportunity = opportunity_for_flow(conn, &session.course_id, &session.flow_id, now)?;
    records::insert_grade_change(
        conn,
        &GradeChange {
            id: records::new_id(),
            opportunity_id: opportunity.id,
            participation_id: participation_id.clone(),
            state: ChangeState::Graded,
            attempt_id: Some(format!("flow-session-{}", session.id)),
            points: grade.points,
            max_points: Some(grade.max_points),
            comment: None,
            due_time: None,
            creator_id: None,
            grade_time: now,
            flow_session_id: Some(session.id.clone()),
        },
    )?;
    Ok(grade)
}

pub fn finish_session(
    conn: &Connection,
    session: &FlowSession,
    now: DateTime<Utc>,
    past_end_only: bool,
) -> GbResult<bool> {
    require_in_progress(session, "finish")?;
    if past_end_only && !is_past_end(session, now) {
        return Ok(false);
    }

    conn.execute(
        "UPDATE flow_sessions SET in_progress = 0, completion_time = ? WHERE id = ?",
        (fmt_time(now), &session.id),
    )
    .map_err(|e| GradebookError::new("db_update_failed", e.to_string()))?;
    let grade = grade_session(conn, session, now)?;
    tracing::debug!(session_id = %session.id, points = ?grade.points, "session finished");
    Ok(true)
}

pub fn expire_session(
    conn: &Connection,
    session: &FlowSession,
    now: DateTime<Utc>,
    past_end_only: bool,
) -> GbResult<bool> {
    require_in_progress(session, "expire")?;
    if past_end_only && !is_past_end(session, now) {
        return Ok(false);
    }

    match session.expiration_mode {
        ExpirationMode::End => finish_session(conn, session, now, false),
        ExpirationMode::RollOver => {
            conn.execute(
                "UPDATE flow_sessions
                 SET access_rules_id = NULL, expiration_time = NULL, expiration_mode = 'end'
                 WHERE id = ?",
                [&session.id],
            )
            .map_err(|e| GradebookError::new("db_update_failed", e.to_string()))?;
            tracing::debug!(session_id = %session.id, "session rolled over");
            Ok(true)
        }
    }
}

pub fn regrade_session(
    conn: &Connection,
    session: &FlowSession,
    now: DateTime<Utc>,
) -> GbResult<SessionGrade> {
    require_ended(session, "regrade")?;
    grade_session(conn, session, now)
}

pub fn reopen_session(conn: &Connection, session: &FlowSession, now: DateTime<Utc>) -> GbResult<()> {
    require_ended(session, "reopen")?;
    let note = format!("Session reopened at {}.", fmt_time(now));
    let comment = match &session.result_comment {
        Some(c) if !c.is_empty() => format!("{}\n{}", c, note),
        _ => note,
    };
    conn.execute(
        "UPDATE flow_sessions
         SET in_progress = 1, completion_time = NULL, points = NULL, max_points = NULL,
             result_comment = ?
         WHERE id = ?",
        (comment, &session.id),
    )
    .map_err(|e| GradebookError::new("db_update_failed", e.to_string()))?;
    Ok(())
}

/// Applies one operation to a single session. Returns whether it acted.
pub fn act_on_session(
    conn: &Connection,
    session: &FlowSession,
    op: SessionOp,
    now: DateTime<Utc>,
) -> GbResult<bool> {
    match op {
        SessionOp::Expire => expire_session(conn, session, now, false),
        SessionOp::End => finish_session(conn, session, now, false),
        SessionOp::Regrade => regrade_session(conn, session, now).map(|_| true),
        SessionOp::Reopen => reopen_session(conn, session, now).map(|_| true),
    }
}

pub fn single_message(op: SessionOp) -> String {
    format!("Session {}.", op.past_tense())
}

pub fn batch_message(op: SessionOp, count: usize) -> String {
    format!("{} session(s) {}.", count, op.past_tense())
}

/// Runs `op` over every matching session of (course, flow, rule) in one
/// transaction; any failure rolls the whole batch back.
pub fn batch_sessions(
    conn: &Connection,
    course_id: &str,
    flow_id: &str,
    rule_id: Option<&str>,
    op: SessionOp,
    now: DateTime<Utc>,
    past_end_only: bool,
) -> GbResult<usize> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| GradebookError::new("db_tx_failed", e.to_string()))?;

    let mut count = 0usize;
    match op {
        SessionOp::Expire | SessionOp::End => {
            for session in records::sessions_for_rule(&tx, course_id, flow_id, rule_id, true)? {
                let acted = if op == SessionOp::Expire {
                    expire_session(&tx, &session, now, past_end_only)?
                } else {
                    finish_session(&tx, &session, now, past_end_only)?
                };
                if acted {
                    count += 1;
                }
            }
        }
        SessionOp::Regrade => {
            for session in records::sessions_for_rule(&tx, course_id, flow_id, rule_id, false)? {
                regrade_session(&tx, &session, now)?;
                count += 1;
            }
        }
        SessionOp::Reopen => {
            return Err(GradebookError::bad_params(
                "reopen is not available as a batch operation",
            ));
        }
    }

    tx.commit()
        .map_err(|e| GradebookError::new("db_tx_failed", e.to_string()))?;
    tracing::info!(
        course_id,
        flow_id,
        rule_id = rule_id.unwrap_or(RULE_ID_NONE),
        count,
        "batch session operation: {}",
        op.past_tense()
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(ordinal: i64, points: Option<f64>, max_points: f64) -> PageGrade {
        PageGrade {
            page_ordinal: ordinal,
            points,
            max_points,
        }
    }

    #[test]
    fn rule_ids_mangle_none() {
        assert_eq!(mangle_rule_id(None), RULE_ID_NONE);
        assert_eq!(mangle_rule_id(Some("late")), "late");
        assert_eq!(unmangle_rule_id(RULE_ID_NONE), None);
        assert_eq!(unmangle_rule_id("late"), Some("late".to_string()));
    }

    #[test]
    fn page_totals_need_every_scored_page() {
        let g = total_page_grades(&[page(0, Some(2.0), 5.0), page(1, Some(3.5), 5.0)]);
        assert_eq!(g.points, Some(5.5));
        assert_eq!(g.max_points, 10.0);

        let g = total_page_grades(&[page(0, Some(2.0), 5.0), page(1, None, 5.0)]);
        assert_eq!(g.points, None);
        assert_eq!(g.max_points, 10.0);

        // Info pages worth nothing do not block the total.
        let g = total_page_grades(&[page(0, Some(4.0), 4.0), page(1, None, 0.0)]);
        assert_eq!(g.points, Some(4.0));
    }

    #[test]
    fn messages_read_naturally() {
        assert_eq!(batch_message(SessionOp::Expire, 3), "3 session(s) expired.");
        assert_eq!(batch_message(SessionOp::Regrade, 0), "0 session(s) regraded.");
        assert_eq!(single_message(SessionOp::End), "Session ended.");
        assert_eq!(single_message(SessionOp::Reopen), "Session reopened.");
    }

    fn seeded_db(prefix: &str) -> (std::path::PathBuf, Connection) {
        let ws = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        let conn = crate::db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO courses(id, identifier, name) VALUES('c1', 'cs101', 'Intro')",
            [],
        )
        .expect("insert course");
        (ws, conn)
    }

    fn lab_session(conn: &Connection, minute: u32) -> FlowSession {
        use chrono::TimeZone;
        start_session(
            conn,
            &NewSession {
                course_id: "c1",
                participation_id: None,
                flow_id: "lab1",
                access_rules_id: None,
                expiration_mode: ExpirationMode::End,
                expiration_time: None,
            },
            Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap(),
        )
        .expect("start session")
    }

    #[test]
    fn failing_session_rolls_back_whole_batch() {
        let (ws, conn) = seeded_db("gradebookd-batch-rollback");
        let first = lab_session(&conn, 0);
        let second = lab_session(&conn, 1);
        conn.execute_batch(&format!(
            "CREATE TRIGGER refuse_second BEFORE UPDATE ON flow_sessions
             WHEN OLD.id = '{}'
             BEGIN SELECT RAISE(ABORT, 'refused'); END;",
            second.id
        ))
        .expect("create trigger");

        let res = batch_sessions(&conn, "c1", "lab1", None, SessionOp::End, Utc::now(), false);
        match res {
            Ok(count) => panic!("batch should fail, ended {}", count),
            Err(e) => assert_eq!(e.code, "db_update_failed"),
        }

        for id in [&first.id, &second.id] {
            let s = records::get_session(&conn, id).expect("reload session");
            assert!(s.in_progress);
            assert_eq!(s.completion_time, None);
        }
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn flow_opportunity_skips_taken_identifier() {
        let (ws, conn) = seeded_db("gradebookd-flow-identifier");
        conn.execute(
            "INSERT INTO grading_opportunities(id, course_id, identifier, name, creation_time)
             VALUES('o1', 'c1', 'flow-lab1', 'Manual entry', '2025-03-01T09:00:00Z')",
            [],
        )
        .expect("insert manual opportunity");

        let opp = opportunity_for_flow(&conn, "c1", "lab1", Utc::now()).expect("flow opportunity");
        assert_eq!(opp.identifier, "flow-lab1-2");
        assert_eq!(opp.flow_id.as_deref(), Some("lab1"));

        let again = opportunity_for_flow(&conn, "c1", "lab1", Utc::now()).expect("reuse");
        assert_eq!(again.id, opp.id);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn op_names_parse() {
        assert_eq!(SessionOp::parse("end"), Some(SessionOp::End));
        assert_eq!(SessionOp::parse("finish"), None);
    }
}
