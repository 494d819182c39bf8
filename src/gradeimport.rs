use crate::gradestate::{ChangeState, GradeChange};
use crate::records::{self, GbResult, GradebookError, Participation};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub opportunity_id: String,
    pub attempt_id: String,
    pub has_header: bool,
    /// 1-based column indexes.
    pub id_column: usize,
    pub points_column: usize,
    pub feedback_column: Option<usize>,
    pub max_points: f64,
    pub creator_id: Option<String>,
    pub grade_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingGrade {
    pub email: String,
    pub display_name: String,
    #[serde(flatten)]
    pub change: GradeChange,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub total_count: usize,
    pub changed_count: usize,
    pub unchanged_count: usize,
    pub grade_changes: Vec<PendingGrade>,
    pub log_lines: Vec<String>,
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                buf.push('"');
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(std::mem::take(&mut buf));
            continue;
        }
        buf.push(ch);
    }
    out.push(buf);
    out
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Turns a lone decimal comma ("8,5") into a point. Anything with a point or
/// several commas is left alone.
pub fn fix_decimal(s: &str) -> String {
    if s.contains(',') && !s.contains('.') && s.matches(',').count() == 1 {
        s.replace(',', ".")
    } else {
        s.to_string()
    }
}

/// Parses a points cell. `-` and blank are null grades (as exported by LMSes
/// for ungraded rows).
pub fn parse_points(cell: &str) -> Result<Option<f64>, String> {
    let t = cell.trim();
    if t.is_empty() || t == "-" {
        return Ok(None);
    }
    fix_decimal(t)
        .parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid points value '{}'", t))
}

/// Matches an email or the part of it before `@` against active participants.
pub fn find_participant_from_id<'a>(
    participations: &'a [Participation],
    id_str: &str,
) -> Result<&'a Participation, String> {
    let needle = id_str.trim().to_lowercase();
    let matches: Vec<&Participation> = participations
        .iter()
        .filter(|p| {
            let email = p.email.to_lowercase();
            if email == needle {
                return true;
            }
            match email.split_once('@') {
                Some((uid, _)) => uid == needle,
                None => false,
            }
        })
        .collect();

    match matches.as_slice() {
        [] => Err(format!("no participant found for '{}'", needle)),
        [one] => Ok(*one),
        _ => Err(format!("more than one participant found for '{}'", needle)),
    }
}

pub fn csv_to_grade_changes(
    conn: &Connection,
    opts: &ImportOptions,
    text: &str,
) -> GbResult<ImportOutcome> {
    if opts.id_column == 0 || opts.points_column == 0 || opts.feedback_column == Some(0) {
        return Err(GradebookError::bad_params("column indexes are 1-based"));
    }

    let opportunity = records::get_opportunity(conn, &opts.opportunity_id)?;
    let participations = records::list_participations(conn, &opportunity.course_id, true)?;

    let mut log_lines = Vec::new();
    let mut grade_changes = Vec::new();
    let mut total_count = 0usize;

    let mut skip_header = opts.has_header;
    for (line_no, raw_line) in text.lines().enumerate() {
        if skip_header {
            skip_header = false;
            continue;
        }
        if raw_line.trim().is_empty() {
            continue;
        }
        let row = parse_csv_record(raw_line);

        let Some(id_cell) = row.get(opts.id_column - 1) else {
            log_lines.push(format!("line {}: missing id column", line_no + 1));
            continue;
        };
        let participant = match find_participant_from_id(&participations, id_cell) {
            Ok(p) => p,
            Err(msg) => {
                log_lines.push(msg);
                continue;
            }
        };

        let Some(points_cell) = row.get(opts.points_column - 1) else {
            log_lines.push(format!("line {}: missing points column", line_no + 1));
            continue;
        };
        let points = parse_points(points_cell).map_err(|msg| {
            GradebookError::bad_params(msg).with_details(json!({ "line": line_no + 1 }))
        })?;
        let comment = opts
            .feedback_column
            .and_then(|c| row.get(c - 1))
            .map(|s| s.to_string());

        let change = GradeChange {
            id: records::new_id(),
            opportunity_id: opportunity.id.clone(),
            participation_id: participant.id.clone(),
            state: ChangeState::Graded,
            attempt_id: Some(opts.attempt_id.clone()),
            points,
            max_points: Some(opts.max_points),
            comment,
            due_time: None,
            creator_id: opts.creator_id.clone(),
            grade_time: opts.grade_time,
            flow_session_id: None,
        };

        let last = records::last_grade_change_for_attempt(
            conn,
            &opportunity.id,
            &participant.id,
            &opts.attempt_id,
        )?;
        let keep = match last {
            Some(last) if last.state == ChangeState::Graded => {
                let mut updated = Vec::new();
                if last.points != change.points {
                    updated.push("points");
                }
                if last.max_points != change.max_points {
                    updated.push("max_points");
                }
                if last.comment != change.comment {
                    updated.push("comment");
                }
                if !updated.is_empty() {
                    log_lines.push(format!(
                        "{}: {} updated",
                        participant.email,
                        updated.join(", ")
                    ));
                }
                !updated.is_empty()
            }
            _ => true,
        };

        if keep {
            grade_changes.push(PendingGrade {
                email: participant.email.clone(),
                display_name: participant.display_name(),
                change,
            });
        }
        total_count += 1;
    }

    Ok(ImportOutcome {
        total_count,
        changed_count: grade_changes.len(),
        unchanged_count: total_count - grade_changes.len(),
        grade_changes,
        log_lines,
    })
}

/// Writes the outcome's grade changes in one transaction.
pub fn commit_import(conn: &Connection, outcome: &ImportOutcome) -> GbResult<usize> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| GradebookError::new("db_tx_failed", e.to_string()))?;
    for pending in &outcome.grade_changes {
        records::insert_grade_change(&tx, &pending.change)?;
    }
    tx.commit()
        .map_err(|e| GradebookError::new("db_tx_failed", e.to_string()))?;
    tracing::info!(
        imported = outcome.grade_changes.len(),
        unchanged = outcome.unchanged_count,
        "grade import committed"
    );
    Ok(outcome.grade_changes.len())
}
