use crate::gradestate::{ChangeState, GradeChange};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct GradebookError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradebookError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }
}

impl From<rusqlite::Error> for GradebookError {
    fn from(e: rusqlite::Error) -> Self {
        GradebookError::new("db_query_failed", e.to_string())
    }
}

impl std::fmt::Display for GradebookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type GbResult<T> = Result<T, GradebookError>;

pub fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp: {}", s).into())
    })
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(_) => time_col(row, idx).map(Some),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Instructor,
    TeachingAssistant,
    Student,
    Observer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instructor" => Some(Self::Instructor),
            "teaching_assistant" | "ta" => Some(Self::TeachingAssistant),
            "student" => Some(Self::Student),
            "observer" => Some(Self::Observer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instructor => "instructor",
            Self::TeachingAssistant => "teaching_assistant",
            Self::Student => "student",
            Self::Observer => "observer",
        }
    }

    /// Instructors and TAs see every grade of the course.
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Instructor | Self::TeachingAssistant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    Requested,
    Active,
    Denied,
    Dropped,
}

impl ParticipationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "denied" => Some(Self::Denied),
            "dropped" => Some(Self::Dropped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Denied => "denied",
            Self::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub identifier: String,
    pub name: String,
    pub number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub id: String,
    pub course_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub status: ParticipationStatus,
    pub enroll_time: DateTime<Utc>,
}

impl Participation {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }

    pub fn name_sort_key(&self) -> (String, String) {
        (self.last_name.to_lowercase(), self.first_name.to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub course_id: String,
    pub identifier: String,
    pub name: String,
    pub flow_id: Option<String>,
    pub due_time: Option<DateTime<Utc>>,
    pub shown_in_grade_book: bool,
    pub shown_in_student_grade_book: bool,
    pub creation_time: DateTime<Utc>,
}

impl Opportunity {
    pub fn released_to_students(&self) -> bool {
        self.shown_in_grade_book && self.shown_in_student_grade_book
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationMode {
    End,
    RollOver,
}

impl ExpirationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "end" => Some(Self::End),
            "roll_over" => Some(Self::RollOver),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::End => "end",
            Self::RollOver => "roll_over",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSession {
    pub id: String,
    pub course_id: String,
    pub participation_id: Option<String>,
    pub flow_id: String,
    pub access_rules_id: Option<String>,
    pub expiration_mode: ExpirationMode,
    pub expiration_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub points: Option<f64>,
    pub max_points: Option<f64>,
    pub result_comment: Option<String>,
}

pub fn get_course(conn: &Connection, course_id: &str) -> GbResult<Course> {
    conn.query_row(
        "SELECT id, identifier, name, number FROM courses WHERE id = ?",
        [course_id],
        |r| {
            Ok(Course {
                id: r.get(0)?,
                identifier: r.get(1)?,
                name: r.get(2)?,
                number: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| GradebookError::not_found("course"))
}

pub fn list_courses(conn: &Connection) -> GbResult<Vec<Course>> {
    let mut stmt =
        conn.prepare("SELECT id, identifier, name, number FROM courses ORDER BY identifier")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Course {
                id: r.get(0)?,
                identifier: r.get(1)?,
                name: r.get(2)?,
                number: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const PARTICIPATION_COLS: &str =
    "id, course_id, email, first_name, last_name, role, status, enroll_time";

fn participation_from_row(r: &Row<'_>) -> rusqlite::Result<Participation> {
    let role_raw: String = r.get(5)?;
    let status_raw: String = r.get(6)?;
    Ok(Participation {
        id: r.get(0)?,
        course_id: r.get(1)?,
        email: r.get(2)?,
        first_name: r.get(3)?,
        last_name: r.get(4)?,
        role: Role::parse(&role_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, format!("bad role: {}", role_raw).into())
        })?,
        status: ParticipationStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Text,
                format!("bad status: {}", status_raw).into(),
            )
        })?,
        enroll_time: time_col(r, 7)?,
    })
}

pub fn get_participation(conn: &Connection, participation_id: &str) -> GbResult<Participation> {
    let sql = format!(
        "SELECT {} FROM participations WHERE id = ?",
        PARTICIPATION_COLS
    );
    conn.query_row(&sql, [participation_id], participation_from_row)
        .optional()?
        .ok_or_else(|| GradebookError::not_found("participation"))
}

/// Participations of a course, by id.
pub fn list_participations(
    conn: &Connection,
    course_id: &str,
    active_only: bool,
) -> GbResult<Vec<Participation>> {
    let sql = if active_only {
        format!(
            "SELECT {} FROM participations WHERE course_id = ? AND status = 'active' ORDER BY id",
            PARTICIPATION_COLS
        )
    } else {
        format!(
            "SELECT {} FROM participations WHERE course_id = ? ORDER BY id",
            PARTICIPATION_COLS
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_id], participation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const OPPORTUNITY_COLS: &str = "id, course_id, identifier, name, flow_id, due_time,
    shown_in_grade_book, shown_in_student_grade_book, creation_time";

fn opportunity_from_row(r: &Row<'_>) -> rusqlite::Result<Opportunity> {
    Ok(Opportunity {
        id: r.get(0)?,
        course_id: r.get(1)?,
        identifier: r.get(2)?,
        name: r.get(3)?,
        flow_id: r.get(4)?,
        due_time: opt_time_col(r, 5)?,
        shown_in_grade_book: r.get::<_, i64>(6)? != 0,
        shown_in_student_grade_book: r.get::<_, i64>(7)? != 0,
        creation_time: time_col(r, 8)?,
    })
}

pub fn get_opportunity(conn: &Connection, opportunity_id: &str) -> GbResult<Opportunity> {
    let sql = format!(
        "SELECT {} FROM grading_opportunities WHERE id = ?",
        OPPORTUNITY_COLS
    );
    conn.query_row(&sql, [opportunity_id], opportunity_from_row)
        .optional()?
        .ok_or_else(|| GradebookError::not_found("grading opportunity"))
}

pub fn find_opportunity_for_flow(
    conn: &Connection,
    course_id: &str,
    flow_id: &str,
) -> GbResult<Option<Opportunity>> {
    let sql = format!(
        "SELECT {} FROM grading_opportunities WHERE course_id = ? AND flow_id = ?
         ORDER BY creation_time LIMIT 1",
        OPPORTUNITY_COLS
    );
    Ok(conn
        .query_row(&sql, (course_id, flow_id), opportunity_from_row)
        .optional()?)
}

/// Opportunities of a course ordered by identifier.
pub fn list_opportunities(
    conn: &Connection,
    course_id: &str,
    shown_only: bool,
) -> GbResult<Vec<Opportunity>> {
    let filter = if shown_only {
        " AND shown_in_grade_book = 1"
    } else {
        ""
    };
    let sql = format!(
        "SELECT {} FROM grading_opportunities WHERE course_id = ?{} ORDER BY identifier",
        OPPORTUNITY_COLS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_id], opportunity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const GRADE_CHANGE_COLS: &str = "gc.id, gc.opportunity_id, gc.participation_id, gc.state,
    gc.attempt_id, gc.points, gc.max_points, gc.comment, gc.due_time, gc.creator_id,
    gc.grade_time, gc.flow_session_id";

fn grade_change_from_row(r: &Row<'_>) -> rusqlite::Result<GradeChange> {
    let state_raw: String = r.get(3)?;
    let state = ChangeState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("bad state: {}", state_raw).into())
    })?;
    Ok(GradeChange {
        id: r.get(0)?,
        opportunity_id: r.get(1)?,
        participation_id: r.get(2)?,
        state,
        attempt_id: r.get(4)?,
        points: r.get(5)?,
        max_points: r.get(6)?,
        comment: r.get(7)?,
        due_time: opt_time_col(r, 8)?,
        creator_id: r.get(9)?,
        grade_time: time_col(r, 10)?,
        flow_session_id: r.get(11)?,
    })
}

/// Grade changes matching `filter` (SQL over alias `gc`), ordered by grade time.
fn query_grade_changes(
    conn: &Connection,
    filter: &str,
    params: Vec<Value>,
) -> GbResult<Vec<GradeChange>> {
    let sql = format!(
        "SELECT {} FROM grade_changes gc
         JOIN grading_opportunities o ON o.id = gc.opportunity_id
         WHERE {}
         ORDER BY gc.grade_time, gc.rowid",
        GRADE_CHANGE_COLS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), grade_change_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn grade_changes_for_course(conn: &Connection, course_id: &str) -> GbResult<Vec<GradeChange>> {
    query_grade_changes(
        conn,
        "o.course_id = ? AND o.shown_in_grade_book = 1",
        vec![Value::Text(course_id.to_string())],
    )
}

pub fn grade_changes_for_participation(
    conn: &Connection,
    course_id: &str,
    participation_id: &str,
) -> GbResult<Vec<GradeChange>> {
    query_grade_changes(
        conn,
        "o.course_id = ? AND o.shown_in_grade_book = 1 AND gc.participation_id = ?",
        vec![
            Value::Text(course_id.to_string()),
            Value::Text(participation_id.to_string()),
        ],
    )
}

pub fn grade_changes_for_opportunity(
    conn: &Connection,
    opportunity_id: &str,
) -> GbResult<Vec<GradeChange>> {
    query_grade_changes(
        conn,
        "gc.opportunity_id = ?",
        vec![Value::Text(opportunity_id.to_string())],
    )
}

pub fn grade_changes_for_pair(
    conn: &Connection,
    opportunity_id: &str,
    participation_id: &str,
) -> GbResult<Vec<GradeChange>> {
    query_grade_changes(
        conn,
        "gc.opportunity_id = ? AND gc.participation_id = ?",
        vec![
            Value::Text(opportunity_id.to_string()),
            Value::Text(participation_id.to_string()),
        ],
    )
}

pub fn last_grade_change_for_attempt(
    conn: &Connection,
    opportunity_id: &str,
    participation_id: &str,
    attempt_id: &str,
) -> GbResult<Option<GradeChange>> {
    let sql = format!(
        "SELECT {} FROM grade_changes gc
         JOIN grading_opportunities o ON o.id = gc.opportunity_id
         WHERE gc.opportunity_id = ? AND gc.participation_id = ? AND gc.attempt_id = ?
         ORDER BY gc.grade_time DESC, gc.rowid DESC
         LIMIT 1",
        GRADE_CHANGE_COLS
    );
    Ok(conn
        .query_row(
            &sql,
            (opportunity_id, participation_id, attempt_id),
            grade_change_from_row,
        )
        .optional()?)
}

pub fn insert_grade_change(conn: &Connection, gc: &GradeChange) -> GbResult<()> {
    conn.execute(
        "INSERT INTO grade_changes(id, opportunity_id, participation_id, state, attempt_id,
            points, max_points, comment, due_time, creator_id, grade_time, flow_session_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &gc.id,
            &gc.opportunity_id,
            &gc.participation_id,
            gc.state.as_str(),
            &gc.attempt_id,
            gc.points,
            gc.max_points,
            &gc.comment,
            gc.due_time.map(fmt_time),
            &gc.creator_id,
            fmt_time(gc.grade_time),
            &gc.flow_session_id,
        ),
    )
    .map_err(|e| {
        GradebookError::new("db_insert_failed", e.to_string())
            .with_details(serde_json::json!({ "table": "grade_changes" }))
    })?;
    Ok(())
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

const SESSION_COLS: &str = "id, course_id, participation_id, flow_id, access_rules_id,
    expiration_mode, expiration_time, start_time, completion_time, in_progress,
    points, max_points, result_comment";

fn session_from_row(r: &Row<'_>) -> rusqlite::Result<FlowSession> {
    let mode_raw: String = r.get(5)?;
    Ok(FlowSession {
        id: r.get(0)?,
        course_id: r.get(1)?,
        participation_id: r.get(2)?,
        flow_id: r.get(3)?,
        access_rules_id: r.get(4)?,
        expiration_mode: ExpirationMode::parse(&mode_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("bad expiration mode: {}", mode_raw).into(),
            )
        })?,
        expiration_time: opt_time_col(r, 6)?,
        start_time: time_col(r, 7)?,
        completion_time: opt_time_col(r, 8)?,
        in_progress: r.get::<_, i64>(9)? != 0,
        points: r.get(10)?,
        max_points: r.get(11)?,
        result_comment: r.get(12)?,
    })
}

pub fn get_session(conn: &Connection, session_id: &str) -> GbResult<FlowSession> {
    let sql = format!("SELECT {} FROM flow_sessions WHERE id = ?", SESSION_COLS);
    conn.query_row(&sql, [session_id], session_from_row)
        .optional()?
        .ok_or_else(|| GradebookError::not_found("flow session"))
}

pub fn sessions_for_participant(
    conn: &Connection,
    participation_id: &str,
    flow_id: &str,
) -> GbResult<Vec<FlowSession>> {
    let sql = format!(
        "SELECT {} FROM flow_sessions WHERE participation_id = ? AND flow_id = ?
         ORDER BY start_time, rowid",
        SESSION_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((participation_id, flow_id), session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sessions of (course, flow, rule) in the given progress state. A `None`
/// rule selects sessions without an access rule.
pub fn sessions_for_rule(
    conn: &Connection,
    course_id: &str,
    flow_id: &str,
    rule_id: Option<&str>,
    in_progress: bool,
) -> GbResult<Vec<FlowSession>> {
    let rule_filter = if rule_id.is_some() {
        "access_rules_id = ?"
    } else {
        "access_rules_id IS NULL"
    };
    let sql = format!(
        "SELECT {} FROM flow_sessions
         WHERE course_id = ? AND flow_id = ? AND in_progress = ? AND {}
         ORDER BY start_time, rowid",
        SESSION_COLS, rule_filter
    );
    let mut bind = vec![
        Value::Text(course_id.to_string()),
        Value::Text(flow_id.to_string()),
        Value::Integer(i64::from(in_progress)),
    ];
    if let Some(r) = rule_id {
        bind.push(Value::Text(r.to_string()));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_sessions(
    conn: &Connection,
    course_id: &str,
    flow_id: Option<&str>,
) -> GbResult<Vec<FlowSession>> {
    let mut bind = vec![Value::Text(course_id.to_string())];
    let flow_filter = match flow_id {
        Some(f) => {
            bind.push(Value::Text(f.to_string()));
            " AND flow_id = ?"
        }
        None => "",
    };
    let sql = format!(
        "SELECT {} FROM flow_sessions WHERE course_id = ?{} ORDER BY start_time, rowid",
        SESSION_COLS, flow_filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct access rule ids among the sessions of a course's flow, ascending
/// with the missing rule first.
pub fn session_rule_ids(
    conn: &Connection,
    course_id: &str,
    flow_id: &str,
) -> GbResult<Vec<Option<String>>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT access_rules_id FROM flow_sessions
         WHERE course_id = ? AND flow_id = ?
         ORDER BY access_rules_id",
    )?;
    let rows = stmt
        .query_map((course_id, flow_id), |r| r.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads the participation a request acts on behalf of.
pub fn load_viewer(conn: &Connection, viewer_id: &str) -> GbResult<Participation> {
    let viewer = get_participation(conn, viewer_id).map_err(|e| {
        if e.code == "not_found" {
            GradebookError::forbidden("viewer is not enrolled")
        } else {
            e
        }
    })?;
    if viewer.status != ParticipationStatus::Active {
        return Err(GradebookError::forbidden("viewer enrollment is not active"));
    }
    Ok(viewer)
}
