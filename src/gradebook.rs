use crate::gradeimport::csv_quote;
use crate::gradestate::{ChangeState, GradeChange, GradeStateMachine, GradeStatus};
use crate::records::{
    self, Course, FlowSession, GbResult, GradebookError, Opportunity, Participation, Role,
};
use crate::sessions::mangle_rule_id;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityGrade {
    pub opportunity: Opportunity,
    pub status: GradeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantGradebook {
    pub participation: Participation,
    pub is_student_viewing: bool,
    pub grades: Vec<OpportunityGrade>,
    pub state_types: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseGradebookRow {
    pub participation: Participation,
    pub grades: Vec<GradeStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseGradebook {
    pub course: Course,
    pub opportunities: Vec<Opportunity>,
    pub rows: Vec<CourseGradebookRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityGradebookRow {
    pub participation: Participation,
    pub status: GradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_sessions: Option<Vec<FlowSession>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityGradebook {
    pub opportunity: Opportunity,
    pub rows: Vec<OpportunityGradebookRow>,
    /// Rule ids selectable for batch session operations (instructors only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_rule_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeChangeEntry {
    #[serde(flatten)]
    pub change: GradeChange,
    pub is_superseded: bool,
    pub creator_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleGrade {
    pub opportunity: Opportunity,
    pub participation: Participation,
    pub grade_changes: Vec<GradeChangeEntry>,
    pub status: GradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_sessions: Option<Vec<FlowSession>>,
    pub allow_session_actions: bool,
    pub show_page_grades: bool,
    pub messages: Vec<String>,
}

fn state_type_names() -> Vec<&'static str> {
    ChangeState::ALL.iter().map(|s| s.as_str()).collect()
}

fn require_staff(viewer: &Participation, what: &str) -> GbResult<()> {
    if viewer.role.is_staff() {
        Ok(())
    } else {
        Err(GradebookError::forbidden(format!(
            "must be instructor or TA to {}",
            what
        )))
    }
}

fn require_same_course(viewer: &Participation, course_id: &str, what: &str) -> GbResult<()> {
    if viewer.course_id == course_id {
        Ok(())
    } else {
        Err(GradebookError::new(
            "wrong_course",
            format!("{} from wrong course", what),
        ))
    }
}

/// Buckets changes by (participation, opportunity), keeping grade-time order.
fn group_changes(changes: Vec<GradeChange>) -> HashMap<(String, String), Vec<GradeChange>> {
    let mut out: HashMap<(String, String), Vec<GradeChange>> = HashMap::new();
    for gc in changes {
        out.entry((gc.participation_id.clone(), gc.opportunity_id.clone()))
            .or_default()
            .push(gc);
    }
    out
}

fn fold_for(opportunity: &Opportunity, changes: Option<&Vec<GradeChange>>) -> GradeStatus {
    let changes = changes.map(|v| v.as_slice()).unwrap_or(&[]);
    GradeStateMachine::new(opportunity.due_time).consume(changes, false)
}

fn participants_by_name(mut participations: Vec<Participation>) -> Vec<Participation> {
    participations.sort_by_key(|p| p.name_sort_key());
    participations
}

pub fn participant_grades(
    conn: &Connection,
    viewer_id: &str,
    participation_id: Option<&str>,
) -> GbResult<ParticipantGradebook> {
    let viewer = records::load_viewer(conn, viewer_id)?;

    let grade_participation = match participation_id {
        Some(id) if id != viewer.id => records::get_participation(conn, id)?,
        _ => viewer.clone(),
    };
    require_same_course(&viewer, &grade_participation.course_id, "participation")?;

    let is_student_viewing = match viewer.role {
        Role::Instructor | Role::TeachingAssistant => false,
        Role::Student => {
            if grade_participation.id != viewer.id {
                return Err(GradebookError::forbidden(
                    "may not view other people's grades",
                ));
            }
            true
        }
        Role::Observer => return Err(GradebookError::forbidden("may not view grades")),
    };

    let opportunities = records::list_opportunities(conn, &viewer.course_id, true)?;
    let changes = group_changes(records::grade_changes_for_participation(
        conn,
        &viewer.course_id,
        &grade_participation.id,
    )?);

    let grades = opportunities
        .into_iter()
        .filter(|opp| !is_student_viewing || opp.released_to_students())
        .map(|opp| {
            let status = fold_for(
                &opp,
                changes.get(&(grade_participation.id.clone(), opp.id.clone())),
            );
            OpportunityGrade {
                opportunity: opp,
                status,
            }
        })
        .collect();

    Ok(ParticipantGradebook {
        participation: grade_participation,
        is_student_viewing,
        grades,
        state_types: state_type_names(),
    })
}

pub fn course_gradebook(
    conn: &Connection,
    viewer_id: &str,
    include_inactive: bool,
) -> GbResult<CourseGradebook> {
    let viewer = records::load_viewer(conn, viewer_id)?;
    require_staff(&viewer, "view grades")?;

    let course = records::get_course(conn, &viewer.course_id)?;
    let opportunities = records::list_opportunities(conn, &course.id, true)?;
    let participations = participants_by_name(records::list_participations(
        conn,
        &course.id,
        !include_inactive,
    )?);
    let changes = group_changes(records::grade_changes_for_course(conn, &course.id)?);

    let rows = participations
        .into_iter()
        .map(|p| {
            let grades = opportunities
                .iter()
                .map(|opp| fold_for(opp, changes.get(&(p.id.clone(), opp.id.clone()))))
                .collect();
            CourseGradebookRow {
                participation: p,
                grades,
            }
        })
        .collect();

    Ok(CourseGradebook {
        course,
        opportunities,
        rows,
    })
}

pub fn opportunity_grades(
    conn: &Connection,
    viewer_id: &str,
    opportunity_id: &str,
    include_inactive: bool,
) -> GbResult<OpportunityGradebook> {
    let viewer = records::load_viewer(conn, viewer_id)?;
    require_staff(&viewer, "view grades")?;

    let opportunity = records::get_opportunity(conn, opportunity_id)?;
    require_same_course(&viewer, &opportunity.course_id, "opportunity")?;

    let batch_rule_ids = match (&opportunity.flow_id, viewer.role) {
        (Some(flow_id), Role::Instructor) => Some(
            records::session_rule_ids(conn, &opportunity.course_id, flow_id)?
                .iter()
                .map(|r| mangle_rule_id(r.as_deref()))
                .collect(),
        ),
        _ => None,
    };

    let participations = participants_by_name(records::list_participations(
        conn,
        &opportunity.course_id,
        !include_inactive,
    )?);
    let changes = group_changes(records::grade_changes_for_opportunity(
        conn,
        &opportunity.id,
    )?);

    let mut rows = Vec::with_capacity(participations.len());
    for p in participations {
        let status = fold_for(&opportunity, changes.get(&(p.id.clone(), opportunity.id.clone())));
        let flow_sessions = match &opportunity.flow_id {
            Some(flow_id) => Some(records::sessions_for_participant(conn, &p.id, flow_id)?),
            None => None,
        };
        rows.push(OpportunityGradebookRow {
            participation: p,
            status,
            flow_sessions,
        });
    }

    Ok(OpportunityGradebook {
        opportunity,
        rows,
        batch_rule_ids,
    })
}

pub fn single_grade(
    conn: &Connection,
    viewer_id: &str,
    participation_id: &str,
    opportunity_id: &str,
) -> GbResult<SingleGrade> {
    let viewer = records::load_viewer(conn, viewer_id)?;
    let participation = records::get_participation(conn, participation_id)?;
    require_same_course(&viewer, &participation.course_id, "participation")?;
    let opportunity = records::get_opportunity(conn, opportunity_id)?;
    require_same_course(&viewer, &opportunity.course_id, "opportunity")?;

    let mut messages = Vec::new();
    match viewer.role {
        Role::Instructor | Role::TeachingAssistant => {
            if !opportunity.shown_in_grade_book {
                messages.push("This grade is not shown in the grade book.".to_string());
            }
            if !opportunity.shown_in_student_grade_book {
                messages.push("This grade is not shown in the student grade book.".to_string());
            }
        }
        Role::Student => {
            if participation.id != viewer.id {
                return Err(GradebookError::forbidden(
                    "may not view other people's grades",
                ));
            }
            if !opportunity.released_to_students() {
                return Err(GradebookError::forbidden("grade has not been released"));
            }
        }
        Role::Observer => return Err(GradebookError::forbidden("may not view grades")),
    }

    let changes = records::grade_changes_for_pair(conn, &opportunity.id, &participation.id)?;
    let status = GradeStateMachine::new(opportunity.due_time).consume(&changes, true);

    let mut creator_names: HashMap<String, Option<String>> = HashMap::new();
    let mut grade_changes = Vec::with_capacity(changes.len());
    for (idx, change) in changes.into_iter().enumerate() {
        let creator_name = match &change.creator_id {
            Some(cid) => {
                if !creator_names.contains_key(cid) {
                    let name = match records::get_participation(conn, cid) {
                        Ok(p) => Some(p.display_name()),
                        Err(e) if e.code == "not_found" => None,
                        Err(e) => return Err(e),
                    };
                    creator_names.insert(cid.clone(), name);
                }
                creator_names.get(cid).cloned().flatten()
            }
            None => None,
        };
        grade_changes.push(GradeChangeEntry {
            is_superseded: status.superseded.get(idx).copied().unwrap_or(false),
            change,
            creator_name,
        });
    }

    let flow_sessions = match &opportunity.flow_id {
        Some(flow_id) => Some(records::sessions_for_participant(
            conn,
            &participation.id,
            flow_id,
        )?),
        None => None,
    };

    let is_staff = viewer.role.is_staff();
    Ok(SingleGrade {
        opportunity,
        participation,
        grade_changes,
        status,
        flow_sessions,
        allow_session_actions: is_staff,
        show_page_grades: is_staff,
        messages,
    })
}

/// Renders the course gradebook as CSV, one machine-readable cell per
/// opportunity.
pub fn export_csv(conn: &Connection, viewer_id: &str, include_inactive: bool) -> GbResult<String> {
    let book = course_gradebook(conn, viewer_id, include_inactive)?;

    let mut header = vec![
        "last_name".to_string(),
        "first_name".to_string(),
        "email".to_string(),
    ];
    header.extend(book.opportunities.iter().map(|o| csv_quote(&o.identifier)));
    let mut csv = header.join(",");
    csv.push('\n');

    for row in &book.rows {
        let mut fields = vec![
            csv_quote(&row.participation.last_name),
            csv_quote(&row.participation.first_name),
            csv_quote(&row.participation.email),
        ];
        fields.extend(row.grades.iter().map(|g| g.machine_readable.clone()));
        csv.push_str(&fields.join(","));
        csv.push('\n');
    }
    Ok(csv)
}
