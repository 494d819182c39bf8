use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    GradingStarted,
    Graded,
    Retrieved,
    Unavailable,
    Extension,
    ReportSent,
    DoOver,
    Exempt,
}

impl ChangeState {
    pub const ALL: [ChangeState; 8] = [
        ChangeState::GradingStarted,
        ChangeState::Graded,
        ChangeState::Retrieved,
        ChangeState::Unavailable,
        ChangeState::Extension,
        ChangeState::ReportSent,
        ChangeState::DoOver,
        ChangeState::Exempt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeState::GradingStarted => "grading_started",
            ChangeState::Graded => "graded",
            ChangeState::Retrieved => "retrieved",
            ChangeState::Unavailable => "unavailable",
            ChangeState::Extension => "extension",
            ChangeState::ReportSent => "report_sent",
            ChangeState::DoOver => "do_over",
            ChangeState::Exempt => "exempt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

/// One recorded grade event for a (participation, opportunity) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeChange {
    pub id: String,
    pub opportunity_id: String,
    pub participation_id: String,
    pub state: ChangeState,
    pub attempt_id: Option<String>,
    pub points: Option<f64>,
    pub max_points: Option<f64>,
    pub comment: Option<String>,
    pub due_time: Option<DateTime<Utc>>,
    pub creator_id: Option<String>,
    pub grade_time: DateTime<Utc>,
    pub flow_session_id: Option<String>,
}

impl GradeChange {
    pub fn percentage(&self) -> Option<f64> {
        match (self.points, self.max_points) {
            (Some(p), Some(m)) if m > 0.0 => Some(100.0 * p / m),
            _ => None,
        }
    }
}

/// A grade that still counts after the fold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivingGrade {
    /// Position of the originating change in the consumed slice.
    pub change_index: usize,
    pub attempt_id: Option<String>,
    pub points: Option<f64>,
    pub max_points: Option<f64>,
    pub percentage: Option<f64>,
    pub grade_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeKind {
    Unavailable,
    Exempt,
    Graded,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeStatus {
    pub state: Option<ChangeState>,
    pub kind: GradeKind,
    pub points: Option<f64>,
    pub max_points: Option<f64>,
    pub percentage: Option<f64>,
    pub grades: Vec<SurvivingGrade>,
    pub valid_grade_count: usize,
    pub due_time: Option<DateTime<Utc>>,
    pub last_graded_time: Option<DateTime<Utc>>,
    pub last_report_time: Option<DateTime<Utc>>,
    pub last_grade_time: Option<DateTime<Utc>>,
    pub display: String,
    pub machine_readable: String,
    /// Aligned with the consumed slice; empty unless marking was requested.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<bool>,
}

/// Folds the time-ordered grade changes of one (participation, opportunity)
/// pair into its current grade.
///
/// Graded events replace earlier grades of the same attempt; events without an
/// attempt id stand alone. `unavailable`, `exempt` and `do_over` drop every
/// grade seen so far.
#[derive(Debug, Clone, Default)]
pub struct GradeStateMachine {
    state: Option<ChangeState>,
    due_time: Option<DateTime<Utc>>,
    last_graded_time: Option<DateTime<Utc>>,
    last_report_time: Option<DateTime<Utc>>,
    last_grade_time: Option<DateTime<Utc>>,
    standalone: Vec<usize>,
    by_attempt: HashMap<String, usize>,
}

impl GradeStateMachine {
    pub fn new(due_time: Option<DateTime<Utc>>) -> Self {
        Self {
            due_time,
            ..Self::default()
        }
    }

    fn clear_grades(&mut self, superseded: &mut [bool]) {
        for idx in self
            .standalone
            .drain(..)
            .chain(self.by_attempt.drain().map(|(_, idx)| idx))
        {
            if let Some(flag) = superseded.get_mut(idx) {
                *flag = true;
            }
        }
    }

    fn step(&mut self, idx: usize, change: &GradeChange, superseded: &mut [bool]) {
        self.last_grade_time = Some(change.grade_time);

        match change.state {
            ChangeState::Graded => {
                self.state = Some(ChangeState::Graded);
                match &change.attempt_id {
                    Some(attempt) => {
                        if let Some(prev) = self.by_attempt.insert(attempt.clone(), idx) {
                            if let Some(flag) = superseded.get_mut(prev) {
                                *flag = true;
                            }
                        }
                    }
                    None => self.standalone.push(idx),
                }
                self.last_graded_time = Some(change.grade_time);
            }
            ChangeState::Unavailable | ChangeState::Exempt => {
                self.clear_grades(superseded);
                self.state = Some(change.state);
            }
            ChangeState::DoOver => self.clear_grades(superseded),
            ChangeState::ReportSent => self.last_report_time = Some(change.grade_time),
            ChangeState::Extension => self.due_time = change.due_time,
            ChangeState::GradingStarted | ChangeState::Retrieved => {}
        }
    }

    /// Consumes `changes` (ascending by grade time). With `mark_superseded`,
    /// the returned status flags every change that no longer counts.
    pub fn consume(mut self, changes: &[GradeChange], mark_superseded: bool) -> GradeStatus {
        let mut superseded = if mark_superseded {
            vec![false; changes.len()]
        } else {
            Vec::new()
        };

        for (idx, change) in changes.iter().enumerate() {
            self.step(idx, change, &mut superseded);
        }

        let mut surviving: Vec<usize> = self
            .standalone
            .iter()
            .copied()
            .chain(self.by_attempt.values().copied())
            .collect();
        // Index order is grade-time order because the input is pre-sorted.
        surviving.sort_unstable();

        let grades: Vec<SurvivingGrade> = surviving
            .into_iter()
            .map(|idx| {
                let c = &changes[idx];
                SurvivingGrade {
                    change_index: idx,
                    attempt_id: c.attempt_id.clone(),
                    points: c.points,
                    max_points: c.max_points,
                    percentage: c.percentage(),
                    grade_time: c.grade_time,
                }
            })
            .collect();

        let valid_grade_count = grades.iter().filter(|g| g.percentage.is_some()).count();
        // The current grade is the latest one with a percentage; without one,
        // only the latest max points carry over.
        let (points, max_points, percentage) =
            match grades.iter().rev().find(|g| g.percentage.is_some()) {
                Some(g) => (g.points, g.max_points, g.percentage),
                None => (None, grades.last().and_then(|g| g.max_points), None),
            };

        let kind = match self.state {
            None | Some(ChangeState::Unavailable) => GradeKind::Unavailable,
            Some(ChangeState::Exempt) => GradeKind::Exempt,
            Some(ChangeState::Graded) if grades.is_empty() => GradeKind::Unavailable,
            Some(ChangeState::Graded) => GradeKind::Graded,
            Some(_) => GradeKind::Other,
        };

        GradeStatus {
            state: self.state,
            kind,
            points,
            max_points,
            percentage,
            display: display_text(self.state, percentage, valid_grade_count),
            machine_readable: machine_readable_text(self.state, percentage),
            grades,
            valid_grade_count,
            due_time: self.due_time,
            last_graded_time: self.last_graded_time,
            last_report_time: self.last_report_time,
            last_grade_time: self.last_grade_time,
            superseded,
        }
    }
}

fn display_text(state: Option<ChangeState>, percentage: Option<f64>, valid: usize) -> String {
    match (state, percentage) {
        (None, _) => "- ∅ -".to_string(),
        (Some(ChangeState::Exempt), _) => "(exempt)".to_string(),
        (Some(ChangeState::Graded), Some(p)) if valid > 1 => format!("{:.1}% (/{})", p, valid),
        (Some(ChangeState::Graded), Some(p)) => format!("{:.1}%", p),
        (Some(ChangeState::Graded), None) => "- ∅ -".to_string(),
        (Some(_), _) => "(other state)".to_string(),
    }
}

fn machine_readable_text(state: Option<ChangeState>, percentage: Option<f64>) -> String {
    match (state, percentage) {
        (None, _) => "NONE".to_string(),
        (Some(ChangeState::Exempt), _) => "EXEMPT".to_string(),
        (Some(ChangeState::Graded), Some(p)) => format!("{:.3}", p),
        (Some(ChangeState::Graded), None) => "NONE".to_string(),
        (Some(_), _) => "OTHER_STATE".to_string(),
    }
}
