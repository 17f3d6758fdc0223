use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Error;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentSchema {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub owner_course_phase_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: Uuid,
    pub assessment_schema_id: Uuid,
    pub name: String,
    pub short_name: String,
    pub description: String,
    pub weight: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Competency {
    pub id: Uuid,
    pub category_id: Uuid,
    pub name: String,
    pub description: String,
    pub description_novice: String,
    pub description_intermediate: String,
    pub description_advanced: String,
    pub description_expert: String,
    pub weight: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CoursePhaseConfig {
    pub course_phase_id: Uuid,
    pub assessment_schema_id: Uuid,
    pub deadline: Option<DateTime<Utc>>,
    pub self_evaluation_enabled: bool,
    pub self_evaluation_start: Option<DateTime<Utc>>,
    pub self_evaluation_deadline: Option<DateTime<Utc>>,
    pub peer_evaluation_enabled: bool,
    pub peer_evaluation_start: Option<DateTime<Utc>>,
    pub peer_evaluation_deadline: Option<DateTime<Utc>>,
    pub tutor_evaluation_enabled: bool,
    pub tutor_evaluation_start: Option<DateTime<Utc>>,
    pub tutor_evaluation_deadline: Option<DateTime<Utc>>,
    pub evaluation_results_visible: bool,
}

impl CoursePhaseConfig {
    pub fn evaluation_enabled(&self, ev_type: EvaluationType) -> bool {
        match ev_type {
            EvaluationType::SelfEvaluation => self.self_evaluation_enabled,
            EvaluationType::Peer => self.peer_evaluation_enabled,
            EvaluationType::Tutor => self.tutor_evaluation_enabled,
        }
    }

    pub fn evaluation_deadline(&self, ev_type: EvaluationType) -> Option<DateTime<Utc>> {
        match ev_type {
            EvaluationType::SelfEvaluation => self.self_evaluation_deadline,
            EvaluationType::Peer => self.peer_evaluation_deadline,
            EvaluationType::Tutor => self.tutor_evaluation_deadline,
        }
    }

    /// Merges a partial update: absent fields keep their value, explicit
    /// nulls clear the nullable ones.
    pub fn apply_update(&mut self, req: UpdateConfigReq) {
        if let Some(enabled) = req.self_evaluation_enabled {
            self.self_evaluation_enabled = enabled;
        }
        if let Some(start) = req.self_evaluation_start {
            self.self_evaluation_start = start;
        }
        if let Some(deadline) = req.self_evaluation_deadline {
            self.self_evaluation_deadline = deadline;
        }
        if let Some(enabled) = req.peer_evaluation_enabled {
            self.peer_evaluation_enabled = enabled;
        }
        if let Some(start) = req.peer_evaluation_start {
            self.peer_evaluation_start = start;
        }
        if let Some(deadline) = req.peer_evaluation_deadline {
            self.peer_evaluation_deadline = deadline;
        }
        if let Some(enabled) = req.tutor_evaluation_enabled {
            self.tutor_evaluation_enabled = enabled;
        }
        if let Some(start) = req.tutor_evaluation_start {
            self.tutor_evaluation_start = start;
        }
        if let Some(deadline) = req.tutor_evaluation_deadline {
            self.tutor_evaluation_deadline = deadline;
        }
        if let Some(visible) = req.evaluation_results_visible {
            self.evaluation_results_visible = visible;
        }
    }
}

/// One of the three evaluation kinds a course phase can run. Stored as
/// lowercase text in the database and on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluationType {
    #[serde(rename = "self")]
    SelfEvaluation,
    #[serde(rename = "peer")]
    Peer,
    #[serde(rename = "tutor")]
    Tutor,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationType::SelfEvaluation => "self",
            EvaluationType::Peer => "peer",
            EvaluationType::Tutor => "tutor",
        }
    }
}

impl std::fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvaluationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self" => Ok(EvaluationType::SelfEvaluation),
            "peer" => Ok(EvaluationType::Peer),
            "tutor" => Ok(EvaluationType::Tutor),
            other => Err(Error::UnknownEvaluationType(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationCompletion {
    pub id: Uuid,
    /// The participant being evaluated.
    pub course_participation_id: Uuid,
    pub course_phase_id: Uuid,
    /// The participant doing the evaluating.
    pub author_course_participation_id: Uuid,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub evaluation_type: EvaluationType,
}

// --- external shapes (core service, never stored locally) ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    /// Course participation ID within the phase (resolved by the core
    /// service), so it is directly comparable with completion targets.
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub members: Vec<Person>,
    pub tutors: Vec<Person>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub course_participation_id: Uuid,
    pub person: Person,
    /// Team allocation carried over from the phase's previous-phase data;
    /// absent for participants who were never put on a team.
    #[serde(default)]
    pub team_allocation: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CoursePhase {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub course_id: Option<Uuid>,
    #[serde(default)]
    pub restricted_data: serde_json::Value,
    #[serde(default)]
    pub student_readable_data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub name: String,
    pub semester_tag: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ManualMailRequest {
    pub subject: String,
    pub content: String,
    pub recipient_course_participation_ids: Vec<Uuid>,
    pub additional_placeholders: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ManualMailResponse {
    pub successful_emails: i64,
    pub failed_emails: i64,
    pub requested_recipients: i64,
    pub sent_at: DateTime<Utc>,
}

// --- reminder results ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReminderRecipients {
    pub evaluation_enabled: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub deadline_passed: bool,
    pub total_authors: usize,
    pub completed_authors: usize,
    pub incomplete_author_course_participation_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReminderReport {
    pub successful_emails: i64,
    pub failed_emails: i64,
    pub requested_recipients: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub deadline_passed: bool,
    pub sent_at: DateTime<Utc>,
    pub previous_sent_at: Option<DateTime<Utc>>,
}

// --- request bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryReq {
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub description: String,
    pub weight: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCategoryReq {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub description: Option<String>,
    pub weight: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateCompetencyReq {
    pub category_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_novice: String,
    #[serde(default)]
    pub description_intermediate: String,
    #[serde(default)]
    pub description_advanced: String,
    #[serde(default)]
    pub description_expert: String,
    pub weight: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCompetencyReq {
    pub name: Option<String>,
    pub description: Option<String>,
    pub description_novice: Option<String>,
    pub description_intermediate: Option<String>,
    pub description_advanced: Option<String>,
    pub description_expert: Option<String>,
    pub weight: Option<i32>,
}

/// Partial config update. The start/deadline fields are double-optional so
/// an absent field leaves the value alone while an explicit JSON `null`
/// clears it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigReq {
    pub self_evaluation_enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub self_evaluation_start: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub self_evaluation_deadline: Option<Option<DateTime<Utc>>>,
    pub peer_evaluation_enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub peer_evaluation_start: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub peer_evaluation_deadline: Option<Option<DateTime<Utc>>>,
    pub tutor_evaluation_enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub tutor_evaluation_start: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub tutor_evaluation_deadline: Option<Option<DateTime<Utc>>>,
    pub evaluation_results_visible: Option<bool>,
}

/// Present-but-null deserializes to `Some(None)`; absent fields fall back to
/// the `default` (`None`), giving the three-state merge `apply_update` expects.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeadlineReq {
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCompletionReq {
    pub course_participation_id: Uuid,
    pub author_course_participation_id: Uuid,
    pub evaluation_type: EvaluationType,
    pub completed: bool,
}

// --- response shapes ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CategoryWithCompetencies {
    #[serde(flatten)]
    pub category: Category,
    pub competencies: Vec<Competency>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchemaWithCategories {
    #[serde(flatten)]
    pub schema: AssessmentSchema,
    pub categories: Vec<CategoryWithCompetencies>,
}
