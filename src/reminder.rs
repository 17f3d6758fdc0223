//! Evaluation reminder computation and manual dispatch. The recipient
//! calculation is a pure function over config, roster and completion data;
//! the surrounding service does the fetching and the mail orchestration.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core_client::CoreClient;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{
    CoursePhase, EvaluationCompletion, EvaluationType, ManualMailRequest, Participation,
    ReminderRecipients, ReminderReport, Team,
};
use crate::store;

/// The slice of a phase's config that matters for one evaluation type.
#[derive(Debug, Clone, Copy)]
pub struct ReminderView {
    pub enabled: bool,
    pub deadline: Option<DateTime<Utc>>,
}

/// Computes which authors still owe evaluations of the given type.
///
/// A disabled evaluation type means there is nothing to remind about, so
/// every author counts as completed. Authors without a team have no expected
/// peer or tutor targets and are likewise vacuously complete.
pub fn compute_recipients(
    view: ReminderView,
    participations: &[Participation],
    teams: &[Team],
    completions: &[EvaluationCompletion],
    ev_type: EvaluationType,
    now: DateTime<Utc>,
) -> ReminderRecipients {
    let deadline_passed = view.deadline.map(|d| now > d).unwrap_or(false);
    let total_authors = participations.len();

    if !view.enabled {
        return ReminderRecipients {
            evaluation_enabled: false,
            deadline: view.deadline,
            deadline_passed,
            total_authors,
            completed_authors: total_authors,
            incomplete_author_course_participation_ids: Vec::new(),
        };
    }

    let mut completed_targets_by_author: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for completion in completions {
        if completion.evaluation_type == ev_type && completion.completed {
            completed_targets_by_author
                .entry(completion.author_course_participation_id)
                .or_default()
                .insert(completion.course_participation_id);
        }
    }

    let teams_by_id: HashMap<Uuid, &Team> = teams.iter().map(|t| (t.id, t)).collect();

    let mut incomplete = Vec::new();
    for participation in participations {
        let author = participation.course_participation_id;
        let team = participation
            .team_allocation
            .and_then(|id| teams_by_id.get(&id).copied());

        let expected_targets: Vec<Uuid> = match ev_type {
            EvaluationType::SelfEvaluation => vec![author],
            EvaluationType::Peer => team
                .map(|t| {
                    t.members
                        .iter()
                        .map(|m| m.id)
                        .filter(|&id| id != author)
                        .collect()
                })
                .unwrap_or_default(),
            EvaluationType::Tutor => team
                .map(|t| t.tutors.iter().map(|p| p.id).collect())
                .unwrap_or_default(),
        };

        let done = completed_targets_by_author.get(&author);
        let complete = expected_targets
            .iter()
            .all(|target| done.map_or(false, |set| set.contains(target)));
        if !complete {
            incomplete.push(author);
        }
    }

    // deterministic order: ascending by the UUID's string form
    incomplete.sort_by_key(|id| id.to_string());
    let completed_authors = total_authors - incomplete.len();

    ReminderRecipients {
        evaluation_enabled: true,
        deadline: view.deadline,
        deadline_passed,
        total_authors,
        completed_authors,
        incomplete_author_course_participation_ids: incomplete,
    }
}

/// Mail template for one reminder, read from the course phase's restricted
/// data under `mailingSettings.assessmentReminder`.
#[derive(Debug, Clone)]
pub struct ReminderTemplate {
    pub subject: String,
    pub content: String,
    pub previous_sent_at: Option<DateTime<Utc>>,
}

pub fn reminder_template(
    restricted_data: &serde_json::Value,
    ev_type: EvaluationType,
) -> Result<ReminderTemplate> {
    let settings = &restricted_data["mailingSettings"]["assessmentReminder"];
    let subject = settings["subject"].as_str().unwrap_or_default().to_string();
    let content = settings["content"].as_str().unwrap_or_default().to_string();
    if subject.is_empty() || content.is_empty() {
        return Err(Error::MailTemplateIncomplete);
    }
    let previous_sent_at = settings["lastSentAtByType"][ev_type.as_str()]
        .as_str()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    Ok(ReminderTemplate {
        subject,
        content,
        previous_sent_at,
    })
}

/// Returns the restricted data with `lastSentAtByType[ev_type]` set,
/// creating the nested `mailingSettings` structure where it is missing.
pub fn with_last_sent_at(
    restricted_data: serde_json::Value,
    ev_type: EvaluationType,
    sent_at: DateTime<Utc>,
) -> serde_json::Value {
    fn object_entry<'a>(value: &'a mut serde_json::Value, key: &str) -> &'a mut serde_json::Value {
        if !value[key].is_object() {
            value[key] = serde_json::json!({});
        }
        &mut value[key]
    }

    let mut root = if restricted_data.is_object() {
        restricted_data
    } else {
        serde_json::json!({})
    };
    let by_type = object_entry(
        object_entry(object_entry(&mut root, "mailingSettings"), "assessmentReminder"),
        "lastSentAtByType",
    );
    by_type[ev_type.as_str()] = serde_json::Value::String(sent_at.to_rfc3339());
    root
}

#[derive(Clone)]
pub struct ReminderService {
    db: Db,
    core: CoreClient,
}

impl ReminderService {
    pub fn new(db: Db, core: CoreClient) -> Self {
        Self { db, core }
    }

    /// Combines config, the externally fetched roster, and local completion
    /// records into the reminder recipient set for one evaluation type.
    pub async fn get_evaluation_reminder_recipients(
        &self,
        course_phase_id: Uuid,
        ev_type: EvaluationType,
    ) -> Result<ReminderRecipients> {
        let config = store::get_config(&self.db, course_phase_id)
            .await?
            .ok_or(Error::ConfigNotFound)?;
        let view = ReminderView {
            enabled: config.evaluation_enabled(ev_type),
            deadline: config.evaluation_deadline(ev_type),
        };

        let participations = self.core.get_participations(course_phase_id).await?;
        let teams = self.core.get_teams(course_phase_id).await?;
        let completions = store::list_completions_for_phase(&self.db, course_phase_id).await?;

        Ok(compute_recipients(
            view,
            &participations,
            &teams,
            &completions,
            ev_type,
            Utc::now(),
        ))
    }

    /// Manually triggers one reminder dispatch. Fails before any mail goes
    /// out if the evaluation type is disabled or its deadline has not passed;
    /// after the mail call, the send timestamp is persisted back into the
    /// phase's restricted data. No step is retried.
    pub async fn send_evaluation_reminder(
        &self,
        course_phase_id: Uuid,
        ev_type: EvaluationType,
    ) -> Result<ReminderReport> {
        let recipients = self
            .get_evaluation_reminder_recipients(course_phase_id, ev_type)
            .await?;
        if !recipients.evaluation_enabled {
            return Err(Error::ReminderEvaluationDisabled { ev_type });
        }
        if !recipients.deadline_passed {
            return Err(Error::ReminderDeadlineNotPassed {
                deadline: recipients.deadline,
            });
        }

        let phase = self.core.get_course_phase(course_phase_id).await?;
        let template = reminder_template(&phase.restricted_data, ev_type)?;

        let mut placeholders = HashMap::new();
        placeholders.insert("evaluationType".to_string(), ev_type.to_string());
        placeholders.insert(
            "evaluationDeadline".to_string(),
            recipients
                .deadline
                .map(|d| d.to_rfc3339())
                .unwrap_or_default(),
        );
        placeholders.insert("coursePhaseName".to_string(), phase.name.clone());

        let mail = ManualMailRequest {
            subject: template.subject,
            content: template.content,
            recipient_course_participation_ids: recipients
                .incomplete_author_course_participation_ids
                .clone(),
            additional_placeholders: placeholders,
        };
        let response = self.core.send_manual_mail(course_phase_id, &mail).await?;

        let updated = CoursePhase {
            restricted_data: with_last_sent_at(
                phase.restricted_data.clone(),
                ev_type,
                response.sent_at,
            ),
            ..phase
        };
        self.core.update_course_phase(&updated).await?;

        tracing::info!(
            phase = %course_phase_id,
            ev_type = %ev_type,
            recipients = recipients.incomplete_author_course_participation_ids.len(),
            successful = response.successful_emails,
            failed = response.failed_emails,
            "sent evaluation reminder"
        );

        Ok(ReminderReport {
            successful_emails: response.successful_emails,
            failed_emails: response.failed_emails,
            requested_recipients: response.requested_recipients,
            deadline: recipients.deadline,
            deadline_passed: recipients.deadline_passed,
            sent_at: response.sent_at,
            previous_sent_at: template.previous_sent_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Person;
    use chrono::Duration;

    fn person(id: Uuid) -> Person {
        Person {
            id,
            first_name: "Test".into(),
            last_name: "Person".into(),
        }
    }

    fn participation(id: Uuid, team: Option<Uuid>) -> Participation {
        Participation {
            course_participation_id: id,
            person: person(id),
            team_allocation: team,
        }
    }

    fn completion(
        phase: Uuid,
        author: Uuid,
        target: Uuid,
        ev_type: EvaluationType,
        completed: bool,
    ) -> EvaluationCompletion {
        EvaluationCompletion {
            id: Uuid::new_v4(),
            course_participation_id: target,
            course_phase_id: phase,
            author_course_participation_id: author,
            completed_at: completed.then(Utc::now),
            completed,
            evaluation_type: ev_type,
        }
    }

    fn enabled_view(now: DateTime<Utc>) -> ReminderView {
        ReminderView {
            enabled: true,
            deadline: Some(now - Duration::hours(1)),
        }
    }

    #[test]
    fn disabled_type_marks_everyone_complete() {
        let now = Utc::now();
        let phase = Uuid::new_v4();
        let authors: Vec<Participation> =
            (0..3).map(|_| participation(Uuid::new_v4(), None)).collect();
        // completion rows exist but must not matter
        let completions = vec![completion(
            phase,
            authors[0].course_participation_id,
            authors[0].course_participation_id,
            EvaluationType::SelfEvaluation,
            true,
        )];

        let view = ReminderView {
            enabled: false,
            deadline: None,
        };
        let result = compute_recipients(
            view,
            &authors,
            &[],
            &completions,
            EvaluationType::SelfEvaluation,
            now,
        );
        assert!(!result.evaluation_enabled);
        assert_eq!(result.total_authors, 3);
        assert_eq!(result.completed_authors, 3);
        assert!(result.incomplete_author_course_participation_ids.is_empty());
    }

    #[test]
    fn authors_without_a_team_are_vacuously_complete_for_peer_and_tutor() {
        let now = Utc::now();
        let solo = participation(Uuid::new_v4(), None);
        for ev_type in [EvaluationType::Peer, EvaluationType::Tutor] {
            let result = compute_recipients(
                enabled_view(now),
                std::slice::from_ref(&solo),
                &[],
                &[],
                ev_type,
                now,
            );
            assert_eq!(result.completed_authors, 1, "{ev_type} should be vacuous");
            assert!(result.incomplete_author_course_participation_ids.is_empty());
        }
    }

    #[test]
    fn self_evaluation_requires_own_completion_even_without_a_team() {
        let now = Utc::now();
        let solo = participation(Uuid::new_v4(), None);
        let result = compute_recipients(
            enabled_view(now),
            std::slice::from_ref(&solo),
            &[],
            &[],
            EvaluationType::SelfEvaluation,
            now,
        );
        assert_eq!(result.completed_authors, 0);
        assert_eq!(
            result.incomplete_author_course_participation_ids,
            vec![solo.course_participation_id]
        );
    }

    #[test]
    fn peer_reminder_three_authors_two_in_a_team_one_solo() {
        let now = Utc::now();
        let phase = Uuid::new_v4();
        let team_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let solo = Uuid::new_v4();

        let participations = vec![
            participation(a, Some(team_id)),
            participation(b, Some(team_id)),
            participation(solo, None),
        ];
        let teams = vec![Team {
            id: team_id,
            name: "Team Rocket".into(),
            members: vec![person(a), person(b)],
            tutors: vec![],
        }];
        // a has evaluated b; b never evaluated a; solo has no peers
        let completions = vec![completion(phase, a, b, EvaluationType::Peer, true)];

        let result = compute_recipients(
            enabled_view(now),
            &participations,
            &teams,
            &completions,
            EvaluationType::Peer,
            now,
        );
        assert_eq!(result.total_authors, 3);
        assert_eq!(result.completed_authors, 2);
        assert_eq!(result.incomplete_author_course_participation_ids, vec![b]);
    }

    #[test]
    fn tutor_reminder_requires_every_tutor_to_be_evaluated() {
        let now = Utc::now();
        let phase = Uuid::new_v4();
        let team_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        let tutor_a = Uuid::new_v4();
        let tutor_b = Uuid::new_v4();

        let participations = vec![participation(member, Some(team_id))];
        let teams = vec![Team {
            id: team_id,
            name: "Team Alpha".into(),
            members: vec![person(member)],
            tutors: vec![person(tutor_a), person(tutor_b)],
        }];
        // only one of the two tutors evaluated
        let completions = vec![completion(phase, member, tutor_a, EvaluationType::Tutor, true)];

        let result = compute_recipients(
            enabled_view(now),
            &participations,
            &teams,
            &completions,
            EvaluationType::Tutor,
            now,
        );
        assert_eq!(result.completed_authors, 0);
        assert_eq!(
            result.incomplete_author_course_participation_ids,
            vec![member]
        );
    }

    #[test]
    fn uncompleted_and_wrong_type_rows_do_not_count() {
        let now = Utc::now();
        let phase = Uuid::new_v4();
        let author = participation(Uuid::new_v4(), None);
        let id = author.course_participation_id;
        let completions = vec![
            completion(phase, id, id, EvaluationType::SelfEvaluation, false),
            completion(phase, id, id, EvaluationType::Peer, true),
        ];

        let result = compute_recipients(
            enabled_view(now),
            std::slice::from_ref(&author),
            &[],
            &completions,
            EvaluationType::SelfEvaluation,
            now,
        );
        assert_eq!(result.completed_authors, 0);
    }

    #[test]
    fn incomplete_list_is_sorted_by_uuid_string() {
        let now = Utc::now();
        let participations: Vec<Participation> =
            (0..8).map(|_| participation(Uuid::new_v4(), None)).collect();

        let result = compute_recipients(
            enabled_view(now),
            &participations,
            &[],
            &[],
            EvaluationType::SelfEvaluation,
            now,
        );
        let strings: Vec<String> = result
            .incomplete_author_course_participation_ids
            .iter()
            .map(|id| id.to_string())
            .collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
        assert_eq!(strings.len(), 8);
    }

    #[test]
    fn deadline_passed_only_when_now_is_later() {
        let now = Utc::now();
        let future = ReminderView {
            enabled: true,
            deadline: Some(now + Duration::hours(2)),
        };
        let result = compute_recipients(
            future,
            &[],
            &[],
            &[],
            EvaluationType::SelfEvaluation,
            now,
        );
        assert!(!result.deadline_passed);

        let none = ReminderView {
            enabled: true,
            deadline: None,
        };
        let result = compute_recipients(none, &[], &[], &[], EvaluationType::SelfEvaluation, now);
        assert!(!result.deadline_passed);
    }

    #[test]
    fn template_requires_subject_and_content() {
        let data = serde_json::json!({
            "mailingSettings": {
                "assessmentReminder": {
                    "subject": "Evaluation reminder",
                    "content": "Please finish your {{evaluationType}} evaluation.",
                    "lastSentAtByType": { "peer": "2026-04-01T10:00:00Z" }
                }
            }
        });
        let template = reminder_template(&data, EvaluationType::Peer).unwrap();
        assert_eq!(template.subject, "Evaluation reminder");
        assert!(template.previous_sent_at.is_some());

        // self has never been sent
        let template = reminder_template(&data, EvaluationType::SelfEvaluation).unwrap();
        assert!(template.previous_sent_at.is_none());

        let empty = serde_json::json!({
            "mailingSettings": { "assessmentReminder": { "subject": "", "content": "hi" } }
        });
        assert!(matches!(
            reminder_template(&empty, EvaluationType::Peer),
            Err(Error::MailTemplateIncomplete)
        ));
        assert!(matches!(
            reminder_template(&serde_json::json!({}), EvaluationType::Peer),
            Err(Error::MailTemplateIncomplete)
        ));
    }

    #[test]
    fn last_sent_at_is_written_without_clobbering_other_types() {
        let sent = "2026-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let data = serde_json::json!({
            "mailingSettings": {
                "assessmentReminder": {
                    "subject": "s",
                    "content": "c",
                    "lastSentAtByType": { "peer": "2026-04-01T10:00:00Z" }
                }
            }
        });
        let updated = with_last_sent_at(data, EvaluationType::SelfEvaluation, sent);
        let by_type = &updated["mailingSettings"]["assessmentReminder"]["lastSentAtByType"];
        assert_eq!(by_type["peer"], "2026-04-01T10:00:00Z");
        assert_eq!(by_type["self"], sent.to_rfc3339());
        // subject survives the write-back
        assert_eq!(
            updated["mailingSettings"]["assessmentReminder"]["subject"],
            "s"
        );
    }

    #[test]
    fn last_sent_at_initializes_missing_structure() {
        let sent = Utc::now();
        let updated =
            with_last_sent_at(serde_json::Value::Null, EvaluationType::Tutor, sent);
        assert_eq!(
            updated["mailingSettings"]["assessmentReminder"]["lastSentAtByType"]["tutor"],
            sent.to_rfc3339()
        );
    }
}
