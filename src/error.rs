use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};

use crate::models::EvaluationType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Closed set of failure kinds for the assessment service. Handlers match on
/// variants, never on message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{context}: {detail}")]
    CoreService {
        context: &'static str,
        detail: String,
    },

    #[error("{ev_type} evaluation is not enabled for this course phase")]
    ReminderEvaluationDisabled { ev_type: EvaluationType },

    #[error("evaluation deadline has not passed yet{}", .deadline.as_ref().map(|d| format!(" (deadline: {})", d.to_rfc3339())).unwrap_or_default())]
    ReminderDeadlineNotPassed { deadline: Option<DateTime<Utc>> },

    #[error("the evaluation deadline has passed")]
    DeadlinePassed,

    #[error("failed to find corresponding entity in new schema")]
    EntityNotInCopiedSchema,

    #[error("reminder mail template is missing a subject or content")]
    MailTemplateIncomplete,

    #[error("no course phase config found for this course phase")]
    ConfigNotFound,

    #[error("assessment schema not found")]
    SchemaNotFound,

    #[error("{0} not found")]
    EntityNotFound(&'static str),

    #[error("unknown evaluation type: {0}")]
    UnknownEvaluationType(String),
}

impl Error {
    /// Builds a mapper that wraps a query failure with one layer of context,
    /// for use at the call site: `.map_err(Error::query("failed to ..."))`.
    pub fn query(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
        move |source| Error::Query { context, source }
    }

    pub fn core(context: &'static str, detail: impl ToString) -> Error {
        Error::CoreService {
            context,
            detail: detail.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::DeadlinePassed => StatusCode::FORBIDDEN,
            Error::UnknownEvaluationType(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_passed_maps_to_forbidden() {
        let resp = Error::DeadlinePassed.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn reminder_errors_map_to_internal_error() {
        let disabled = Error::ReminderEvaluationDisabled {
            ev_type: EvaluationType::Peer,
        };
        assert_eq!(
            disabled.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let not_passed = Error::ReminderDeadlineNotPassed { deadline: None };
        assert_eq!(
            not_passed.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn deadline_not_passed_mentions_deadline_when_known() {
        let when = "2026-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let err = Error::ReminderDeadlineNotPassed {
            deadline: Some(when),
        };
        assert!(err.to_string().contains("2026-05-01"));
        let bare = Error::ReminderDeadlineNotPassed { deadline: None };
        assert!(!bare.to_string().contains('('));
    }
}
