//! HTTP client for the platform's core service. Every call is a synchronous
//! (from the caller's perspective) request with a fixed timeout; non-2xx
//! responses and transport errors both surface as `Error::CoreService`.

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Course, CoursePhase, ManualMailRequest, ManualMailResponse, Participation, Team};

const READ_TIMEOUT: Duration = Duration::from_secs(15);
const MAIL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct CoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = env::var("CORE_URL").expect("CORE_URL not set");
        Self::new(base_url)
    }

    pub async fn get_course_phase(&self, course_phase_id: Uuid) -> Result<CoursePhase> {
        let url = format!("{}/api/course_phases/{}", self.base_url, course_phase_id);
        let context = "failed to fetch course phase from core";
        let resp = self
            .http
            .get(&url)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::core(context, e))
    }

    /// Persists an updated course phase (used to write back
    /// `restrictedData.mailingSettings`).
    pub async fn update_course_phase(&self, phase: &CoursePhase) -> Result<()> {
        let url = format!("{}/api/course_phases/{}", self.base_url, phase.id);
        let context = "failed to update course phase in core";
        let resp = self
            .http
            .put(&url)
            .timeout(READ_TIMEOUT)
            .json(phase)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        Ok(())
    }

    pub async fn get_course(&self, course_id: Uuid) -> Result<Course> {
        let url = format!("{}/api/courses/{}", self.base_url, course_id);
        let context = "failed to fetch course from core";
        let resp = self
            .http
            .get(&url)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::core(context, e))
    }

    pub async fn get_participations(&self, course_phase_id: Uuid) -> Result<Vec<Participation>> {
        let url = format!(
            "{}/api/course_phases/{}/participations",
            self.base_url, course_phase_id
        );
        let context = "failed to fetch participations from core";
        let resp = self
            .http
            .get(&url)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::core(context, e))
    }

    pub async fn get_teams(&self, course_phase_id: Uuid) -> Result<Vec<Team>> {
        let url = format!("{}/api/course_phases/{}/teams", self.base_url, course_phase_id);
        let context = "failed to fetch teams from core";
        let resp = self
            .http
            .get(&url)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::core(context, e))
    }

    pub async fn send_manual_mail(
        &self,
        course_phase_id: Uuid,
        request: &ManualMailRequest,
    ) -> Result<ManualMailResponse> {
        let url = format!("{}/api/mailing/{}/manual", self.base_url, course_phase_id);
        let context = "failed to send reminder mail via core";
        let resp = self
            .http
            .post(&url)
            .timeout(MAIL_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::core(context, e))?;
        if !resp.status().is_success() {
            return Err(Error::core(context, format!("status {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::core(context, e))
    }
}
