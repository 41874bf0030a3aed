//! Research session records with disk persistence.
//!
//! A session captures the lifecycle of one run: the topic, the agreed plan,
//! the current phase, and eventually the finished report. Sessions are
//! persisted as JSON so completed runs can be listed and inspected later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::types::{FinalReport, Section, TerminationReason};

/// Lifecycle phase of a persisted session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Building the section plan.
    Planning,
    /// Running research rounds.
    Researching,
    /// Running the refinement loop.
    Refining,
    /// Report produced.
    Complete,
    /// Run aborted with an error.
    Failed,
}

/// A persistent research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: Uuid,
    pub topic: String,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub plan: Vec<Section>,
    /// Research rounds finished so far.
    pub rounds_completed: usize,
    /// True when at least one search or synthesis branch was skipped.
    pub degraded: bool,
    pub termination: Option<TerminationReason>,
    pub report: Option<FinalReport>,
    pub error: Option<String>,
}

impl ResearchSession {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            phase: SessionPhase::Planning,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            plan: Vec::new(),
            rounds_completed: 0,
            degraded: false,
            termination: None,
            report: None,
            error: None,
        }
    }

    pub fn set_plan(&mut self, plan: Vec<Section>) {
        self.plan = plan;
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    /// Attach the finished report and mark the session complete.
    pub fn complete(&mut self, report: FinalReport) {
        self.termination = Some(report.termination_reason);
        self.report = Some(report);
        self.phase = SessionPhase::Complete;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.phase = SessionPhase::Failed;
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Planning | SessionPhase::Researching | SessionPhase::Refining
        )
    }

    /// Persist the session under `dir` as `<id>.json`.
    pub async fn save(&self, dir: &Path) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SessionError::SaveFailed {
                message: format!("creating {}: {e}", dir.display()),
            })?;
        let data = serde_json::to_string_pretty(self).map_err(|e| SessionError::SaveFailed {
            message: e.to_string(),
        })?;
        let path = dir.join(format!("{}.json", self.id));
        atomic_write(&path, data.as_bytes())
            .await
            .map_err(|e| SessionError::SaveFailed {
                message: format!("writing {}: {e}", path.display()),
            })
    }

    /// Load a session by id from `dir`.
    pub async fn load(dir: &Path, id: &Uuid) -> Result<Self, SessionError> {
        let path = dir.join(format!("{id}.json"));
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound { id: id.to_string() });
            }
            Err(e) => {
                return Err(SessionError::LoadFailed {
                    message: format!("reading {}: {e}", path.display()),
                });
            }
        };
        serde_json::from_str(&data).map_err(|e| SessionError::LoadFailed {
            message: format!("parsing {}: {e}", path.display()),
        })
    }

    /// List saved sessions, most recently updated first. Unreadable files
    /// are skipped.
    pub async fn list_sessions(dir: &Path) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return summaries;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false)
                && let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(session) = serde_json::from_str::<ResearchSession>(&data)
            {
                summaries.push(SessionSummary {
                    id: session.id,
                    topic: session.topic,
                    phase: session.phase,
                    rounds_completed: session.rounds_completed,
                    termination: session.termination,
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                });
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }
}

/// Summary of a stored session for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub topic: String,
    pub phase: SessionPhase,
    pub rounds_completed: usize,
    pub termination: Option<TerminationReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resolve the sessions directory from config, falling back to the
/// platform data directory.
pub fn sessions_dir(config: &SessionConfig) -> Option<PathBuf> {
    if let Some(dir) = &config.dir {
        return Some(dir.clone());
    }
    directories::ProjectDirs::from("dev", "sonde", "sonde")
        .map(|dirs| dirs.data_dir().join("sessions"))
}

/// Write via a temp file and rename so readers never observe partial JSON.
async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
