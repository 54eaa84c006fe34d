//! Core data types shared by the transcript reader, summarizer, store, and engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A generated (or store-hydrated) summary of what an agent is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    /// History row id, present once the summary has been persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub agent_id: String,
    pub summary: String,
    pub delta: String,
    pub transcript_fingerprint: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Set by the reader when a result is served past its TTL; never stored.
    #[serde(default)]
    pub is_stale: bool,
    /// Why the last background refresh failed, on stale copies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SummaryResult {
    pub fn new(
        agent_id: impl Into<String>,
        summary: impl Into<String>,
        delta: impl Into<String>,
        transcript_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            agent_id: agent_id.into(),
            summary: summary.into(),
            delta: delta.into(),
            transcript_fingerprint: transcript_fingerprint.into(),
            generated_at: Utc::now(),
            cost_usd: None,
            is_stale: false,
            error: None,
        }
    }

    /// Copy of this result flagged as stale.
    pub fn as_stale(&self) -> Self {
        Self {
            is_stale: true,
            ..self.clone()
        }
    }
}

/// A registered agent as seen by the summary engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Mangled (or raw) working-directory key used to locate transcripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
    pub last_active_at: DateTime<Utc>,
}

impl Agent {
    /// The project key, if one is recorded and non-blank.
    pub fn project_key(&self) -> Option<&str> {
        self.project_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// The current session id, if one is recorded and non-blank.
    pub fn session_id(&self) -> Option<&str> {
        self.current_session_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// The bounded tail of a transcript plus its content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptData {
    pub content: String,
    /// Hex SHA-256 of `content`.
    pub fingerprint: String,
}

/// Payload handed to the notification hook for each non-duplicate summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub agent_id: String,
    pub summary: String,
    pub delta: String,
}
