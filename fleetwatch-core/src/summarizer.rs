//! Transcript summarization protocol.
//!
//! A bounded transcript (plus the previous summary, when there is one) is sent
//! to the model under a fixed system prompt that asks for exactly two lines:
//!
//! ```text
//! SUMMARY: <what the agent is doing now>
//! DELTA: <what changed since the previous summary>
//! ```
//!
//! The model runs as an isolated, tool-less, non-persistent call with a hard
//! per-call timeout. Parsing is total: any response text yields a usable pair.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ModelError;

/// Summary used when the model gives nothing usable.
pub const IDLE_SUMMARY: &str = "Agent idle";

/// Delta used when the model omits the `DELTA:` line.
pub const INITIAL_DELTA: &str = "Initial summary";

/// System instruction for every summarization call.
pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize what an autonomous coding agent is currently doing, based on the tail of its session transcript.

Respond with exactly two lines and nothing else:
SUMMARY: <one sentence, present continuous tense, describing the current activity>
DELTA: <one sentence describing what changed since the previous summary>

Rules:
- Keep each line under 150 characters.
- Use present continuous tense (\"Refactoring the config loader\", \"Running the test suite\").
- If there is no previous summary, describe the starting activity in DELTA.
- If the transcript is empty or unclear, respond with \"SUMMARY: Agent idle\".
- Do not use tools, ask questions, or add commentary.";

/// Raw text returned by a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub cost_usd: Option<f64>,
}

/// An opaque text-in/text-out model.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    /// Run one completion with the given system prompt.
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<ModelResponse, ModelError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// A parsed summary produced by one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSummary {
    pub summary: String,
    pub delta: String,
    pub cost_usd: Option<f64>,
}

/// Generates summaries from transcripts with a hard per-call timeout.
pub struct Summarizer {
    model: Arc<dyn SummaryModel>,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(model: Arc<dyn SummaryModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Summarize a transcript tail, framing the delta against `previous`.
    pub async fn summarize(
        &self,
        transcript: &str,
        previous: Option<&str>,
    ) -> Result<GeneratedSummary, ModelError> {
        let prompt = build_prompt(transcript, previous);
        let response = tokio::time::timeout(
            self.timeout,
            self.model.complete(SUMMARY_SYSTEM_PROMPT, &prompt),
        )
        .await
        .map_err(|_| ModelError::Timeout {
            timeout_secs: self.timeout.as_secs(),
        })??;

        let (summary, delta) = parse_summary_response(&response.text);
        Ok(GeneratedSummary {
            summary,
            delta,
            cost_usd: response.cost_usd,
        })
    }
}

/// Build the user prompt for a summarization call.
pub fn build_prompt(transcript: &str, previous: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(prev) = previous.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str("Previous summary:\n");
        prompt.push_str(prev);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Transcript tail (one JSON record per line):\n");
    prompt.push_str(transcript);
    prompt.push_str("\n\nRespond with the SUMMARY and DELTA lines only.");
    prompt
}

/// Parse a `SUMMARY:` / `DELTA:` response. Never fails.
///
/// Lines other than the two prefixed ones are ignored. Without a `SUMMARY:` line
/// the whole trimmed response becomes the summary.
pub fn parse_summary_response(text: &str) -> (String, String) {
    let mut summary = None;
    let mut delta = None;
    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("SUMMARY:") {
            summary = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("DELTA:") {
            delta = Some(rest.trim().to_string());
        }
    }

    let summary = summary.unwrap_or_else(|| text.trim().to_string());
    let summary = if summary.is_empty() {
        IDLE_SUMMARY.to_string()
    } else {
        summary
    };
    let delta = delta.unwrap_or_else(|| INITIAL_DELTA.to_string());
    (summary, delta)
}

// ---------------------------------------------------------------------------
// Command-line model
// ---------------------------------------------------------------------------

/// Result envelope printed by the model CLI in JSON output mode.
#[derive(Debug, Deserialize)]
struct CliEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

/// Runs the model through its command-line client as an isolated child process.
///
/// Every call is print-only with tools disabled and session persistence off, so
/// summarization can neither act on files nor leak into an agent's own history.
pub struct CliSummaryModel {
    command: String,
    model: String,
    working_dir: PathBuf,
}

impl CliSummaryModel {
    pub fn new(command: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
            working_dir: std::env::temp_dir(),
        }
    }

    /// Directory the child process runs in (defaults to the system temp dir).
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    fn args<'a>(&'a self, system_prompt: &'a str) -> Vec<&'a str> {
        vec![
            "--print",
            "--output-format",
            "json",
            "--model",
            self.model.as_str(),
            "--no-session-persistence",
            "--tools",
            "",
            "--system-prompt",
            system_prompt,
        ]
    }
}

#[async_trait]
impl SummaryModel for CliSummaryModel {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<ModelResponse, ModelError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(self.args(system_prompt))
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::Spawn {
                message: format!("{}: {e}", self.command),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ModelError::Failed {
                    message: format!("writing prompt: {e}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ModelError::Failed {
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ModelError::Failed {
                message: format!("{} exited with {}: {}", self.command, output.status, stderr.trim()),
            });
        }

        let envelope: CliEnvelope =
            serde_json::from_slice(&output.stdout).map_err(|e| ModelError::ResponseParse {
                message: e.to_string(),
            })?;
        if envelope.is_error {
            return Err(ModelError::Failed {
                message: envelope
                    .result
                    .unwrap_or_else(|| "model reported an error".to_string()),
            });
        }

        debug!(
            model = %self.model,
            cost_usd = envelope.total_cost_usd,
            "Model call completed"
        );
        Ok(ModelResponse {
            text: envelope.result.unwrap_or_default(),
            cost_usd: envelope.total_cost_usd,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Mock model
// ---------------------------------------------------------------------------

/// A scripted model for tests and dry runs.
///
/// Queued responses are returned in order; once the queue is empty the default
/// response is returned. Tracks call counts and peak concurrency.
pub struct MockSummaryModel {
    responses: Mutex<VecDeque<Result<String, String>>>,
    default_response: String,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockSummaryModel {
    pub fn new() -> Self {
        Self::with_response("SUMMARY: Agent idle\nDELTA: Initial summary")
    }

    /// A mock that always answers with `text`.
    pub fn with_response(text: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: text.to_string(),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a response for the next call.
    pub fn queue_response(&self, text: &str) {
        self.lock_responses().push_back(Ok(text.to_string()));
    }

    /// Queue a failure for the next call.
    pub fn queue_failure(&self, message: &str) {
        self.lock_responses().push_back(Err(message.to_string()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockSummaryModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SummaryModel for MockSummaryModel {
    async fn complete(&self, _system_prompt: &str, prompt: &str) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.lock_responses().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match next.unwrap_or_else(|| Ok(self.default_response.clone())) {
            Ok(text) => Ok(ModelResponse {
                text,
                cost_usd: Some(0.0001),
            }),
            Err(message) => Err(ModelError::Failed { message }),
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}
