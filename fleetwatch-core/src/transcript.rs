//! Transcript reader: locates an agent's session log and reads its bounded tail.
//!
//! Project directories live under a base directory and are named by mangling the
//! agent's working directory (`/home/dev/app.rs` -> `-home-dev-app-rs`). Reads
//! are bounded twice: by bytes (only the last [`MAX_TRANSCRIPT_BYTES`] of a file
//! are ever loaded) and by lines (only the last `max_lines` lines are kept). The
//! fingerprint is computed over the retained tail, not the raw file.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::TranscriptError;
use crate::types::TranscriptData;

/// Files larger than this are read from the end only.
pub const MAX_TRANSCRIPT_BYTES: u64 = 10 * 1024 * 1024;

/// Extensions recognized as session transcripts.
pub const TRANSCRIPT_EXTENSIONS: &[&str] = &["jsonl", "json"];

/// Directory substituted for project keys that would escape the base directory.
/// It is never created, so reads under it fail with "not found".
pub const INVALID_PROJECT_DIR: &str = ".fleetwatch-invalid-project";

const MANGLE_CHAR: char = '-';

/// Reads bounded transcript tails from a base project directory.
#[derive(Debug, Clone)]
pub struct TranscriptReader {
    base_dir: PathBuf,
    max_lines: usize,
    max_bytes: u64,
}

impl TranscriptReader {
    pub fn new(base_dir: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_lines: max_lines.max(1),
            max_bytes: MAX_TRANSCRIPT_BYTES,
        }
    }

    /// Override the byte ceiling (mainly useful in tests).
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Resolve the project directory for a key, guaranteed to stay under the base.
    ///
    /// Keys that resolve to the base itself or anywhere outside it are replaced by
    /// [`INVALID_PROJECT_DIR`].
    pub fn project_dir(&self, project_key: &str) -> PathBuf {
        let base = normalize_lexically(&self.base_dir);
        let candidate = normalize_lexically(&base.join(mangle_project_key(project_key)));
        if candidate != base && candidate.starts_with(&base) {
            candidate
        } else {
            warn!(project_key, "project key escapes the transcript base directory");
            base.join(INVALID_PROJECT_DIR)
        }
    }

    /// Candidate transcript paths for a session, in lookup order.
    pub fn transcript_candidates(
        &self,
        project_key: &str,
        session_id: &str,
    ) -> Result<Vec<PathBuf>, TranscriptError> {
        validate_session_id(session_id)?;
        let dir = self.project_dir(project_key);
        Ok(vec![
            dir.join(format!("{session_id}.jsonl")),
            dir.join(format!("{session_id}.json")),
            dir.join(session_id).join("transcript.jsonl"),
            dir.join("sessions").join(format!("{session_id}.jsonl")),
        ])
    }

    /// Find the first existing transcript file for a session.
    pub fn locate(&self, project_key: &str, session_id: &str) -> Result<PathBuf, TranscriptError> {
        self.transcript_candidates(project_key, session_id)?
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| TranscriptError::NotFound {
                project_key: project_key.to_string(),
                session_id: session_id.to_string(),
            })
    }

    /// Read the bounded tail of a session transcript and fingerprint it.
    pub fn read(&self, project_key: &str, session_id: &str) -> Result<TranscriptData, TranscriptError> {
        let path = self.locate(project_key, session_id)?;
        let raw = read_bounded(&path, self.max_bytes).map_err(|source| TranscriptError::Io {
            path: path.clone(),
            source,
        })?;
        let content = tail_lines(&raw, self.max_lines);
        let fingerprint = fingerprint(&content);
        debug!(
            project_key,
            session_id,
            path = %path.display(),
            bytes = content.len(),
            fingerprint = %fingerprint,
            "Read transcript tail"
        );
        Ok(TranscriptData {
            content,
            fingerprint,
        })
    }

    /// Return the session id of the most recently modified transcript in a project.
    pub fn find_active_session(&self, project_key: &str) -> Result<String, TranscriptError> {
        let dir = self.project_dir(project_key);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TranscriptError::NoActiveSession {
                    project_key: project_key.to_string(),
                });
            }
            Err(source) => return Err(TranscriptError::Io { path: dir, source }),
        };

        let mut newest: Option<(SystemTime, String)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let recognized = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| TRANSCRIPT_EXTENSIONS.contains(&ext));
            if !recognized {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, stem.to_string()));
            }
        }

        newest
            .map(|(_, session)| session)
            .ok_or_else(|| TranscriptError::NoActiveSession {
                project_key: project_key.to_string(),
            })
    }
}

/// Mangle a working-directory path into a project directory name.
///
/// Keys without path separators are taken to be already mangled and returned as-is.
pub fn mangle_project_key(project_key: &str) -> String {
    if !project_key.contains(['/', '\\']) {
        return project_key.to_string();
    }
    project_key
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' => MANGLE_CHAR,
            other => other,
        })
        .collect()
}

/// Hex SHA-256 of transcript content.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn validate_session_id(session_id: &str) -> Result<(), TranscriptError> {
    let invalid = session_id.trim().is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(TranscriptError::InvalidSessionId {
            session_id: session_id.to_string(),
        });
    }
    Ok(())
}

/// Read a file, loading at most the last `max_bytes` bytes.
///
/// When the file is truncated the first (partial) line of the chunk is dropped.
fn read_bounded(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    if len <= max_bytes {
        // The file may still be growing; never read past the ceiling.
        let mut buf = Vec::with_capacity(len as usize);
        file.take(max_bytes).read_to_end(&mut buf)?;
        return Ok(String::from_utf8_lossy(&buf).into_owned());
    }

    file.seek(SeekFrom::Start(len - max_bytes))?;
    let mut buf = Vec::with_capacity(max_bytes as usize);
    file.take(max_bytes).read_to_end(&mut buf)?;
    let complete = match buf.iter().position(|&b| b == b'\n') {
        Some(idx) => &buf[idx + 1..],
        None => &[][..],
    };
    Ok(String::from_utf8_lossy(complete).into_owned())
}

/// Keep only the last `max_lines` lines, joined with `\n`.
fn tail_lines(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content
        .trim_end_matches(|c| c == '\n' || c == '\r')
        .lines()
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !matches!(out.components().next_back(), Some(Component::RootDir)) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
