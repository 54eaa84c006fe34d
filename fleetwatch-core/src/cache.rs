//! Stale-while-revalidate summary cache and refresh engine.
//!
//! [`SummaryService`] answers "what is this agent doing" without blocking on the
//! model: fresh results come straight from memory, stale results are returned
//! immediately while a detached refresh runs, and cold agents fall back to the
//! persistent store. At most one refresh per agent is in flight, and a shared
//! admission gate caps concurrent model calls across the fleet.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SummaryConfig;
use crate::error::{StoreError, SummaryError, TranscriptError};
use crate::store::SummaryStore;
use crate::summarizer::Summarizer;
use crate::transcript::TranscriptReader;
use crate::types::{SummaryEvent, SummaryResult, TranscriptData};

/// Delta phrases that mark a regeneration as "nothing happened".
pub const DUPLICATE_PHRASES: &[&str] = &[
    "no change",
    "no new",
    "unchanged",
    "remains idle",
    "still idle",
    "same as",
    "no update",
];

/// Hook invoked after each non-duplicate summary is produced.
pub type SummaryCallback = Arc<dyn Fn(&SummaryEvent) + Send + Sync>;

/// What a single generation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// A new summary was cached, persisted, and announced.
    Generated,
    /// The model reported no meaningful change; cached only.
    Duplicate,
    /// Transcript fingerprint matched a fresh entry; the model was not called.
    Unchanged,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub generating: usize,
}

#[derive(Debug)]
struct CacheEntry {
    /// Identity of this entry; a replaced entry gets a new id.
    id: u64,
    result: Option<SummaryResult>,
    transcript_fingerprint: String,
    /// `None` for entries hydrated from the store, which are never fresh.
    cached_at: Option<Instant>,
    generating: bool,
    /// Why the last background refresh failed; cleared by the next success.
    last_error: Option<String>,
}

impl CacheEntry {
    fn new(id: u64) -> Self {
        Self {
            id,
            result: None,
            transcript_fingerprint: String::new(),
            cached_at: None,
            generating: false,
            last_error: None,
        }
    }

    fn within_ttl(&self, ttl: std::time::Duration) -> bool {
        self.cached_at.is_some_and(|at| at.elapsed() < ttl)
    }

    fn stale_copy(&self, result: &SummaryResult) -> SummaryResult {
        let mut stale = result.as_stale();
        stale.error = self.last_error.clone();
        stale
    }
}

/// Which entry a refresh owns. Used to clear exactly that entry's flag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryHandle {
    agent_id: String,
    entry_id: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_id: u64,
}

impl CacheState {
    /// Get an agent's entry, creating it (and enforcing the size bound) if absent.
    fn entry_mut(&mut self, agent_id: &str, max_entries: usize) -> &mut CacheEntry {
        if !self.entries.contains_key(agent_id) {
            self.next_id += 1;
            let entry = CacheEntry::new(self.next_id);
            self.entries.insert(agent_id.to_string(), entry);
            while self.entries.len() > max_entries {
                match self.evict_oldest(agent_id) {
                    Some(evicted) => debug!(agent_id = %evicted, "Evicted summary cache entry"),
                    None => break,
                }
            }
        }
        // Present: inserted above and never the eviction victim.
        self.entries
            .entry(agent_id.to_string())
            .or_insert_with(|| CacheEntry::new(0))
    }

    /// Remove the idle entry with the oldest `cached_at`, never touching `keep`.
    ///
    /// Entries with a refresh in flight are skipped; if every other entry is
    /// generating the cache temporarily exceeds its bound.
    fn evict_oldest(&mut self, keep: &str) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .filter(|(id, entry)| !entry.generating && id.as_str() != keep)
            .min_by_key(|(_, entry)| entry.cached_at)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }

    /// Mark an agent as generating. `None` if a refresh already owns it.
    fn claim(&mut self, agent_id: &str, max_entries: usize) -> Option<EntryHandle> {
        let entry = self.entry_mut(agent_id, max_entries);
        if entry.generating {
            return None;
        }
        entry.generating = true;
        Some(EntryHandle {
            agent_id: agent_id.to_string(),
            entry_id: entry.id,
        })
    }

    fn release(&mut self, handle: &EntryHandle) {
        if let Some(entry) = self.owned_mut(handle) {
            entry.generating = false;
        }
    }

    /// The entry a handle refers to, unless it has since been replaced.
    fn owned_mut(&mut self, handle: &EntryHandle) -> Option<&mut CacheEntry> {
        self.entries
            .get_mut(&handle.agent_id)
            .filter(|entry| entry.id == handle.entry_id)
    }
}

/// Clears the generating flag when the owning refresh ends, however it ends.
struct GeneratingGuard {
    inner: Arc<Inner>,
    handle: EntryHandle,
}

impl Drop for GeneratingGuard {
    fn drop(&mut self) {
        self.inner.write_cache().release(&self.handle);
    }
}

struct Inner {
    config: SummaryConfig,
    store: Arc<dyn SummaryStore>,
    summarizer: Arc<Summarizer>,
    reader: Arc<TranscriptReader>,
    cache: RwLock<CacheState>,
    gate: Semaphore,
    shutdown: CancellationToken,
    on_generated: RwLock<Option<SummaryCallback>>,
}

impl Inner {
    fn read_cache(&self) -> RwLockReadGuard<'_, CacheState> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The summary cache-and-refresh engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SummaryService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SummaryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryService")
            .field("enabled", &self.inner.config.enabled)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Lookup {
    Fresh(SummaryResult),
    Stale(SummaryResult),
    Missing,
}

impl SummaryService {
    pub fn new(
        config: SummaryConfig,
        store: Arc<dyn SummaryStore>,
        summarizer: Arc<Summarizer>,
        reader: Arc<TranscriptReader>,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                summarizer,
                reader,
                cache: RwLock::new(CacheState::default()),
                gate: Semaphore::new(permits),
                shutdown: CancellationToken::new(),
                on_generated: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SummaryConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Register the hook called for every non-duplicate summary.
    pub fn set_on_summary_generated<F>(&self, callback: F)
    where
        F: Fn(&SummaryEvent) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_generated
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.read_cache();
        CacheStats {
            entries: state.entries.len(),
            generating: state.entries.values().filter(|e| e.generating).count(),
        }
    }

    /// Current cached result, flagged stale if past the TTL. Schedules nothing.
    pub fn cached_summary(&self, agent_id: &str) -> Option<SummaryResult> {
        let state = self.inner.read_cache();
        let entry = state.entries.get(agent_id)?;
        let result = entry.result.as_ref()?;
        if entry.within_ttl(self.inner.config.cache_ttl()) {
            Some(result.clone())
        } else {
            Some(entry.stale_copy(result))
        }
    }

    /// Stop the background sweep and refuse new refreshes.
    pub fn shutdown(&self) {
        info!("Summary service shutting down");
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Latest summary for an agent. Never waits on the model.
    ///
    /// - fresh cached result: returned as-is
    /// - stale cached result: returned with `is_stale` set, refresh scheduled
    /// - nothing cached: latest persisted summary (stale) or `None`, refresh scheduled
    pub async fn get_summary(&self, agent_id: &str) -> Result<Option<SummaryResult>, SummaryError> {
        if !self.is_enabled() {
            return Err(SummaryError::ServiceDisabled);
        }

        let lookup = {
            let state = self.inner.read_cache();
            match state.entries.get(agent_id) {
                Some(entry) => match &entry.result {
                    Some(result) if entry.within_ttl(self.inner.config.cache_ttl()) => {
                        Lookup::Fresh(result.clone())
                    }
                    Some(result) => Lookup::Stale(entry.stale_copy(result)),
                    None => Lookup::Missing,
                },
                None => Lookup::Missing,
            }
        };

        match lookup {
            Lookup::Fresh(result) => return Ok(Some(result)),
            Lookup::Stale(result) => {
                self.trigger_refresh(agent_id);
                return Ok(Some(result));
            }
            Lookup::Missing => {}
        }

        let persisted = match self.inner.store.get_latest_summary(agent_id).await {
            Ok(found) => found,
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(SummaryError::StoreQueryFailed(e)),
        };

        if let Some(prior) = &persisted {
            self.hydrate(agent_id, prior);
        }
        self.trigger_refresh(agent_id);
        Ok(persisted.map(|prior| prior.as_stale()))
    }

    /// Seed an empty cache entry from the store without marking it fresh.
    fn hydrate(&self, agent_id: &str, prior: &SummaryResult) {
        let mut state = self.inner.write_cache();
        let entry = state.entry_mut(agent_id, self.inner.config.max_cache_entries);
        if entry.result.is_none() {
            entry.result = Some(prior.clone());
            entry.transcript_fingerprint = prior.transcript_fingerprint.clone();
            entry.cached_at = None;
        }
    }

    /// Summaries for many agents. Agents with nothing to show, or whose lookup
    /// fails, are left out.
    pub async fn get_all_summaries(
        &self,
        agent_ids: &[String],
    ) -> Result<Vec<SummaryResult>, SummaryError> {
        if !self.is_enabled() {
            return Err(SummaryError::ServiceDisabled);
        }
        let mut results = Vec::with_capacity(agent_ids.len());
        for agent_id in agent_ids {
            match self.get_summary(agent_id).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Skipping agent in batch lookup"),
            }
        }
        Ok(results)
    }

    /// Persisted summary history, newest first.
    pub async fn get_summary_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryResult>, SummaryError> {
        if !self.is_enabled() {
            return Err(SummaryError::ServiceDisabled);
        }
        self.inner
            .store
            .get_summary_history(agent_id, limit)
            .await
            .map_err(SummaryError::StoreQueryFailed)
    }

    /// Generate a summary now, in the caller's task.
    ///
    /// Missing `project_key` / `session_id` are resolved from the agent registry,
    /// then from the newest transcript in the project directory.
    pub async fn refresh_agent(
        &self,
        agent_id: &str,
        project_key: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<RefreshOutcome, SummaryError> {
        if !self.is_enabled() {
            return Err(SummaryError::ServiceDisabled);
        }
        if self.is_shutting_down() {
            return Err(SummaryError::ShuttingDown);
        }
        let _guard = self
            .claim(agent_id)
            .ok_or_else(|| SummaryError::RefreshInProgress {
                agent_id: agent_id.to_string(),
            })?;

        let project_key = project_key.map(str::trim).filter(|k| !k.is_empty());
        let session_id = session_id.map(str::trim).filter(|s| !s.is_empty());

        let (project_key, session_id) = match (project_key, session_id) {
            (Some(pk), Some(sid)) => (pk.to_string(), Some(sid.to_string())),
            (pk, sid) => {
                let agent = self
                    .inner
                    .store
                    .get_agent(agent_id)
                    .await
                    .map_err(SummaryError::StoreQueryFailed)?;
                let project_key = match (pk, &agent) {
                    (Some(pk), _) => pk.to_string(),
                    (None, Some(agent)) => agent
                        .project_key()
                        .map(str::to_string)
                        .ok_or_else(|| SummaryError::MissingProjectKey {
                            agent_id: agent_id.to_string(),
                        })?,
                    (None, None) => {
                        return Err(SummaryError::AgentNotFound {
                            agent_id: agent_id.to_string(),
                        });
                    }
                };
                let session_id = sid
                    .map(str::to_string)
                    .or_else(|| agent.as_ref().and_then(|a| a.session_id().map(str::to_string)));
                (project_key, session_id)
            }
        };

        let session_id = match session_id {
            Some(sid) => sid,
            None => self.find_active_session(&project_key).await?,
        };

        self.generate_summary(agent_id, &project_key, &session_id)
            .await
    }

    /// Schedule a detached refresh for an agent. Returns `false` when one is
    /// already running or the service is shutting down.
    ///
    /// A failed refresh is recorded on the entry and reported in the `error`
    /// field of stale copies until a later refresh succeeds.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn trigger_refresh(&self, agent_id: &str) -> bool {
        if !self.is_enabled() || self.is_shutting_down() {
            return false;
        }
        let Some(guard) = self.claim(agent_id) else {
            debug!(agent_id, "Refresh already in flight");
            return false;
        };

        let service = self.clone();
        tokio::spawn(async move {
            let agent_id = guard.handle.agent_id.clone();
            match service.refresh_from_registry(&agent_id).await {
                Ok(Some(outcome)) => debug!(agent_id = %agent_id, ?outcome, "Background refresh finished"),
                Ok(None) => {}
                Err(e) if e.is_data_unavailable() => {
                    debug!(agent_id = %agent_id, error = %e, "No transcript to summarize")
                }
                Err(SummaryError::ShuttingDown) => {}
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Background refresh failed");
                    if let Some(entry) = service.inner.write_cache().owned_mut(&guard.handle) {
                        entry.last_error = Some(e.to_string());
                    }
                }
            }
            drop(guard);
        });
        true
    }

    fn claim(&self, agent_id: &str) -> Option<GeneratingGuard> {
        let handle = self
            .inner
            .write_cache()
            .claim(agent_id, self.inner.config.max_cache_entries)?;
        Some(GeneratingGuard {
            inner: Arc::clone(&self.inner),
            handle,
        })
    }

    /// Refresh using only registry data. `Ok(None)` when the agent cannot be
    /// summarized (unknown, or no project key).
    async fn refresh_from_registry(
        &self,
        agent_id: &str,
    ) -> Result<Option<RefreshOutcome>, SummaryError> {
        let agent = self
            .inner
            .store
            .get_agent(agent_id)
            .await
            .map_err(SummaryError::StoreQueryFailed)?;
        let Some(agent) = agent else {
            debug!(agent_id, "Agent not registered; skipping refresh");
            return Ok(None);
        };
        let Some(project_key) = agent.project_key() else {
            debug!(agent_id, "Agent has no project key; skipping refresh");
            return Ok(None);
        };
        let session_id = match agent.session_id() {
            Some(sid) => sid.to_string(),
            None => self.find_active_session(project_key).await?,
        };
        self.generate_summary(agent_id, project_key, &session_id)
            .await
            .map(Some)
    }

    async fn find_active_session(&self, project_key: &str) -> Result<String, SummaryError> {
        let reader = Arc::clone(&self.inner.reader);
        let key = project_key.to_string();
        let base = reader.base_dir().to_path_buf();
        let session = tokio::task::spawn_blocking(move || reader.find_active_session(&key))
            .await
            .map_err(|e| TranscriptError::Io {
                path: base,
                source: std::io::Error::other(e.to_string()),
            })??;
        Ok(session)
    }

    async fn read_transcript(
        &self,
        project_key: &str,
        session_id: &str,
    ) -> Result<TranscriptData, SummaryError> {
        let reader = Arc::clone(&self.inner.reader);
        let key = project_key.to_string();
        let sid = session_id.to_string();
        let base = reader.base_dir().to_path_buf();
        let data = tokio::task::spawn_blocking(move || reader.read(&key, &sid))
            .await
            .map_err(|e| TranscriptError::Io {
                path: base,
                source: std::io::Error::other(e.to_string()),
            })??;
        Ok(data)
    }

    /// Read, summarize, cache, persist, notify. The caller owns the generating flag.
    async fn generate_summary(
        &self,
        agent_id: &str,
        project_key: &str,
        session_id: &str,
    ) -> Result<RefreshOutcome, SummaryError> {
        let transcript = self.read_transcript(project_key, session_id).await?;

        let (previous, unchanged) = {
            let state = self.inner.read_cache();
            match state.entries.get(agent_id) {
                Some(entry) => (
                    entry.result.as_ref().map(|r| r.summary.clone()),
                    entry.result.is_some()
                        && entry.transcript_fingerprint == transcript.fingerprint
                        && entry.within_ttl(self.inner.config.cache_ttl()),
                ),
                None => (None, false),
            }
        };
        if unchanged {
            debug!(agent_id, "Transcript unchanged; skipping model call");
            return Ok(RefreshOutcome::Unchanged);
        }

        let permit = tokio::select! {
            permit = self.inner.gate.acquire() => permit.map_err(|_| SummaryError::ShuttingDown)?,
            _ = self.inner.shutdown.cancelled() => return Err(SummaryError::ShuttingDown),
        };
        let started = Instant::now();
        let generated = self
            .inner
            .summarizer
            .summarize(&transcript.content, previous.as_deref())
            .await;
        drop(permit);
        let generated = generated?;

        let duplicate = is_duplicate(previous.as_deref(), &generated.summary, &generated.delta);

        let mut result = SummaryResult::new(
            agent_id,
            generated.summary.clone(),
            generated.delta.clone(),
            transcript.fingerprint.clone(),
        );
        result.cost_usd = generated.cost_usd;
        self.store_in_cache(agent_id, &result);

        if duplicate {
            debug!(agent_id, delta = %generated.delta, "Duplicate summary; not persisting");
            return Ok(RefreshOutcome::Duplicate);
        }

        if let Err(e) = self
            .inner
            .store
            .create_summary(agent_id, &result.summary, &result.delta, &result.transcript_fingerprint)
            .await
        {
            let e = SummaryError::PersistenceFailed(e);
            warn!(agent_id, error = %e, "Summary kept in cache only");
        }

        self.notify(&SummaryEvent {
            agent_id: agent_id.to_string(),
            summary: result.summary.clone(),
            delta: result.delta.clone(),
        });

        info!(
            agent_id,
            model = self.inner.summarizer.model_name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            cost_usd = generated.cost_usd.unwrap_or_default(),
            "Generated agent summary"
        );
        Ok(RefreshOutcome::Generated)
    }

    fn store_in_cache(&self, agent_id: &str, result: &SummaryResult) {
        let mut state = self.inner.write_cache();
        let entry = state.entry_mut(agent_id, self.inner.config.max_cache_entries);
        entry.result = Some(result.clone());
        entry.transcript_fingerprint = result.transcript_fingerprint.clone();
        entry.cached_at = Some(Instant::now());
        entry.last_error = None;
    }

    fn notify(&self, event: &SummaryEvent) {
        let callback = self
            .inner
            .on_generated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Trigger refreshes for every recently active agent with a project key.
    /// Returns how many refreshes were scheduled.
    pub async fn sweep_once(&self) -> usize {
        if !self.is_enabled() || self.is_shutting_down() {
            return 0;
        }
        let agents = match self.inner.store.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Background sweep could not list agents");
                return 0;
            }
        };
        let window = chrono::Duration::from_std(self.inner.config.active_window())
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut triggered = 0;
        for agent in agents
            .iter()
            .filter(|a| a.project_key().is_some() && a.last_active_at >= cutoff)
        {
            if self.trigger_refresh(&agent.id) {
                triggered += 1;
            }
        }
        debug!(triggered, total = agents.len(), "Background sweep");
        triggered
    }

    /// Periodically refresh active agents until [`shutdown`](Self::shutdown).
    pub async fn run_background_refresh(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the first sweep waits a full period.
        ticker.tick().await;
        info!(
            interval_secs = self.inner.config.refresh_interval_secs,
            "Background summary refresh started"
        );
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        info!("Background summary refresh stopped");
    }

    pub fn spawn_background_refresh(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run_background_refresh().await })
    }
}

/// Whether a regenerated summary adds nothing over `previous`.
///
/// True when the delta contains one of [`DUPLICATE_PHRASES`], or the summary
/// matches the previous one ignoring case and surrounding whitespace. Never
/// true without a previous summary.
pub fn is_duplicate(previous: Option<&str>, summary: &str, delta: &str) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    let delta = delta.to_lowercase();
    if DUPLICATE_PHRASES.iter().any(|p| delta.contains(p)) {
        return true;
    }
    summary.trim().to_lowercase() == previous.trim().to_lowercase()
}
