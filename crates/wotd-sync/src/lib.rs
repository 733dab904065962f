//! Word-of-the-day orchestration: freshness-gated fetching with retries and the daily scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wotd_adapters::{FixtureSource, RemoteSource, WordnikSource, WORDNIK_BASE_URL};
use wotd_core::{
    Artifact, CacheRecord, Clock, FetchOutcome, FreshnessPolicy, PipelineError, SystemClock,
    DEFAULT_TARGET_HOUR, DEFAULT_TARGET_MINUTE,
};
use wotd_storage::{ArtifactStore, FileArtifactStore, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "wotd-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub target_hour: u32,
    pub target_minute: u32,
    pub time_zone: String,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub hard_failure_backoff_minutes: u64,
    pub cache_path: PathBuf,
    pub fixture_path: Option<PathBuf>,
    pub wordnik_api_key: String,
    pub wordnik_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_hour: DEFAULT_TARGET_HOUR,
            target_minute: DEFAULT_TARGET_MINUTE,
            time_zone: "Africa/Nairobi".to_string(),
            max_retries: 3,
            retry_backoff_ms: 1000,
            hard_failure_backoff_minutes: 15,
            cache_path: PathBuf::from("./data/word_of_the_day.json"),
            fixture_path: None,
            wordnik_api_key: String::new(),
            wordnik_base_url: WORDNIK_BASE_URL.to_string(),
            user_agent: "wotd-bot/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let small = |key: &str, default: u32| -> u32 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            target_hour: small("WOTD_TARGET_HOUR", defaults.target_hour),
            target_minute: small("WOTD_TARGET_MINUTE", defaults.target_minute),
            time_zone: lookup("WOTD_TIME_ZONE").unwrap_or(defaults.time_zone),
            max_retries: small("WOTD_MAX_RETRIES", defaults.max_retries),
            retry_backoff_ms: number("WOTD_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            hard_failure_backoff_minutes: number(
                "WOTD_HARD_FAILURE_BACKOFF_MINUTES",
                defaults.hard_failure_backoff_minutes,
            ),
            cache_path: lookup("WOTD_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            fixture_path: lookup("WOTD_FIXTURE_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            wordnik_api_key: lookup("WORDNIK_API_KEY").unwrap_or(defaults.wordnik_api_key),
            wordnik_base_url: lookup("WORDNIK_BASE_URL").unwrap_or(defaults.wordnik_base_url),
            user_agent: lookup("WOTD_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: number("WOTD_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.freshness_policy()?;
        anyhow::ensure!(self.max_retries >= 1, "max_retries must be at least 1");
        anyhow::ensure!(
            self.hard_failure_backoff_minutes >= 1,
            "hard_failure_backoff_minutes must be at least 1"
        );
        anyhow::ensure!(self.http_timeout_secs >= 1, "http_timeout_secs must be at least 1");
        Ok(())
    }

    pub fn freshness_policy(&self) -> Result<FreshnessPolicy> {
        FreshnessPolicy::from_zone_name(&self.time_zone, self.target_hour, self.target_minute)
            .context("invalid daily schedule")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            hard_failure_backoff: Duration::from_secs(
                self.hard_failure_backoff_minutes.saturating_mul(60),
            ),
            ..SchedulerConfig::default()
        }
    }
}

/// Linear backoff: the wait after attempt `n` is `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Answers "what is today's word" from the cache or the remote source.
///
/// The whole read-decide-fetch-write sequence runs under one lock, so at most
/// one remote fetch is ever in flight and late callers see the fresh record.
pub struct FetchOrchestrator {
    store: Arc<dyn ArtifactStore>,
    source: Arc<dyn RemoteSource>,
    clock: Arc<dyn Clock>,
    policy: FreshnessPolicy,
    retry: RetryPolicy,
    slot_lock: Mutex<()>,
}

impl FetchOrchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        source: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
        policy: FreshnessPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            policy,
            retry,
            slot_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub async fn get_word_of_day(&self, force: bool) -> FetchOutcome {
        let _slot = self.slot_lock.lock().await;
        let cached = self.load_cached().await;

        if !force {
            if let Some(record) = &cached {
                let now = self.clock.now();
                if !self.policy.should_refetch_record(now, Some(record)) {
                    debug!(
                        external_id = record.artifact.external_id(),
                        fetched_at = %record.fetched_at,
                        "serving word of the day from cache"
                    );
                    return FetchOutcome::Success {
                        artifact: record.artifact.clone(),
                        served_from_cache: true,
                        last_updated: record.fetched_at,
                        storage_error: None,
                    };
                }
            }
        }

        match self.fetch_with_retries().await {
            Ok(artifact) => self.store_fresh(artifact, cached.as_ref()).await,
            Err(err) => Self::fall_back(err, cached),
        }
    }

    /// Current record without touching the network.
    pub async fn latest(&self) -> Result<Option<CacheRecord>, PipelineError> {
        Ok(self.store.get_latest().await?)
    }

    pub async fn clear_cache(&self) -> Result<(), PipelineError> {
        let _slot = self.slot_lock.lock().await;
        self.store.clear().await?;
        info!("word of the day cache cleared");
        Ok(())
    }

    async fn load_cached(&self) -> Option<CacheRecord> {
        match self.store.get_latest().await {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "cached word of the day unreadable; treating cache as empty");
                None
            }
        }
    }

    async fn fetch_with_retries(&self) -> Result<Artifact, PipelineError> {
        let attempts = self.retry.max_retries.max(1);
        let source_id = self.source.source_id();
        let mut last_error = PipelineError::Network("no fetch attempted".to_string());

        for attempt in 1..=attempts {
            let span = info_span!("fetch_attempt", source_id, attempt, max = attempts);
            match self.source.fetch_artifact().instrument(span).await {
                Ok(artifact) => {
                    info!(
                        source_id,
                        attempt,
                        external_id = artifact.external_id(),
                        word = artifact.word(),
                        "fetched word of the day"
                    );
                    return Ok(artifact);
                }
                Err(err) => {
                    warn!(source_id, attempt, error = %err, "word of the day fetch failed");
                    let retryable = err.is_retryable();
                    last_error = err;
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn store_fresh(&self, artifact: Artifact, cached: Option<&CacheRecord>) -> FetchOutcome {
        let now = self.clock.now();

        if let Some(existing) =
            cached.filter(|record| record.artifact.external_id() == artifact.external_id())
        {
            debug!(
                external_id = artifact.external_id(),
                fetched_at = %existing.fetched_at,
                "remote returned the cached artifact; keeping existing record"
            );
            return FetchOutcome::Success {
                artifact,
                served_from_cache: false,
                last_updated: now,
                storage_error: None,
            };
        }

        let record = CacheRecord::new(artifact, now);
        let storage_error = match self.store.put(&record).await {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    error = %err,
                    external_id = record.artifact.external_id(),
                    "failed to persist word of the day; serving in-memory result"
                );
                Some(PipelineError::from(err))
            }
        };

        FetchOutcome::Success {
            artifact: record.artifact,
            served_from_cache: false,
            last_updated: now,
            storage_error,
        }
    }

    fn fall_back(err: PipelineError, cached: Option<CacheRecord>) -> FetchOutcome {
        match cached {
            Some(record) => {
                warn!(
                    error = %err,
                    external_id = record.artifact.external_id(),
                    fetched_at = %record.fetched_at,
                    "retries exhausted; serving stale cached word"
                );
                FetchOutcome::Success {
                    artifact: record.artifact,
                    served_from_cache: true,
                    last_updated: record.fetched_at,
                    storage_error: None,
                }
            }
            None => {
                error!(error = %err, "retries exhausted and nothing cached");
                FetchOutcome::Failure {
                    reason: PipelineError::NoCachedData,
                    stale_artifact: None,
                }
            }
        }
    }
}

/// Wire the production pipeline: file store, system clock, and either the
/// Wordnik API or a fixture payload.
pub fn build_orchestrator(config: &PipelineConfig) -> Result<FetchOrchestrator> {
    config.validate()?;
    let source: Arc<dyn RemoteSource> = match &config.fixture_path {
        Some(path) => Arc::new(FixtureSource::new(path.clone())),
        None => {
            if config.wordnik_api_key.trim().is_empty() {
                warn!("WORDNIK_API_KEY is empty; requests will likely be rejected");
            }
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            })?;
            Arc::new(WordnikSource::new(
                http,
                config.wordnik_base_url.clone(),
                config.wordnik_api_key.clone(),
            ))
        }
    };

    Ok(FetchOrchestrator::new(
        Arc::new(FileArtifactStore::new(config.cache_path.clone())),
        source,
        Arc::new(SystemClock),
        config.freshness_policy()?,
        config.retry_policy(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Base delay after a run that produced no data at all; grows linearly per attempt.
    pub hard_failure_backoff: Duration,
    /// Longest single sleep before the wall clock is consulted again.
    pub poll_interval: Duration,
    /// Run one non-forced fetch at startup so a stale cache is repaired immediately.
    pub warm_up_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hard_failure_backoff: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(60),
            warm_up_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Waiting(DateTime<Utc>),
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunResult {
    Refreshed,
    ServedStale,
    HardFailure,
}

impl From<&FetchOutcome> for RunResult {
    fn from(outcome: &FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Success {
                served_from_cache: false,
                ..
            } => Self::Refreshed,
            FetchOutcome::Success { .. } => Self::ServedStale,
            FetchOutcome::Failure { .. } => Self::HardFailure,
        }
    }
}

/// Process-lifetime scheduler bookkeeping. Never persisted: a restarted
/// process derives a fresh state from the wall clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_run: DateTime<Utc>,
    /// The daily occurrence the cadence is anchored to.
    pub slot: DateTime<Utc>,
    pub retry_attempt: u32,
    pub time_zone: Tz,
}

impl ScheduleState {
    pub fn initial(policy: &FreshnessPolicy, now: DateTime<Utc>) -> Self {
        let slot = policy.next_occurrence_after(now);
        Self {
            next_run: slot,
            slot,
            retry_attempt: 0,
            time_zone: policy.time_zone(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run
    }

    /// Advance after a run finished at `now`.
    pub fn plan_next(
        &mut self,
        policy: &FreshnessPolicy,
        now: DateTime<Utc>,
        result: RunResult,
        hard_failure_backoff: Duration,
    ) {
        let next_slot = following_slot(policy, self.slot, now);
        match result {
            RunResult::Refreshed | RunResult::ServedStale => {
                self.retry_attempt = 0;
                self.slot = next_slot;
                self.next_run = next_slot;
            }
            RunResult::HardFailure => {
                self.retry_attempt = self.retry_attempt.saturating_add(1);
                let delay = chrono::Duration::from_std(
                    hard_failure_backoff.saturating_mul(self.retry_attempt),
                )
                .unwrap_or_else(|_| chrono::Duration::days(1));
                let retry_at = now + delay;
                if retry_at < next_slot {
                    self.next_run = retry_at;
                } else {
                    self.slot = next_slot;
                    self.next_run = next_slot;
                }
            }
        }
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            next_run: self.next_run,
            next_run_local: self
                .next_run
                .with_timezone(&self.time_zone)
                .format("%Y-%m-%d %H:%M:%S %Z")
                .to_string(),
            slot: self.slot,
            retry_attempt: self.retry_attempt,
            time_zone: self.time_zone.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub next_run: DateTime<Utc>,
    pub next_run_local: String,
    pub slot: DateTime<Utc>,
    pub retry_attempt: u32,
    pub time_zone: String,
}

/// Daily occurrence after `slot`, skipping whole days already behind `now`.
/// A slot still ahead of `now` has not fired yet and stays the target.
fn following_slot(
    policy: &FreshnessPolicy,
    slot: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if slot > now {
        return slot;
    }
    let mut day = slot.with_timezone(&policy.time_zone()).date_naive();
    loop {
        let Some(next_day) = day.succ_opt() else {
            return policy.next_occurrence_after(now);
        };
        day = next_day;
        let candidate = policy.local_occurrence(day);
        if candidate > now && candidate > slot {
            return candidate;
        }
    }
}

pub struct Scheduler {
    orchestrator: Arc<FetchOrchestrator>,
    clock: Arc<dyn Clock>,
    policy: FreshnessPolicy,
    config: SchedulerConfig,
    phase: watch::Sender<SchedulerPhase>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<FetchOrchestrator>, config: SchedulerConfig) -> Self {
        let clock = orchestrator.clock();
        let policy = *orchestrator.policy();
        let (phase, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            orchestrator,
            clock,
            policy,
            config,
            phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase.subscribe()
    }

    pub fn initial_state(&self) -> ScheduleState {
        ScheduleState::initial(&self.policy, self.clock.now())
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ScheduleState> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Loop until `shutdown` flips to true (or its sender goes away). Returns the
    /// final state for inspection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ScheduleState {
        let mut state = self.initial_state();
        info!(
            next_run = %state.snapshot().next_run_local,
            "word of the day scheduler started"
        );

        if self.config.warm_up_on_start && !*shutdown.borrow() {
            let warm_up = self.spawn_run(false);
            match self.await_run(warm_up, &mut shutdown).await {
                None => return self.stop(state),
                // A failed warm-up backs off like any hard failure; a good one
                // leaves the pending slot alone.
                Some(RunResult::HardFailure) => {
                    state.plan_next(
                        &self.policy,
                        self.clock.now(),
                        RunResult::HardFailure,
                        self.config.hard_failure_backoff,
                    );
                    warn!(
                        retry_attempt = state.retry_attempt,
                        next_run = %state.snapshot().next_run_local,
                        "warm-up fetch failed"
                    );
                }
                Some(_) => {}
            }
        }

        loop {
            if *shutdown.borrow() {
                return self.stop(state);
            }

            let now = self.clock.now();
            if !state.is_due(now) {
                self.phase.send_replace(SchedulerPhase::Waiting(state.next_run));
                let remaining = (state.next_run - now).to_std().unwrap_or(Duration::ZERO);
                let nap = remaining.min(self.config.poll_interval);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = shutdown.changed() => return self.stop(state),
                }
                continue;
            }

            self.phase.send_replace(SchedulerPhase::Running);
            let run = self.spawn_run(true);
            let Some(result) = self.await_run(run, &mut shutdown).await else {
                return self.stop(state);
            };

            state.plan_next(
                &self.policy,
                self.clock.now(),
                result,
                self.config.hard_failure_backoff,
            );
            info!(
                ?result,
                retry_attempt = state.retry_attempt,
                next_run = %state.snapshot().next_run_local,
                "scheduled run finished"
            );
        }
    }

    fn spawn_run(&self, force: bool) -> JoinHandle<FetchOutcome> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let run_id = Uuid::new_v4();
        let span = info_span!("scheduled_run", %run_id, force);
        tokio::spawn(async move { orchestrator.get_word_of_day(force).await }.instrument(span))
    }

    /// `None` means shutdown was requested; the run is aborted.
    async fn await_run(
        &self,
        mut run: JoinHandle<FetchOutcome>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<RunResult> {
        tokio::select! {
            joined = &mut run => Some(match joined {
                Ok(outcome) => RunResult::from(&outcome),
                Err(err) => {
                    error!(error = %err, "scheduled fetch task died; backing off");
                    RunResult::HardFailure
                }
            }),
            _ = shutdown.changed() => {
                run.abort();
                None
            }
        }
    }

    fn stop(&self, state: ScheduleState) -> ScheduleState {
        self.phase.send_replace(SchedulerPhase::Idle);
        info!("word of the day scheduler stopped");
        state
    }
}
