//! Core domain model, clock port and freshness rules for the word-of-the-day pipeline.

use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "wotd-core";

pub const DEFAULT_TIME_ZONE: Tz = chrono_tz::Africa::Nairobi;
pub const DEFAULT_TARGET_HOUR: u32 = 7;
pub const DEFAULT_TARGET_MINUTE: u32 = 0;

/// Dictionary definition with source attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub note: Option<String>,
    pub part_of_speech: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub text: String,
    pub title: String,
}

/// Immutable word-of-the-day snapshot as delivered by a remote source.
///
/// A newer artifact replaces an older one; nothing edits an artifact in place,
/// so fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    external_id: String,
    word: String,
    pronunciation: String,
    definition: Definition,
    examples: Vec<Example>,
    published_at: String,
    note: String,
}

impl Artifact {
    pub fn new(
        external_id: impl Into<String>,
        word: impl Into<String>,
        pronunciation: impl Into<String>,
        definition: Definition,
        examples: Vec<Example>,
        published_at: impl Into<String>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            word: word.into(),
            pronunciation: pronunciation.into(),
            definition,
            examples,
            published_at: published_at.into(),
            note: note.into(),
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn word(&self) -> &str {
        &self.word
    }

    pub fn pronunciation(&self) -> &str {
        &self.pronunciation
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Publish timestamp exactly as the remote source sent it.
    pub fn published_at(&self) -> &str {
        &self.published_at
    }

    pub fn note(&self) -> &str {
        &self.note
    }
}

/// The single persisted slot: an artifact paired with the local time it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub artifact: Artifact,
    pub fetched_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(artifact: Artifact, fetched_at: DateTime<Utc>) -> Self {
        Self {
            artifact,
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("no cached word of the day is available")]
    NoCachedData,
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Network-class failures are worth another attempt against the same endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::MalformedResponse(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::NoCachedData | Self::Storage(_) => ErrorKind::LocalData,
            Self::MalformedResponse(_) => ErrorKind::Generic,
        }
    }
}

/// Result handed to consumers of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        artifact: Artifact,
        served_from_cache: bool,
        last_updated: DateTime<Utc>,
        /// Write-back failure that did not prevent serving a fresh artifact.
        storage_error: Option<PipelineError>,
    },
    Failure {
        reason: PipelineError,
        stale_artifact: Option<Artifact>,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whatever artifact the outcome can offer, fresh or stale.
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Success { artifact, .. } => Some(artifact),
            Self::Failure { stale_artifact, .. } => stale_artifact.as_ref(),
        }
    }

    pub fn served_from_cache(&self) -> bool {
        matches!(
            self,
            Self::Success {
                served_from_cache: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    LocalData,
    Generic,
}

/// Minimal state a presentation layer needs to render the word of the day.
#[derive(Debug, Clone, PartialEq)]
pub enum WordOfTheDayState {
    Loading,
    Success {
        artifact: Artifact,
        is_from_cache: bool,
        last_updated: DateTime<Utc>,
    },
    Error {
        message: String,
        kind: ErrorKind,
        cached_data: Option<Artifact>,
    },
}

impl From<FetchOutcome> for WordOfTheDayState {
    fn from(outcome: FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Success {
                artifact,
                served_from_cache,
                last_updated,
                ..
            } => Self::Success {
                artifact,
                is_from_cache: served_from_cache,
                last_updated,
            },
            FetchOutcome::Failure {
                reason,
                stale_artifact,
            } => Self::Error {
                message: reason.to_string(),
                kind: reason.kind(),
                cached_data: stale_artifact,
            },
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_in(&self, zone: Tz) -> DateTime<Tz> {
        self.now().with_timezone(&zone)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleConfigError {
    #[error("target hour {0} is outside 0-23")]
    HourOutOfRange(u32),
    #[error("target minute {0} is outside 0-59")]
    MinuteOutOfRange(u32),
    #[error("unknown time zone `{0}`")]
    UnknownTimeZone(String),
}

/// Pure freshness rules shared by the orchestrator and the scheduler.
///
/// A cached artifact is only trusted when both the daily-boundary test and the
/// publish-staleness test pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    time_zone: Tz,
    target_hour: u32,
    target_minute: u32,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            time_zone: DEFAULT_TIME_ZONE,
            target_hour: DEFAULT_TARGET_HOUR,
            target_minute: DEFAULT_TARGET_MINUTE,
        }
    }
}

impl FreshnessPolicy {
    pub fn new(
        time_zone: Tz,
        target_hour: u32,
        target_minute: u32,
    ) -> Result<Self, ScheduleConfigError> {
        if target_hour > 23 {
            return Err(ScheduleConfigError::HourOutOfRange(target_hour));
        }
        if target_minute > 59 {
            return Err(ScheduleConfigError::MinuteOutOfRange(target_minute));
        }
        Ok(Self {
            time_zone,
            target_hour,
            target_minute,
        })
    }

    pub fn from_zone_name(
        zone: &str,
        target_hour: u32,
        target_minute: u32,
    ) -> Result<Self, ScheduleConfigError> {
        let time_zone: Tz = zone
            .trim()
            .parse()
            .map_err(|_| ScheduleConfigError::UnknownTimeZone(zone.to_string()))?;
        Self::new(time_zone, target_hour, target_minute)
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn target_hour(&self) -> u32 {
        self.target_hour
    }

    pub fn target_minute(&self) -> u32 {
        self.target_minute
    }

    /// The target wall-clock time on `date` in the configured zone.
    ///
    /// A target that falls into a DST gap moves forward to the first valid
    /// local time; an ambiguous one resolves to the earlier instant.
    pub fn local_occurrence(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date
            .and_hms_opt(self.target_hour, self.target_minute, 0)
            .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
        (0..=8)
            .find_map(|step| {
                self.time_zone
                    .from_local_datetime(&(naive + Duration::minutes(15 * step)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }

    /// First boundary after which a record fetched at `fetched_at` is outdated.
    pub fn next_boundary_after_fetch(&self, fetched_at: DateTime<Utc>) -> DateTime<Utc> {
        let fetched_day = fetched_at.with_timezone(&self.time_zone).date_naive();
        let next_day = fetched_day.succ_opt().unwrap_or(fetched_day);
        self.local_occurrence(next_day)
    }

    /// Next target occurrence strictly after `now`.
    pub fn next_occurrence_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.time_zone).date_naive();
        let candidate = self.local_occurrence(today);
        if candidate > now {
            return candidate;
        }
        let mut day = today;
        loop {
            let Some(next) = day.succ_opt() else {
                return candidate;
            };
            day = next;
            let occurrence = self.local_occurrence(day);
            if occurrence > now {
                return occurrence;
            }
        }
    }

    pub fn crossed_daily_boundary(
        &self,
        now: DateTime<Utc>,
        last_fetched_at: Option<DateTime<Utc>>,
    ) -> bool {
        match last_fetched_at {
            Some(fetched_at) => now >= self.next_boundary_after_fetch(fetched_at),
            None => true,
        }
    }

    /// Calendar day, in the configured zone, that a publish timestamp belongs to.
    pub fn published_day(&self, published_at: &str) -> Option<NaiveDate> {
        let raw = published_at.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&self.time_zone).date_naive());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(
                Utc.from_utc_datetime(&naive)
                    .with_timezone(&self.time_zone)
                    .date_naive(),
            );
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
    }

    /// True when the artifact belongs to an earlier day than `now`, or when its
    /// publish timestamp cannot be read at all.
    pub fn is_publish_stale(&self, now: DateTime<Utc>, published_at: &str) -> bool {
        let today = now.with_timezone(&self.time_zone).date_naive();
        match self.published_day(published_at) {
            Some(day) => day < today,
            None => true,
        }
    }

    pub fn should_refetch(
        &self,
        now: DateTime<Utc>,
        last_fetched_at: Option<DateTime<Utc>>,
        cached_published_at: Option<&str>,
    ) -> bool {
        let boundary = self.crossed_daily_boundary(now, last_fetched_at);
        let stale = cached_published_at
            .map(|published| self.is_publish_stale(now, published))
            .unwrap_or(true);
        boundary || stale
    }

    pub fn should_refetch_record(&self, now: DateTime<Utc>, record: Option<&CacheRecord>) -> bool {
        match record {
            Some(record) => self.should_refetch(
                now,
                Some(record.fetched_at),
                Some(record.artifact.published_at()),
            ),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nairobi(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        DEFAULT_TIME_ZONE
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("valid nairobi time")
            .with_timezone(&Utc)
    }

    fn artifact(id: &str, published_at: &str) -> Artifact {
        Artifact::new(
            id,
            "lagniappe",
            "lan-YAP",
            Definition {
                source: "ahd-5".into(),
                text: "A small gift given to a customer.".into(),
                note: None,
                part_of_speech: "noun".into(),
            },
            vec![Example {
                text: "A little lagniappe with every order.".into(),
                title: "Times-Picayune".into(),
            }],
            published_at,
            "From Louisiana French.",
        )
    }

    #[test]
    fn boundary_is_next_local_day_at_target_time() {
        let policy = FreshnessPolicy::default();
        let boundary = policy.next_boundary_after_fetch(nairobi(2024, 1, 1, 5, 0));
        assert_eq!(boundary, nairobi(2024, 1, 2, 7, 0));

        // 23:30 UTC is already the next local day in Nairobi.
        let late_utc = Utc
            .with_ymd_and_hms(2024, 1, 1, 23, 30, 0)
            .single()
            .expect("ts");
        assert_eq!(
            policy.next_boundary_after_fetch(late_utc),
            nairobi(2024, 1, 3, 7, 0)
        );
    }

    #[test]
    fn boundary_is_inclusive() {
        let policy = FreshnessPolicy::default();
        let fetched = Some(nairobi(2024, 1, 1, 5, 0));
        assert!(!policy.crossed_daily_boundary(nairobi(2024, 1, 2, 6, 59), fetched));
        assert!(policy.crossed_daily_boundary(nairobi(2024, 1, 2, 7, 0), fetched));
        assert!(policy.crossed_daily_boundary(nairobi(2024, 1, 2, 7, 0), None));
    }

    #[test]
    fn restart_after_missed_boundary_requires_refetch() {
        let policy = FreshnessPolicy::default();
        let record = CacheRecord::new(
            artifact("wod-1", "2024-01-01T03:00:00.000Z"),
            nairobi(2024, 1, 1, 6, 0),
        );
        assert!(policy.should_refetch_record(nairobi(2024, 1, 2, 8, 0), Some(&record)));
    }

    #[test]
    fn publish_staleness_uses_local_calendar_day() {
        let policy = FreshnessPolicy::default();
        let now = nairobi(2024, 1, 2, 6, 0);
        assert!(policy.is_publish_stale(now, "2024-01-01T03:00:00.000Z"));
        assert!(!policy.is_publish_stale(now, "2024-01-02T03:00:00.000Z"));
        assert!(!policy.is_publish_stale(now, "2024-01-02"));
        assert!(!policy.is_publish_stale(now, "2024-01-02T00:00:00"));
        assert!(!policy.is_publish_stale(now, "2024-01-03"));
    }

    #[test]
    fn unparseable_publish_date_is_stale() {
        let policy = FreshnessPolicy::default();
        assert!(policy.is_publish_stale(nairobi(2024, 1, 2, 6, 0), "next tuesday"));
        assert!(policy.is_publish_stale(nairobi(2024, 1, 2, 6, 0), ""));
    }

    #[test]
    fn either_test_alone_forces_refetch() {
        let policy = FreshnessPolicy::default();
        let fetched = Some(nairobi(2024, 1, 1, 5, 0));

        // Both pass: trust the cache.
        assert!(!policy.should_refetch(
            nairobi(2024, 1, 1, 6, 0),
            fetched,
            Some("2024-01-01T03:00:00.000Z")
        ));
        // Publish date from yesterday, boundary not yet crossed.
        assert!(policy.should_refetch(
            nairobi(2024, 1, 1, 6, 0),
            fetched,
            Some("2023-12-31T03:00:00.000Z")
        ));
        // Boundary crossed, publish date still "today" for the remote.
        assert!(policy.should_refetch(
            nairobi(2024, 1, 2, 7, 30),
            fetched,
            Some("2024-01-02T03:00:00.000Z")
        ));
    }

    #[test]
    fn next_occurrence_is_strictly_after_now() {
        let policy = FreshnessPolicy::default();
        assert_eq!(
            policy.next_occurrence_after(nairobi(2024, 1, 1, 6, 0)),
            nairobi(2024, 1, 1, 7, 0)
        );
        assert_eq!(
            policy.next_occurrence_after(nairobi(2024, 1, 1, 7, 0)),
            nairobi(2024, 1, 2, 7, 0)
        );
        assert_eq!(
            policy.next_occurrence_after(nairobi(2024, 1, 1, 9, 15)),
            nairobi(2024, 1, 2, 7, 0)
        );
    }

    #[test]
    fn dst_gap_moves_forward() {
        // 02:30 does not exist in New York on 2024-03-10.
        let policy = FreshnessPolicy::from_zone_name("America/New_York", 2, 30).expect("policy");
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).expect("date");
        let occurrence = policy.local_occurrence(date);
        let local = occurrence.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(local.date_naive(), date);
        assert!(local.format("%H:%M").to_string().as_str() >= "03:00");
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert_eq!(
            FreshnessPolicy::new(DEFAULT_TIME_ZONE, 24, 0),
            Err(ScheduleConfigError::HourOutOfRange(24))
        );
        assert_eq!(
            FreshnessPolicy::new(DEFAULT_TIME_ZONE, 7, 60),
            Err(ScheduleConfigError::MinuteOutOfRange(60))
        );
        assert!(matches!(
            FreshnessPolicy::from_zone_name("Mars/Olympus_Mons", 7, 0),
            Err(ScheduleConfigError::UnknownTimeZone(_))
        ));
    }

    #[test]
    fn outcome_maps_to_presentation_state() {
        let stale = artifact("wod-1", "2024-01-01");
        let state = WordOfTheDayState::from(FetchOutcome::Failure {
            reason: PipelineError::NoCachedData,
            stale_artifact: None,
        });
        assert!(matches!(
            state,
            WordOfTheDayState::Error {
                kind: ErrorKind::LocalData,
                cached_data: None,
                ..
            }
        ));

        let state = WordOfTheDayState::from(FetchOutcome::Success {
            artifact: stale.clone(),
            served_from_cache: true,
            last_updated: nairobi(2024, 1, 1, 5, 0),
            storage_error: None,
        });
        assert_eq!(
            state,
            WordOfTheDayState::Success {
                artifact: stale,
                is_from_cache: true,
                last_updated: nairobi(2024, 1, 1, 5, 0),
            }
        );
    }

    #[test]
    fn artifact_serde_keeps_identity_fields() {
        let original = artifact("wod-42", "2024-01-01T03:00:00.000Z");
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: Artifact = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.external_id(), "wod-42");
        assert_eq!(parsed.published_at(), "2024-01-01T03:00:00.000Z");
        assert_eq!(parsed, original);
    }

    #[test]
    fn manual_clock_projects_into_zone() {
        let clock = ManualClock::new(nairobi(2024, 1, 1, 23, 0));
        clock.advance(Duration::hours(2));
        let local = clock.now_in(DEFAULT_TIME_ZONE);
        assert_eq!(
            local.date_naive(),
            NaiveDate::from_ymd_opt(2024, 1, 2).expect("date")
        );
    }
}
