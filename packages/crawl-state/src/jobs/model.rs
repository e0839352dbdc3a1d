//! Job definition, runtime state and schedule records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::status::JobStatus;
use crate::error::{CrawlStateError, Result};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Re-crawls documents on an interval until stopped
    Continuous,
    /// Crawls the specified document set once per run
    #[default]
    Specified,
}

impl JobType {
    pub fn code(self) -> &'static str {
        match self {
            JobType::Continuous => "C",
            JobType::Specified => "S",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "C" => Ok(JobType::Continuous),
            "S" => Ok(JobType::Specified),
            other => Err(corrupt("job type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartMethod {
    /// Start when a schedule window opens
    WindowBegin,
    /// Start any time while inside a schedule window
    WindowInside,
    /// Only start on explicit request
    #[default]
    Disable,
}

impl StartMethod {
    pub fn code(self) -> &'static str {
        match self {
            StartMethod::WindowBegin => "B",
            StartMethod::WindowInside => "I",
            StartMethod::Disable => "D",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "B" => Ok(StartMethod::WindowBegin),
            "I" => Ok(StartMethod::WindowInside),
            "D" => Ok(StartMethod::Disable),
            other => Err(corrupt("start method", other)),
        }
    }
}

/// How hop-count caches react to edge deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HopcountMode {
    #[default]
    Accurate,
    NoDelete,
    NeverDelete,
}

impl HopcountMode {
    pub fn code(self) -> &'static str {
        match self {
            HopcountMode::Accurate => "A",
            HopcountMode::NoDelete => "N",
            HopcountMode::NeverDelete => "V",
        }
    }

    /// Null and empty codes predate the column and mean `Accurate`.
    pub fn from_code(code: Option<&str>) -> Result<Self> {
        match code.map(str::trim) {
            None | Some("") | Some("A") => Ok(HopcountMode::Accurate),
            Some("N") => Ok(HopcountMode::NoDelete),
            Some("V") => Ok(HopcountMode::NeverDelete),
            Some(other) => Err(corrupt("hopcount mode", other)),
        }
    }
}

fn corrupt(kind: &'static str, code: &str) -> CrawlStateError {
    CrawlStateError::CorruptRow {
        kind,
        code: code.to_string(),
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// A set of calendar values; empty means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumeratedValues(BTreeSet<u32>);

impl EnumeratedValues {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: u32) -> bool {
        self.is_any() || self.0.contains(&value)
    }

    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Column form: `"1,2,3"`, or NULL for "any".
    pub fn to_column(&self) -> Option<String> {
        if self.is_any() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn from_column(column: Option<&str>) -> Result<Self> {
        let Some(raw) = column else {
            return Ok(Self::any());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty() && *part != "*")
            .map(|part| part.parse::<u32>().map_err(|_| corrupt("schedule value", part)))
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }
}

impl FromIterator<u32> for EnumeratedValues {
    fn from_iter<I: IntoIterator<Item = u32>>(values: I) -> Self {
        Self(values.into_iter().collect())
    }
}

impl<const N: usize> From<[u32; N]> for EnumeratedValues {
    fn from(values: [u32; N]) -> Self {
        values.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct ScheduleRecord {
    pub day_of_week: EnumeratedValues,
    pub day_of_month: EnumeratedValues,
    pub month_of_year: EnumeratedValues,
    pub year: EnumeratedValues,
    pub hour_of_day: EnumeratedValues,
    pub minutes_of_hour: EnumeratedValues,
    #[builder(setter(strip_option))]
    pub timezone: Option<String>,
    /// Window length in milliseconds
    #[builder(setter(strip_option))]
    pub window_length: Option<i64>,
    pub request_minimum: bool,
}

// ============================================================================
// Job Model
// ============================================================================

/// Operational columns owned by the status machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub error_text: Option<String>,
    pub last_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    /// Watermark for incremental scans
    pub last_check_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub reseed_time: Option<DateTime<Utc>>,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            status: JobStatus::Inactive,
            error_text: None,
            last_time: None,
            start_time: None,
            last_check_time: None,
            end_time: None,
            window_end: None,
            reseed_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: i64,

    // Definition
    #[builder(default)]
    pub description: String,
    pub connection_name: String,
    pub output_name: String,
    /// Opaque serialized document specification
    #[builder(default)]
    pub document_spec: String,
    /// Opaque serialized output specification
    #[builder(default)]
    pub output_spec: String,
    #[builder(default)]
    pub job_type: JobType,
    #[builder(default)]
    pub start_method: StartMethod,
    #[builder(default = 5)]
    pub priority: i32,
    /// Milliseconds between continuous re-crawls
    #[builder(default, setter(strip_option))]
    pub interval: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub expiration: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub reseed_interval: Option<i64>,
    #[builder(default)]
    pub hopcount_mode: HopcountMode,

    // Child records
    #[builder(default)]
    pub schedule: Vec<ScheduleRecord>,
    /// Link type -> maximum hop count
    #[builder(default)]
    pub hop_filters: BTreeMap<String, i64>,

    // Runtime
    #[builder(default)]
    pub state: JobState,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        self.state.status
    }

    /// Whether two versions of a job differ in what they would crawl or emit.
    pub fn specs_differ(&self, other: &Job) -> bool {
        self.document_spec != other.document_spec || self.output_spec != other.output_spec
    }
}

// ============================================================================
// Status Update
// ============================================================================

/// Changes to [`JobState`] produced by one transition.
///
/// `None` leaves a column alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: Option<JobStatus>,
    pub error_text: Option<Option<String>>,
    pub last_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    /// Moves `last_check_time` forward, never back
    pub advance_last_check: Option<DateTime<Utc>>,
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub window_end: Option<Option<DateTime<Utc>>>,
    pub reseed_time: Option<Option<DateTime<Utc>>>,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn error(mut self, text: Option<String>) -> Self {
        self.error_text = Some(text);
        self
    }

    pub fn last_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_time = Some(at);
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn advance_last_check(mut self, at: DateTime<Utc>) -> Self {
        self.advance_last_check = Some(at);
        self
    }

    pub fn end_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn window_end(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.window_end = Some(at);
        self
    }

    pub fn reseed_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.reseed_time = Some(at);
        self
    }

    pub fn apply_to(&self, state: &mut JobState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(error_text) = &self.error_text {
            state.error_text = error_text.clone();
        }
        if let Some(at) = self.last_time {
            state.last_time = Some(at);
        }
        if let Some(at) = self.start_time {
            state.start_time = Some(at);
        }
        if let Some(at) = self.advance_last_check {
            state.last_check_time = Some(state.last_check_time.map_or(at, |prev| prev.max(at)));
        }
        if let Some(at) = self.end_time {
            state.end_time = at;
        }
        if let Some(at) = self.window_end {
            state.window_end = at;
        }
        if let Some(at) = self.reseed_time {
            state.reseed_time = at;
        }
    }
}
