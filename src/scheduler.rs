//! Date-range scheduling.
//!
//! One calendar date is the unit of work: fetch its records, aggregate,
//! persist. Dates run in strict calendar order, or on a bounded rayon pool
//! when `parallel_dates` is set. A failing (or panicking) date is recorded
//! in the report and never stops its siblings. Only an unusable facility
//! set aborts the run, and it does so before any date starts.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};

use crate::aggregate::{aggregate_day, DayOutcome};
use crate::error::{EngineOnError, Result};
use crate::store::{FacilitySource, ReadingSource, RecordSink};
use crate::{parse_date, FacilityIndex, SegmentConfig, EXPORT_DATE_FORMAT};

/// Called once per date as soon as it completes: `(outcome, completed, total)`.
///
/// With parallel dates the calls arrive in completion order, not date order.
pub type OutcomeCallback = Arc<dyn Fn(&DateOutcome, u32, u32) + Send + Sync>;

fn request_date<'de, D>(deserializer: D) -> std::result::Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_date(&text).map_err(serde::de::Error::custom)
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    4
}

/// Configuration for one scheduling run.
///
/// Deserializes from a run request where dates are `dd/mm/YYYY` (or ISO)
/// and every other field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// First date, inclusive
    #[serde(deserialize_with = "request_date")]
    pub start_date: NaiveDate,

    /// Last date, inclusive
    #[serde(deserialize_with = "request_date")]
    pub end_date: NaiveDate,

    /// Segmentation thresholds
    #[serde(default)]
    pub segment: SegmentConfig,

    /// Persist raw event rows.
    /// Default: true
    #[serde(default = "default_true")]
    pub save_raw: bool,

    /// Persist daily summary rows.
    /// Default: true
    #[serde(default = "default_true")]
    pub save_summary: bool,

    /// Run dates on a worker pool instead of in calendar order.
    /// Default: false
    #[serde(default)]
    pub parallel_dates: bool,

    /// Worker pool size when `parallel_dates` is set (at least 1).
    /// Default: 4
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Restrict processing to one vehicle and log its intervals and events.
    /// Default: None
    #[serde(default)]
    pub debug_vehicle: Option<String>,
}

impl RunConfig {
    /// Config for `start..=end` with every other field at its default.
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            segment: SegmentConfig::default(),
            save_raw: true,
            save_summary: true,
            parallel_dates: false,
            max_workers: default_max_workers(),
            debug_vehicle: None,
        }
    }

    /// Build from request date strings (`dd/mm/YYYY` or `YYYY-MM-DD`).
    pub fn from_request_dates(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_date(start)?, parse_date(end)?))
    }

    /// Every date of the range, in calendar order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.start_date
            .iter_days()
            .take_while(|d| *d <= self.end_date)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_date > self.end_date {
            return Err(EngineOnError::InvalidConfig {
                message: format!(
                    "start date {} is after end date {}",
                    self.start_date.format(EXPORT_DATE_FORMAT),
                    self.end_date.format(EXPORT_DATE_FORMAT)
                ),
            });
        }
        let max = self.segment.max_distance_m;
        if max.is_nan() || max < 0.0 {
            return Err(EngineOnError::InvalidConfig {
                message: format!("max distance must be a non-negative number, got {}", max),
            });
        }
        Ok(())
    }
}

/// How a completed date ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayKind {
    NoData,
    Empty,
    Processed,
}

/// Row counts of a completed date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateStatus {
    pub date: NaiveDate,
    pub kind: DayKind,
    /// Raw event rows produced
    pub raw: usize,
    /// Summary rows produced
    pub summary: usize,
}

/// Result of one date of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DateOutcome {
    Completed(DateStatus),
    Failed { date: NaiveDate, message: String },
}

impl DateOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            DateOutcome::Completed(status) => status.date,
            DateOutcome::Failed { date, .. } => *date,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DateOutcome::Failed { .. })
    }

    /// The failure as an error value, if this date failed.
    pub fn error(&self) -> Option<EngineOnError> {
        match self {
            DateOutcome::Failed { date, message } => Some(EngineOnError::DateFailed {
                date: date.format(EXPORT_DATE_FORMAT).to_string(),
                message: message.clone(),
            }),
            DateOutcome::Completed(_) => None,
        }
    }
}

impl std::fmt::Display for DateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let date = self.date().format(EXPORT_DATE_FORMAT);
        match self {
            DateOutcome::Completed(s) => match s.kind {
                DayKind::NoData => write!(f, "{}: no data", date),
                DayKind::Empty => write!(f, "{}: empty", date),
                DayKind::Processed => write!(f, "{}: raw={}, summary={}", date, s.raw, s.summary),
            },
            DateOutcome::Failed { message, .. } => write!(f, "{}: failed: {}", date, message),
        }
    }
}

/// Outcome of every date of a run, ordered by date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<DateOutcome>,
}

impl RunReport {
    /// `(raw event rows, summary rows)` across completed dates.
    pub fn totals(&self) -> (usize, usize) {
        self.outcomes.iter().fold((0, 0), |(raw, summary), o| match o {
            DateOutcome::Completed(s) => (raw + s.raw, summary + s.summary),
            DateOutcome::Failed { .. } => (raw, summary),
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &DateOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    /// One `"{date}: ..."` line per date.
    pub fn status_lines(&self) -> Vec<String> {
        self.outcomes.iter().map(ToString::to_string).collect()
    }
}

/// Run the full pipeline for every date in `config`'s range.
///
/// Facilities are loaded once, before any date; an empty or unreadable
/// facility set fails the whole run with `UpstreamUnavailable`. After that
/// the run always returns a report, with failed dates recorded in it.
pub fn run_date_range<S, K>(
    source: &S,
    sink: &K,
    config: &RunConfig,
    on_outcome: Option<OutcomeCallback>,
) -> Result<RunReport>
where
    S: ReadingSource + FacilitySource,
    K: RecordSink,
{
    config.validate()?;

    let facilities = source
        .load_facilities()
        .map_err(|e| EngineOnError::UpstreamUnavailable {
            message: format!("loading facilities: {}", e),
        })?;
    let facilities = FacilityIndex::new(facilities)?;

    let dates = config.dates();
    let total = dates.len() as u32;
    let completed = AtomicU32::new(0);
    let start = Instant::now();

    info!(
        "[Scheduler] Running {} dates ({} .. {}) with {} facilities, {}",
        total,
        config.start_date.format(EXPORT_DATE_FORMAT),
        config.end_date.format(EXPORT_DATE_FORMAT),
        facilities.len(),
        if config.parallel_dates {
            format!("{} workers", config.max_workers.max(1))
        } else {
            "sequential".to_string()
        }
    );

    let run_one = |date: NaiveDate| {
        let outcome = run_date_isolated(date, source, sink, &facilities, config);
        match &outcome {
            DateOutcome::Failed { .. } => warn!("[Scheduler] {}", outcome),
            DateOutcome::Completed(_) => info!("[Scheduler] {}", outcome),
        }
        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(cb) = &on_outcome {
            // A panicking callback never aborts the run
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cb(&outcome, done, total))) {
                warn!(
                    "[Scheduler] Outcome callback failed for {}: {}",
                    outcome.date().format(EXPORT_DATE_FORMAT),
                    panic_message(payload.as_ref())
                );
            }
        }
        outcome
    };

    let mut outcomes: Vec<DateOutcome> = if config.parallel_dates {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .thread_name(|i| format!("engineon-date-{}", i))
            .build()
            .map_err(|e| EngineOnError::InvalidConfig {
                message: format!("failed to build worker pool: {}", e),
            })?;
        pool.install(|| dates.par_iter().map(|d| run_one(*d)).collect())
    } else {
        dates.iter().map(|d| run_one(*d)).collect()
    };
    outcomes.sort_by_key(DateOutcome::date);

    let report = RunReport { outcomes };
    let (raw, summary) = report.totals();
    info!(
        "[Scheduler] Completed {} dates in {:.2}s: raw={}, summary={}, failed={}",
        total,
        start.elapsed().as_secs_f64(),
        raw,
        summary,
        report.failures().count()
    );

    Ok(report)
}

/// Run one date, converting errors and panics into a `Failed` outcome.
fn run_date_isolated<S, K>(
    date: NaiveDate,
    source: &S,
    sink: &K,
    facilities: &FacilityIndex,
    config: &RunConfig,
) -> DateOutcome
where
    S: ReadingSource + ?Sized,
    K: RecordSink + ?Sized,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        process_date(date, source, sink, facilities, config)
    }));

    match result {
        Ok(Ok(status)) => DateOutcome::Completed(status),
        Ok(Err(e)) => DateOutcome::Failed {
            date,
            message: e.to_string(),
        },
        Err(payload) => DateOutcome::Failed {
            date,
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

/// Fetch, aggregate and persist one date.
fn process_date<S, K>(
    date: NaiveDate,
    source: &S,
    sink: &K,
    facilities: &FacilityIndex,
    config: &RunConfig,
) -> Result<DateStatus>
where
    S: ReadingSource + ?Sized,
    K: RecordSink + ?Sized,
{
    let records = source.readings_for_date(date)?;
    let outcome = aggregate_day(
        date,
        &records,
        facilities,
        &config.segment,
        config.debug_vehicle.as_deref(),
    );

    let rows = match outcome {
        DayOutcome::NoData => return Ok(empty_status(date, DayKind::NoData)),
        DayOutcome::EmptyAfterFiltering => return Ok(empty_status(date, DayKind::Empty)),
        DayOutcome::Processed(rows) => rows,
    };

    if config.save_raw && !rows.events.is_empty() {
        sink.upsert_events(&rows.events)?;
    }
    if config.save_summary && !rows.summaries.is_empty() {
        sink.upsert_summaries(&rows.summaries)?;
    }

    let (raw, summary) = rows.counts();
    Ok(DateStatus {
        date,
        kind: DayKind::Processed,
        raw,
        summary,
    })
}

fn empty_status(date: NaiveDate, kind: DayKind) -> DateStatus {
    DateStatus {
        date,
        kind,
        raw: 0,
        summary: 0,
    }
}
