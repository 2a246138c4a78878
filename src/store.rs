//! Sources and sinks for the pipeline.
//!
//! The core is agnostic to storage. It reads driving-log records per date
//! and the facility set once per run, and writes two row streams with
//! upsert-by-key semantics: rerunning a date replaces its rows instead of
//! duplicating them.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;

use crate::error::{EngineOnError, Result};
use crate::{DailySummary, EngineOnEvent, Facility, ReadingRecord, EXPORT_DATE_FORMAT};

/// Driving-log records for one date.
pub trait ReadingSource: Send + Sync {
    fn readings_for_date(&self, date: NaiveDate) -> Result<Vec<ReadingRecord>>;
}

/// Facility reference set.
pub trait FacilitySource {
    fn load_facilities(&self) -> Result<Vec<Facility>>;
}

/// Destination of the raw event and daily summary streams.
///
/// Both methods replace any existing row with the same key.
pub trait RecordSink: Send + Sync {
    fn upsert_events(&self, events: &[EngineOnEvent]) -> Result<usize>;
    fn upsert_summaries(&self, summaries: &[DailySummary]) -> Result<usize>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| EngineOnError::Persistence {
        message: format!("store lock poisoned: {}", e),
    })
}

/// In-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<ReadingRecord>>,
    facilities: Mutex<Vec<Facility>>,
    events: Mutex<BTreeMap<String, EngineOnEvent>>,
    summaries: Mutex<BTreeMap<String, DailySummary>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(readings: Vec<ReadingRecord>, facilities: Vec<Facility>) -> Self {
        Self {
            readings: Mutex::new(readings),
            facilities: Mutex::new(facilities),
            ..Default::default()
        }
    }

    pub fn add_readings(&self, records: impl IntoIterator<Item = ReadingRecord>) -> Result<()> {
        lock(&self.readings)?.extend(records);
        Ok(())
    }

    pub fn set_facilities(&self, facilities: Vec<Facility>) -> Result<()> {
        *lock(&self.facilities)? = facilities;
        Ok(())
    }

    /// Stored events, ordered by key.
    pub fn events(&self) -> Result<Vec<EngineOnEvent>> {
        Ok(lock(&self.events)?.values().cloned().collect())
    }

    /// Stored summaries, ordered by key.
    pub fn summaries(&self) -> Result<Vec<DailySummary>> {
        Ok(lock(&self.summaries)?.values().cloned().collect())
    }
}

impl ReadingSource for MemoryStore {
    fn readings_for_date(&self, date: NaiveDate) -> Result<Vec<ReadingRecord>> {
        let wanted = date.format(EXPORT_DATE_FORMAT).to_string();
        Ok(lock(&self.readings)?
            .iter()
            .filter(|r| r.date.trim() == wanted)
            .cloned()
            .collect())
    }
}

impl FacilitySource for MemoryStore {
    fn load_facilities(&self) -> Result<Vec<Facility>> {
        Ok(lock(&self.facilities)?.clone())
    }
}

impl RecordSink for MemoryStore {
    fn upsert_events(&self, events: &[EngineOnEvent]) -> Result<usize> {
        let mut table = lock(&self.events)?;
        for event in events {
            table.insert(event.key.clone(), event.clone());
        }
        Ok(events.len())
    }

    fn upsert_summaries(&self, summaries: &[DailySummary]) -> Result<usize> {
        let mut table = lock(&self.summaries)?;
        for summary in summaries {
            table.insert(summary.key.clone(), summary.clone());
        }
        Ok(summaries.len())
    }
}
