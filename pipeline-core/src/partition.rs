//! Calendar-month range partitioning of the event log.
//!
//! Events are routed by `occurred_at`. A partition covers `[start, end)` where `start` is
//! midnight UTC on the first day of the month. Postgres does the routing natively; the
//! in-memory store uses the same keys to shard its arena.
use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const EVENTS_TABLE: &str = "pipeline_events";

/// Furthest ahead partitions are ever provisioned, in months.
pub const MAX_HORIZON_MONTHS: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn for_timestamp(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start() && ts < self.end()
    }

    pub fn table_name(&self) -> String {
        format!("{}_{:04}_{:02}", EVENTS_TABLE, self.year, self.month)
    }

    pub fn parse_table_name(name: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidPartitionName(name.to_owned());

        let suffix = name
            .strip_prefix(EVENTS_TABLE)
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or_else(invalid)?;
        let (year, month) = suffix.split_once('_').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }

        Ok(Self { year, month })
    }

    /// Every partition overlapping the half-open window `[from, to)`, oldest first.
    pub fn covering(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Self> {
        let mut keys = vec![];
        if from >= to {
            return keys;
        }

        let mut key = Self::for_timestamp(from);
        while key.start() < to {
            keys.push(key);
            key = key.next();
        }
        keys
    }

    /// The current month followed by the next `months` months, capped at `MAX_HORIZON_MONTHS`.
    pub fn horizon(now: DateTime<Utc>, months: u32) -> Vec<Self> {
        let months = months.min(MAX_HORIZON_MONTHS);
        let mut keys = Vec::with_capacity(months as usize + 1);
        let mut key = Self::for_timestamp(now);
        for _ in 0..=months {
            keys.push(key);
            key = key.next();
        }
        keys
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
