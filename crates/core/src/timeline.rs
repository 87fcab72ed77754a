//! Temporal schemas: expanding a date range into the periods of a cube.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::cube::Period;
use crate::error::{DomainError, DomainResult};

/// Upper bound on periods produced by one timeline.
pub const MAX_PERIODS: usize = 4096;

/// How a date range is cut into periods.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalSchema {
    /// A single period covering the whole range.
    Continuous,
    /// Consecutive windows of `step` months.
    #[serde(alias = "M")]
    Monthly,
    /// Windows of `step` days that restart every year on the start day-of-year.
    #[serde(alias = "A")]
    Cyclic,
}

/// A date range plus the schema used to split it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub schema: TemporalSchema,
    #[serde(default = "default_step")]
    pub step: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

fn default_step() -> u32 {
    1
}

impl Timeline {
    pub fn new(schema: TemporalSchema, step: u32, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            schema,
            step,
            start,
            end,
        }
    }

    /// Expand into ordered, non-overlapping periods clipped to `[start, end]`.
    pub fn periods(&self) -> DomainResult<Vec<Period>> {
        if self.start > self.end {
            return Err(DomainError::timeline(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if self.step == 0 && self.schema != TemporalSchema::Continuous {
            return Err(DomainError::timeline("step must be positive"));
        }

        let periods = match self.schema {
            TemporalSchema::Continuous => vec![Period::new(self.start, self.end)?],
            TemporalSchema::Monthly => self.monthly()?,
            TemporalSchema::Cyclic => self.cyclic()?,
        };
        Ok(periods)
    }

    fn monthly(&self) -> DomainResult<Vec<Period>> {
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let next = cursor
                .checked_add_months(Months::new(self.step))
                .ok_or_else(|| DomainError::timeline("exceeds supported dates"))?;
            let window_end = next.pred_opt().unwrap_or(next).min(self.end);
            push_bounded(&mut out, Period::new(cursor, window_end)?)?;
            cursor = next;
        }
        Ok(out)
    }

    fn cyclic(&self) -> DomainResult<Vec<Period>> {
        let mut out = Vec::new();
        let anchor = self.start.ordinal();

        for year in self.start.year()..=self.end.year() {
            let cycle_start = anchored(year, anchor)?;
            let cycle_end = anchored(year + 1, anchor)?
                .pred_opt()
                .ok_or_else(|| DomainError::timeline("exceeds supported dates"))?;

            let mut cursor = cycle_start.max(self.start);
            let last = cycle_end.min(self.end);
            while cursor <= last {
                let next = cursor
                    .checked_add_days(Days::new(u64::from(self.step)))
                    .ok_or_else(|| DomainError::timeline("exceeds supported dates"))?;
                let window_end = next.pred_opt().unwrap_or(next).min(last);
                push_bounded(&mut out, Period::new(cursor, window_end)?)?;
                cursor = next;
            }
        }
        Ok(out)
    }
}

/// Day `ordinal` of `year`, clamped to the year's length.
fn anchored(year: i32, ordinal: u32) -> DomainResult<NaiveDate> {
    let days = if NaiveDate::from_yo_opt(year, 366).is_some() { 366 } else { 365 };
    NaiveDate::from_yo_opt(year, ordinal.min(days))
        .ok_or_else(|| DomainError::timeline(format!("year {year} out of range")))
}

fn push_bounded(out: &mut Vec<Period>, period: Period) -> DomainResult<()> {
    if out.len() >= MAX_PERIODS {
        return Err(DomainError::timeline(format!(
            "expands to more than {MAX_PERIODS} periods"
        )));
    }
    out.push(period);
    Ok(())
}
