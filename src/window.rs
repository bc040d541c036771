//! Weekly lookback window resolution.
//!
//! A run is parameterized by a logical reference date supplied by the
//! scheduler; the window it consolidates is always the closed interval
//! `[reference - 7 days, reference - 1 day]`.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATESTR_FORMAT: &str = "%Y-%m-%d";
pub const WINDOW_DAYS: u64 = 7;

/// Closed interval of calendar dates selecting the prior week's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("reference date {0} underflows the supported calendar range")]
    ReferenceOutOfRange(NaiveDate),
}

/// Resolves the 7-day lookback window for a logical reference date.
pub fn resolve_window(reference: NaiveDate) -> Result<DateWindow, WindowError> {
    let start = reference
        .checked_sub_days(Days::new(WINDOW_DAYS))
        .ok_or(WindowError::ReferenceOutOfRange(reference))?;
    let end = reference
        .checked_sub_days(Days::new(1))
        .ok_or(WindowError::ReferenceOutOfRange(reference))?;

    Ok(DateWindow { start, end })
}

impl DateWindow {
    /// Ordered calendar dates of the window, inclusive at both ends.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |date| *date <= end)
    }

    /// Ordered partition key strings (`%Y-%m-%d`) of the window.
    pub fn datestrs(&self) -> Vec<String> {
        self.dates()
            .map(|date| date.format(DATESTR_FORMAT).to_string())
            .collect()
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Partition-key membership. Malformed and non-canonical keys are
    /// outside every window: a key must round-trip to its own `%Y-%m-%d`
    /// rendering, otherwise an unpadded key like `2024-6-3` would pass the
    /// writer guard while naming a partition the replace loop never deletes.
    pub fn contains_datestr(&self, datestr: &str) -> bool {
        match NaiveDate::parse_from_str(datestr, DATESTR_FORMAT) {
            Ok(date) => {
                date.format(DATESTR_FORMAT).to_string() == datestr && self.contains_date(date)
            }
            Err(_) => false,
        }
    }
}
