use chrono::{Duration, NaiveDateTime};

use super::setup::TimeInput;

// ---------------------------------------------------------------------------
// TimeWindow – the [start, stop] interval rows are selected by
// ---------------------------------------------------------------------------

/// A closed time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, stop: NaiveDateTime) -> Self {
        TimeWindow { start, stop }
    }

    /// Window for a caller-supplied pair of optional bounds.
    ///
    /// Missing bounds come from `fallback`. A bare date as `start` selects
    /// that whole day and overrides `stop`.
    pub fn resolve(
        start: Option<TimeInput>,
        stop: Option<TimeInput>,
        fallback: TimeWindow,
    ) -> Self {
        if let Some(TimeInput::Date(day)) = start {
            let start = TimeInput::Date(day).to_datetime();
            log::debug!("start is a date, selecting all spectra of {day}");
            return TimeWindow::new(start, start + Duration::days(1));
        }
        TimeWindow {
            start: start.map(TimeInput::to_datetime).unwrap_or(fallback.start),
            stop: stop.map(TimeInput::to_datetime).unwrap_or(fallback.stop),
        }
    }

    /// `start <= t <= stop`; used to select rows.
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t <= self.stop
    }

    /// `start < t < stop`; used to accept files.
    pub fn contains_strictly(&self, t: NaiveDateTime) -> bool {
        self.start < t && t < self.stop
    }
}

/// Indices of the timestamps that fall inside `window` (inclusive).
pub fn window_indices(times: &[NaiveDateTime], window: &TimeWindow) -> Vec<usize> {
    times
        .iter()
        .enumerate()
        .filter(|(_, t)| window.contains(**t))
        .map(|(i, _)| i)
        .collect()
}

/// Whether any timestamp lies strictly inside `window`.
pub fn any_strictly_inside(times: &[NaiveDateTime], window: &TimeWindow) -> bool {
    times.iter().any(|t| window.contains_strictly(*t))
}
