use chrono::{Datelike, NaiveDate};

use crate::model::*;

use super::conflict::overlaps_any;
use super::error::UnavailableReason;
use super::slots::slots;

// ── Schedule resolution ───────────────────────────────────────────

/// The weekday entry governing `date`, or `None` if that weekday is closed.
///
/// `date` is already a local calendar date in the schedule's fixed offset, so the
/// weekday needs no further timezone handling.
pub fn resolve_day(schedule: &Schedule, date: NaiveDate) -> Option<&DayHours> {
    schedule
        .day(date.weekday())
        .filter(|d| d.window().is_some())
}

// ── Window and break filtering ────────────────────────────────────

/// Admits a candidate interval only if it sits entirely inside the active window
/// and touches no break. All values are minutes of day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalFilter {
    window: Span,
    breaks: Vec<Span>,
}

impl IntervalFilter {
    pub fn for_day(day: &DayHours) -> Option<Self> {
        Some(Self {
            window: day.window()?,
            breaks: day.break_spans().collect(),
        })
    }

    pub fn window(&self) -> Span {
        self.window
    }

    /// Breaks are tested one by one and the first hit wins. Overlapping breaks
    /// need no merging: a candidate touching their union touches one of them.
    pub fn check(&self, candidate: &Span) -> Result<(), UnavailableReason> {
        if !self.window.contains_span(candidate) {
            return Err(UnavailableReason::OutsideWorkingHours);
        }
        match self.breaks.iter().find(|b| b.overlaps(candidate)) {
            Some(b) => Err(UnavailableReason::InBreak(*b)),
            None => Ok(()),
        }
    }

    pub fn admits(&self, candidate: &Span) -> bool {
        self.check(candidate).is_ok()
    }
}

/// Does an absolute `[start, start + duration)` fit the schedule of its local day?
/// Returns the occupied span as minutes of that day on success.
pub fn check_fits(schedule: &Schedule, start: Ms, duration: u32) -> Result<Span, UnavailableReason> {
    let date = local_date(start, schedule.utc_offset_minutes).ok_or(UnavailableReason::DayClosed)?;
    let filter = resolve_day(schedule, date)
        .and_then(IntervalFilter::for_day)
        .ok_or(UnavailableReason::DayClosed)?;
    let offset = (start - day_start_ms(date, schedule.utc_offset_minutes)) / MS_PER_MINUTE;
    let candidate = Span::new(offset, offset + Minute::from(duration));
    filter.check(&candidate)?;
    Ok(candidate)
}

// ── Day-level pipelines ──────────────────────────────────────────

/// Bookable starts at `step` granularity for a `duration`-minute appointment,
/// given the day's busy spans (minutes of day, non-cancelled appointments).
pub fn free_starts(
    filter: &IntervalFilter,
    busy: &[Span],
    step: Minute,
    duration: Minute,
) -> Vec<Minute> {
    let window = filter.window();
    slots(window.start, window.end, step)
        .filter(|&t| {
            let candidate = Span::new(t, t + duration);
            filter.admits(&candidate) && !overlaps_any(busy, &candidate)
        })
        .collect()
}

/// Whole-day view at `granularity`: every start in `[00:00, 24:00)` that cannot
/// take a `duration`-minute appointment. A closed day (`filter == None`) disables
/// everything.
pub fn disabled_mask(
    filter: Option<&IntervalFilter>,
    busy: &[Span],
    granularity: Minute,
    duration: Minute,
) -> DisabledMask {
    let mut disabled_hours = Vec::new();
    let mut has_available_time = false;

    for t in slots(0, MINUTES_PER_DAY, granularity) {
        let candidate = Span::new(t, t + duration);
        let bookable = filter
            .is_some_and(|f| f.admits(&candidate) && !overlaps_any(busy, &candidate));
        if bookable {
            has_available_time = true;
        } else {
            disabled_hours.push(format_hhmm(t));
        }
    }

    DisabledMask {
        closed: filter.is_none(),
        disabled_hours,
        has_available_time,
    }
}
