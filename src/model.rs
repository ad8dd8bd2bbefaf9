use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every absolute instant.
pub type Ms = i64;

/// Minutes since local midnight in the provider's fixed timezone.
/// May fall outside `0..1440` when an appointment crosses midnight.
pub type Minute = i64;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)`. The unit (ms or minutes) is fixed by context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for values coming from outside the engine.
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// The one overlap predicate: `[a,b)` and `[c,e)` intersect iff `a < e && b > c`.
    /// Touching endpoints are not an overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Wall-clock helpers ───────────────────────────────────────────

/// Parse `HH:MM` (24-hour). `24:00` is accepted so a window can run to midnight.
pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(minute: Minute) -> String {
    format!("{:02}:{:02}", minute.div_euclid(60), minute.rem_euclid(60))
}

/// Instant of local midnight for `date` in a zone `utc_offset_minutes` east of UTC.
pub fn day_start_ms(date: NaiveDate, utc_offset_minutes: i32) -> Ms {
    let midnight_utc = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    midnight_utc - Ms::from(utc_offset_minutes) * MS_PER_MINUTE
}

/// The local `[midnight, next midnight)` range of `date`, in ms.
pub fn day_span(date: NaiveDate, utc_offset_minutes: i32) -> Span {
    let start = day_start_ms(date, utc_offset_minutes);
    Span::new(start, start + MINUTES_PER_DAY * MS_PER_MINUTE)
}

/// Local calendar date of an instant.
pub fn local_date(t: Ms, utc_offset_minutes: i32) -> Option<NaiveDate> {
    let local = t + Ms::from(utc_offset_minutes) * MS_PER_MINUTE;
    DateTime::from_timestamp_millis(local).map(|dt| dt.date_naive())
}

// ── Schedule ─────────────────────────────────────────────────────

/// A break inside a working day, in minutes of day. Validated on write, so it is
/// kept as raw bounds rather than a `Span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakTime {
    pub start: Minute,
    pub end: Minute,
}

/// One weekday entry of a weekly schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub weekday: Weekday,
    pub active: bool,
    pub start: Option<Minute>,
    pub end: Option<Minute>,
    /// Unsorted, possibly overlapping.
    pub breaks: Vec<BreakTime>,
}

impl DayHours {
    /// The active window, or `None` if the day is closed.
    pub fn window(&self) -> Option<Span> {
        if !self.active {
            return None;
        }
        Span::try_new(self.start?, self.end?)
    }

    pub fn break_spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.breaks.iter().filter_map(|b| Span::try_new(b.start, b.end))
    }
}

/// A provider's weekly template. Days not listed are closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub days: Vec<DayHours>,
    /// Step, in minutes, between bookable start times.
    pub slot_granularity: u32,
    /// Fixed offset east of UTC used to resolve weekdays and wall-clock times.
    pub utc_offset_minutes: i32,
}

impl Schedule {
    pub fn day(&self, weekday: Weekday) -> Option<&DayHours> {
        self.days.iter().find(|d| d.weekday == weekday)
    }
}

// ── Services and appointments ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    /// Minor currency units. Not used by the engine.
    pub price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Cancelled appointments never occupy time.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    /// `cancelled` is terminal; a confirmed appointment cannot go back to pending.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    /// Copied from the service at creation time.
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    pub service_id: Option<Ulid>,
    pub service_name: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub idempotency_key: Option<String>,
}

impl Appointment {
    /// Occupied interval `[start, start + duration)`, in ms.
    pub fn span(&self) -> Span {
        Span::new(
            self.start,
            self.start + Ms::from(self.duration_minutes) * MS_PER_MINUTE,
        )
    }

    pub fn summary(&self) -> AppointmentSummary {
        let span = self.span();
        AppointmentSummary {
            id: self.id,
            start: span.start,
            end: span.end,
            status: self.status,
            service_name: self.service_name.clone(),
        }
    }
}

// ── Per-provider state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: Option<String>,
    pub schedule: Option<Schedule>,
    pub services: HashMap<Ulid, Service>,
    /// All appointments including cancelled ones, sorted by `start`.
    pub appointments: Vec<Appointment>,
    /// Idempotency key → appointment id.
    pub idempotency: HashMap<String, Ulid>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            schedule: None,
            services: HashMap::new(),
            appointments: Vec::new(),
            idempotency: HashMap::new(),
        }
    }

    /// Insert appointment maintaining sort order by start.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appt.start);
        if let Some(key) = &appt.idempotency_key {
            self.idempotency.insert(key.clone(), appt.id);
        }
        self.appointments.insert(pos, appt);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        let appt = self.appointments.remove(pos);
        if let Some(key) = &appt.idempotency_key {
            self.idempotency.remove(key);
        }
        Some(appt)
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Non-cancelled appointments whose occupied interval overlaps `query` (ms).
    /// Binary search skips everything starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self.appointments.partition_point(|a| a.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.status.is_active() && a.span().overlaps(query))
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: Option<String>,
    },
    ProviderDeleted {
        id: Ulid,
    },
    ScheduleSet {
        provider_id: Ulid,
        schedule: Schedule,
    },
    ServiceUpserted {
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price: i64,
    },
    ServiceRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentDeleted {
        id: Ulid,
        provider_id: Ulid,
    },
}

impl Event {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::ProviderCreated { id, .. } | Event::ProviderDeleted { id } => *id,
            Event::AppointmentCreated { appointment } => appointment.provider_id,
            Event::ScheduleSet { provider_id, .. }
            | Event::ServiceUpserted { provider_id, .. }
            | Event::ServiceRemoved { provider_id, .. }
            | Event::AppointmentRescheduled { provider_id, .. }
            | Event::AppointmentStatusChanged { provider_id, .. }
            | Event::AppointmentDeleted { provider_id, .. } => *provider_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProviderCreated { .. } => "provider_created",
            Event::ProviderDeleted { .. } => "provider_deleted",
            Event::ScheduleSet { .. } => "schedule_set",
            Event::ServiceUpserted { .. } => "service_upserted",
            Event::ServiceRemoved { .. } => "service_removed",
            Event::AppointmentCreated { .. } => "appointment_created",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::AppointmentDeleted { .. } => "appointment_deleted",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub has_schedule: bool,
    pub service_count: usize,
}

/// What a conflict error reports about the blocking appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentSummary {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
    pub service_name: String,
}

/// Bookable start times for one day and one duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSlots {
    /// The weekday is inactive or absent from the schedule.
    pub closed: bool,
    /// Ascending minute-of-day values.
    pub free_starts: Vec<Minute>,
}

impl FreeSlots {
    pub fn closed() -> Self {
        Self {
            closed: true,
            free_starts: Vec::new(),
        }
    }

    pub fn has_availability(&self) -> bool {
        !self.free_starts.is_empty()
    }
}

/// Fixed-resolution calendar view: every start that is *not* bookable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisabledMask {
    pub closed: bool,
    /// `HH:MM` strings, ascending.
    pub disabled_hours: Vec<String>,
    pub has_available_time: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSummary {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    /// `(service name, bookings)` sorted by count descending, then name.
    pub by_service: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, minutes: u32, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            provider_id: Ulid::nil(),
            start,
            duration_minutes: minutes,
            status,
            service_id: None,
            service_name: "Cut".into(),
            customer_name: None,
            customer_phone: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn span_try_new_rejects_empty() {
        assert!(Span::try_new(10, 10).is_none());
        assert!(Span::try_new(10, 5).is_none());
        assert_eq!(Span::try_new(5, 10), Some(Span::new(5, 10)));
    }

    #[test]
    fn hhmm_parse() {
        assert_eq!(parse_hhmm("09:00"), Some(540));
        assert_eq!(parse_hhmm("9:30"), Some(570));
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:01"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("1200"), None);
        assert_eq!(parse_hhmm("ab:cd"), None);
    }

    #[test]
    fn hhmm_format() {
        assert_eq!(format_hhmm(0), "00:00");
        assert_eq!(format_hhmm(545), "09:05");
        assert_eq!(format_hhmm(1430), "23:50");
    }

    #[test]
    fn day_start_respects_offset() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let utc = day_start_ms(date, 0);
        assert_eq!(utc, 1_704_067_200_000);
        // UTC+03:30 midnight is 3.5h earlier in UTC.
        assert_eq!(day_start_ms(date, 210), utc - 210 * MS_PER_MINUTE);
        assert_eq!(day_span(date, 0).len(), MINUTES_PER_DAY * MS_PER_MINUTE);
    }

    #[test]
    fn local_date_roundtrips_day_start() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        for offset in [-600, 0, 210, 840] {
            let start = day_start_ms(date, offset);
            assert_eq!(local_date(start, offset), Some(date));
            assert_eq!(local_date(start - 1, offset), date.pred_opt());
        }
    }

    #[test]
    fn closed_day_has_no_window() {
        let day = DayHours {
            weekday: Weekday::Mon,
            active: false,
            start: Some(540),
            end: Some(1020),
            breaks: vec![],
        };
        assert!(day.window().is_none());
        let open = DayHours { active: true, ..day };
        assert_eq!(open.window(), Some(Span::new(540, 1020)));
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn status_from_str() {
        assert_eq!("Confirmed".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Confirmed));
        assert_eq!("canceled".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Cancelled));
        assert!("done".parse::<AppointmentStatus>().is_err());
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_appointment(appt(300, 1, AppointmentStatus::Pending));
        ps.insert_appointment(appt(100, 1, AppointmentStatus::Pending));
        ps.insert_appointment(appt(200, 1, AppointmentStatus::Pending));
        let starts: Vec<Ms> = ps.appointments.iter().map(|a| a.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn active_overlapping_skips_cancelled_and_adjacent() {
        let m = MS_PER_MINUTE;
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_appointment(appt(0, 30, AppointmentStatus::Confirmed)); // [0, 30m)
        ps.insert_appointment(appt(30 * m, 30, AppointmentStatus::Cancelled));
        ps.insert_appointment(appt(45 * m, 30, AppointmentStatus::Pending));
        ps.insert_appointment(appt(120 * m, 30, AppointmentStatus::Pending));

        let query = Span::new(30 * m, 60 * m);
        let hits: Vec<Ms> = ps.active_overlapping(&query).map(|a| a.start).collect();
        assert_eq!(hits, vec![45 * m]);
    }

    #[test]
    fn active_overlapping_long_earlier_appointment() {
        let m = MS_PER_MINUTE;
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_appointment(appt(0, 240, AppointmentStatus::Pending));
        ps.insert_appointment(appt(10 * m, 5, AppointmentStatus::Pending));
        let query = Span::new(100 * m, 110 * m);
        assert_eq!(ps.active_overlapping(&query).count(), 1);
    }

    #[test]
    fn remove_appointment_drops_idempotency_key() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        let mut a = appt(0, 30, AppointmentStatus::Pending);
        a.idempotency_key = Some("req-1".into());
        let id = a.id;
        ps.insert_appointment(a);
        assert_eq!(ps.idempotency.get("req-1"), Some(&id));
        assert!(ps.remove_appointment(id).is_some());
        assert!(ps.idempotency.is_empty());
        assert!(ps.remove_appointment(id).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleSet {
            provider_id: Ulid::new(),
            schedule: Schedule {
                days: vec![DayHours {
                    weekday: Weekday::Tue,
                    active: true,
                    start: Some(540),
                    end: Some(1020),
                    breaks: vec![BreakTime { start: 720, end: 780 }],
                }],
                slot_granularity: 30,
                utc_offset_minutes: 210,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
