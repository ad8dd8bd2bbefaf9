use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// True if `candidate` overlaps any span in `busy`.
pub fn overlaps_any(busy: &[Span], candidate: &Span) -> bool {
    busy.iter().any(|b| b.overlaps(candidate))
}

/// Occupied intervals of `appointments` as minutes relative to `day_start`.
/// Spans crossing midnight keep their out-of-day parts (negative or > 1440).
pub fn busy_minutes<'a>(
    appointments: impl IntoIterator<Item = &'a Appointment>,
    day_start: Ms,
) -> Vec<Span> {
    appointments
        .into_iter()
        .map(|a| {
            let span = a.span();
            let start = (span.start - day_start).div_euclid(MS_PER_MINUTE);
            let end = (span.end - day_start + MS_PER_MINUTE - 1).div_euclid(MS_PER_MINUTE);
            Span::new(start, end)
        })
        .collect()
}

/// Earliest-starting non-cancelled appointment overlapping `span` (ms), skipping `exclude`.
pub fn first_conflict<'a>(
    ps: &'a ProviderState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Appointment> {
    ps.active_overlapping(span)
        .find(|a| Some(a.id) != exclude)
}

pub(crate) fn check_no_conflict(
    ps: &ProviderState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(ps, span, exclude) {
        Some(blocking) => Err(EngineError::SlotConflict {
            requested: *span,
            conflicting: blocking.summary(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if start % MS_PER_MINUTE != 0 {
        return Err(EngineError::InvalidInput(
            "appointment start must be a whole minute".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::InvalidInput("duration must be positive".into()));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration longer than a day"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MS_PER_MINUTE;
    const BASE: Ms = 1_704_067_200_000; // 2024-01-01T00:00Z

    fn appt(start_min: Ms, minutes: u32, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            provider_id: Ulid::nil(),
            start: BASE + start_min * M,
            duration_minutes: minutes,
            status,
            service_id: None,
            service_name: "Consult".into(),
            customer_name: None,
            customer_phone: None,
            idempotency_key: None,
        }
    }

    fn state(appts: Vec<Appointment>) -> ProviderState {
        let mut ps = ProviderState::new(Ulid::new(), None);
        for a in appts {
            ps.insert_appointment(a);
        }
        ps
    }

    fn req(start_min: Ms, minutes: Ms) -> Span {
        Span::new(BASE + start_min * M, BASE + (start_min + minutes) * M)
    }

    #[test]
    fn adjacent_is_not_a_conflict() {
        let ps = state(vec![appt(540, 30, AppointmentStatus::Pending)]);
        assert!(check_no_conflict(&ps, &req(570, 30), None).is_ok());
        assert!(check_no_conflict(&ps, &req(510, 30), None).is_ok());
    }

    #[test]
    fn overlap_reports_blocking_appointment() {
        let blocker = appt(540, 60, AppointmentStatus::Confirmed);
        let blocker_id = blocker.id;
        let ps = state(vec![blocker]);
        match check_no_conflict(&ps, &req(570, 30), None) {
            Err(EngineError::SlotConflict { requested, conflicting }) => {
                assert_eq!(requested, req(570, 30));
                assert_eq!(conflicting.id, blocker_id);
                assert_eq!(conflicting.start, BASE + 540 * M);
                assert_eq!(conflicting.end, BASE + 600 * M);
            }
            other => panic!("expected SlotConflict, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_never_conflicts() {
        let ps = state(vec![appt(540, 60, AppointmentStatus::Cancelled)]);
        assert!(check_no_conflict(&ps, &req(540, 60), None).is_ok());
    }

    #[test]
    fn first_conflict_is_earliest() {
        let early = appt(540, 60, AppointmentStatus::Pending);
        let early_id = early.id;
        let ps = state(vec![appt(600, 60, AppointmentStatus::Pending), early]);
        let hit = first_conflict(&ps, &req(570, 60), None).unwrap();
        assert_eq!(hit.id, early_id);
    }

    #[test]
    fn excluded_appointment_is_ignored() {
        let own = appt(540, 60, AppointmentStatus::Pending);
        let own_id = own.id;
        let ps = state(vec![own]);
        assert!(check_no_conflict(&ps, &req(570, 60), Some(own_id)).is_ok());
        assert!(check_no_conflict(&ps, &req(570, 60), None).is_err());
    }

    #[test]
    fn busy_minutes_relative_to_day() {
        let appts = [appt(-30, 60, AppointmentStatus::Pending), appt(600, 45, AppointmentStatus::Pending)];
        let busy = busy_minutes(appts.iter(), BASE);
        assert_eq!(busy, vec![Span::new(-30, 30), Span::new(600, 645)]);
        assert!(overlaps_any(&busy, &Span::new(0, 10)));
        assert!(!overlaps_any(&busy, &Span::new(30, 600)));
    }

    #[test]
    fn start_validation() {
        assert!(validate_start(BASE).is_ok());
        assert!(matches!(validate_start(BASE + 1), Err(EngineError::InvalidInput(_))));
        assert!(matches!(validate_start(0), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn duration_validation() {
        assert!(validate_duration(30).is_ok());
        assert!(matches!(validate_duration(0), Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            validate_duration(MAX_DURATION_MINUTES + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
