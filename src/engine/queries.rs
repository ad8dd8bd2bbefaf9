use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{check_fits, disabled_mask, free_starts, resolve_day, IntervalFilter};
use super::conflict::{busy_minutes, first_conflict, validate_duration, validate_start};
use super::{Engine, EngineError};

/// How long the appointment being looked for is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDuration {
    /// Take the duration from one of the provider's services.
    Service(Ulid),
    Minutes(u32),
    /// `EngineConfig::default_mask_duration`.
    Default,
}

impl Engine {
    pub async fn load_schedule(&self, provider_id: Ulid) -> Result<Option<Schedule>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.schedule.clone())
    }

    pub async fn load_service(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
    ) -> Result<Option<Service>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.services.get(&service_id).cloned())
    }

    /// Non-cancelled appointments overlapping `range` (ms), by start.
    pub async fn load_appointments(
        &self,
        provider_id: Ulid,
        range: Span,
    ) -> Result<Vec<Appointment>, EngineError> {
        if range.len() > MAX_LIST_RANGE_DAYS * MINUTES_PER_DAY * MS_PER_MINUTE {
            return Err(EngineError::LimitExceeded("range too wide"));
        }
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        Ok(guard.active_overlapping(&range).cloned().collect())
    }

    /// Bookable starts on `date` at the schedule's slot granularity.
    pub async fn list_free_slots(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        duration: QueryDuration,
    ) -> Result<FreeSlots, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        let minutes = self.query_minutes(&guard, duration)?;
        let schedule = guard
            .schedule
            .as_ref()
            .ok_or(EngineError::NoSchedule(provider_id))?;

        let Some(filter) = resolve_day(schedule, date).and_then(IntervalFilter::for_day) else {
            return Ok(FreeSlots::closed());
        };
        let busy = day_busy(&guard, schedule, date);
        Ok(FreeSlots {
            closed: false,
            free_starts: free_starts(
                &filter,
                &busy,
                Minute::from(schedule.slot_granularity),
                Minute::from(minutes),
            ),
        })
    }

    /// Calendar view of `date` at the configured mask granularity.
    pub async fn disabled_mask(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        duration: QueryDuration,
    ) -> Result<DisabledMask, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        let minutes = self.query_minutes(&guard, duration)?;
        let schedule = guard
            .schedule
            .as_ref()
            .ok_or(EngineError::NoSchedule(provider_id))?;

        let filter = resolve_day(schedule, date).and_then(IntervalFilter::for_day);
        let busy = if filter.is_some() {
            day_busy(&guard, schedule, date)
        } else {
            Vec::new()
        };
        Ok(disabled_mask(
            filter.as_ref(),
            &busy,
            self.config.mask_granularity,
            Minute::from(minutes),
        ))
    }

    /// Would `[start, start + minutes)` be accepted right now? Advisory only:
    /// nothing is reserved.
    pub async fn is_interval_free(
        &self,
        provider_id: Ulid,
        start: Ms,
        minutes: u32,
    ) -> Result<bool, EngineError> {
        validate_start(start)?;
        validate_duration(minutes)?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        let schedule = guard
            .schedule
            .as_ref()
            .ok_or(EngineError::NoSchedule(provider_id))?;
        if check_fits(schedule, start, minutes).is_err() {
            return Ok(false);
        }
        let span = Span::new(start, start + Ms::from(minutes) * MS_PER_MINUTE);
        Ok(first_conflict(&guard, &span, None).is_none())
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let providers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(providers.len());
        for ps in providers {
            let guard = ps.read().await;
            out.push(ProviderInfo {
                id: guard.id,
                name: guard.name.clone(),
                has_schedule: guard.schedule.is_some(),
                service_count: guard.services.len(),
            });
        }
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn list_services(&self, provider_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        let mut services: Vec<Service> = guard.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(services)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All appointments, cancelled included, sorted by start. With a date, only
    /// those touching that local day.
    pub async fn list_appointments(
        &self,
        provider_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        let Some(date) = date else {
            return Ok(guard.appointments.clone());
        };
        let offset = guard.schedule.as_ref().map_or(0, |s| s.utc_offset_minutes);
        let day = day_span(date, offset);
        Ok(guard
            .appointments
            .iter()
            .filter(|a| a.span().overlaps(&day))
            .cloned()
            .collect())
    }

    pub async fn appointment_summary(&self, provider_id: Ulid) -> Result<ProviderSummary, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;

        let mut summary = ProviderSummary {
            total: guard.appointments.len(),
            pending: 0,
            confirmed: 0,
            cancelled: 0,
            by_service: Vec::new(),
        };
        let mut by_service: HashMap<&str, usize> = HashMap::new();
        for a in &guard.appointments {
            match a.status {
                AppointmentStatus::Pending => summary.pending += 1,
                AppointmentStatus::Confirmed => summary.confirmed += 1,
                AppointmentStatus::Cancelled => summary.cancelled += 1,
            }
            *by_service.entry(a.service_name.as_str()).or_default() += 1;
        }
        summary.by_service = by_service
            .into_iter()
            .map(|(name, n)| (name.to_string(), n))
            .collect();
        summary
            .by_service
            .sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(summary)
    }

    fn query_minutes(&self, ps: &ProviderState, duration: QueryDuration) -> Result<u32, EngineError> {
        let minutes = match duration {
            QueryDuration::Service(id) => {
                ps.services
                    .get(&id)
                    .ok_or(EngineError::NotFound(id))?
                    .duration_minutes
            }
            QueryDuration::Minutes(m) => m,
            QueryDuration::Default => self.config.default_mask_duration,
        };
        validate_duration(minutes)?;
        Ok(minutes)
    }
}

/// Busy spans of `date` in minutes of day. Appointments reaching in from the
/// neighbouring days are included.
fn day_busy(ps: &ProviderState, schedule: &Schedule, date: NaiveDate) -> Vec<Span> {
    let day = day_span(date, schedule.utc_offset_minutes);
    busy_minutes(ps.active_overlapping(&day), day.start)
}
