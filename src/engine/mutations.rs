use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

use super::availability::check_fits;
use super::conflict::{check_no_conflict, validate_duration, validate_start};
use super::{unmap_provider, Engine, EngineError, UnavailableReason, WalCommand};

/// A booking request as it reaches the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    /// Client-chosen retry key, unique per provider.
    pub idempotency_key: Option<String>,
}

/// Reject malformed schedules at write time so readers never see them.
pub fn validate_schedule(schedule: &Schedule) -> Result<(), EngineError> {
    if schedule.slot_granularity == 0 || schedule.slot_granularity > MAX_SLOT_GRANULARITY {
        return Err(EngineError::InvalidSchedule(format!(
            "slot granularity must be between 1 and {MAX_SLOT_GRANULARITY} minutes"
        )));
    }
    if schedule.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::InvalidSchedule("utc offset out of range".into()));
    }
    let mut seen = HashSet::new();
    for day in &schedule.days {
        if !seen.insert(day.weekday) {
            return Err(EngineError::InvalidSchedule(format!(
                "{} listed more than once",
                day.weekday
            )));
        }
        if day.breaks.len() > MAX_BREAKS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many breaks in a day"));
        }
        let in_day = |m: Minute| (0..=MINUTES_PER_DAY).contains(&m);
        if day.active {
            let (Some(start), Some(end)) = (day.start, day.end) else {
                return Err(EngineError::InvalidSchedule(format!(
                    "{}: active day needs start and end time",
                    day.weekday
                )));
            };
            if !in_day(start) || !in_day(end) || start >= end {
                return Err(EngineError::InvalidSchedule(format!(
                    "{}: start {} must be before end {}",
                    day.weekday,
                    format_hhmm(start),
                    format_hhmm(end)
                )));
            }
        }
        for b in &day.breaks {
            if !in_day(b.start) || !in_day(b.end) || b.start >= b.end {
                return Err(EngineError::InvalidSchedule(format!(
                    "{}: break {}-{} is malformed",
                    day.weekday,
                    format_hhmm(b.start),
                    format_hhmm(b.end)
                )));
            }
        }
    }
    Ok(())
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    pub async fn create_provider(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if let Some(ref n) = name {
            check_name(n, "provider name too long")?;
        }
        let _gate = self.providers_gate.read().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ProviderState::new(id, name))));
        self.notify.send(id, &event);
        tracing::info!(provider = %id, "provider created");
        Ok(())
    }

    /// Removes the provider with its schedule, services and appointments.
    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.providers_gate.read().await;
        let guard = self.write_provider(&id).await?;

        let event = Event::ProviderDeleted { id };
        self.wal_append(&event).await?;
        unmap_provider(&guard, &self.entity_to_provider);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!(provider = %id, "provider deleted");
        Ok(())
    }

    /// Full replace. Existing appointments are kept even if they no longer fit.
    pub async fn set_schedule(&self, provider_id: Ulid, schedule: Schedule) -> Result<(), EngineError> {
        validate_schedule(&schedule)?;
        let mut guard = self.write_provider(&provider_id).await?;
        let event = Event::ScheduleSet { provider_id, schedule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn upsert_service(
        &self,
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price: i64,
    ) -> Result<(), EngineError> {
        check_name(&name, "service name too long")?;
        validate_duration(duration_minutes)?;
        let mut guard = self.write_provider(&provider_id).await?;
        let known = guard.services.contains_key(&id);
        if !known && guard.services.len() >= MAX_SERVICES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many services on provider"));
        }
        let claimed = self.claim_id(id, provider_id, known)?;

        let event = Event::ServiceUpserted {
            id,
            provider_id,
            name,
            duration_minutes,
            price,
        };
        self.persist_claimed(&mut guard, &event, id, claimed).await
    }

    /// Appointments keep their own copy of the duration, so nothing else changes.
    pub async fn remove_service(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let provider_id = guard.id;
        let event = Event::ServiceRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Validate, check and insert as one step per provider.
    ///
    /// The provider's write lock is held from the idempotency lookup until the WAL
    /// has accepted the event, so two overlapping requests can never both pass the
    /// conflict check. A request whose idempotency key was already used returns the
    /// appointment created the first time, whatever its current status.
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        validate_start(req.start)?;
        if let Some(ref n) = req.customer_name {
            check_name(n, "customer name too long")?;
        }
        if req.customer_phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
            return Err(EngineError::LimitExceeded("customer phone too long"));
        }
        if req
            .idempotency_key
            .as_ref()
            .is_some_and(|k| k.is_empty() || k.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(EngineError::InvalidInput(
                "idempotency key must be 1 to 128 bytes".into(),
            ));
        }

        let mut guard = self.write_provider(&req.provider_id).await?;

        if let Some(existing) = req
            .idempotency_key
            .as_ref()
            .and_then(|k| guard.idempotency.get(k))
            .and_then(|id| guard.appointment(*id))
        {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "replayed").increment(1);
            tracing::debug!(appointment = %existing.id, "idempotent replay");
            return Ok(existing.clone());
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many appointments on provider"));
        }

        let service = guard
            .services
            .get(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let appointment = Appointment {
            id: req.id,
            provider_id: req.provider_id,
            start: req.start,
            duration_minutes: service.duration_minutes,
            status: AppointmentStatus::Pending,
            service_id: Some(service.id),
            service_name: service.name.clone(),
            customer_name: req.customer_name,
            customer_phone: req.customer_phone,
            idempotency_key: req.idempotency_key,
        };
        let span = appointment.span();

        check_bookable(&guard, &span, None).inspect_err(record_rejection)?;
        let claimed = self.claim_id(appointment.id, appointment.provider_id, false)?;

        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        self.persist_claimed(&mut guard, &event, appointment.id, claimed)
            .await?;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "created").increment(1);
        tracing::info!(
            provider = %appointment.provider_id,
            appointment = %appointment.id,
            start = appointment.start,
            minutes = appointment.duration_minutes,
            "appointment created"
        );
        Ok(appointment)
    }

    /// Move a live appointment. Same checks as creation, ignoring itself.
    pub async fn reschedule_appointment(&self, id: Ulid, start: Ms) -> Result<Appointment, EngineError> {
        validate_start(start)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.is_active() {
            return Err(EngineError::InvalidInput(
                "cancelled appointments cannot be rescheduled".into(),
            ));
        }
        let moved = Appointment {
            start,
            ..current.clone()
        };

        check_bookable(&guard, &moved.span(), Some(id))
            .inspect_err(record_rejection)?;

        let event = Event::AppointmentRescheduled {
            id,
            provider_id: guard.id,
            start,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(appointment = %id, start, "appointment rescheduled");
        Ok(moved)
    }

    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }
        let updated = Appointment {
            status,
            ..current.clone()
        };

        let event = Event::AppointmentStatusChanged {
            id,
            provider_id: guard.id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(appointment = %id, %status, "appointment status changed");
        Ok(updated)
    }

    /// Confirmed appointments must be cancelled before they can be deleted.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if current.status == AppointmentStatus::Confirmed {
            return Err(EngineError::InvalidInput(
                "confirmed appointments must be cancelled before deletion".into(),
            ));
        }
        let provider_id = guard.id;
        let event = Event::AppointmentDeleted { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Reserves `id` for `provider_id` in the reverse index. Ids are unique
    /// across the tenant, whatever kind of entity holds them; `owned` lets an
    /// entity of the calling kind keep its own id. The caller holds the
    /// provider's write lock, and the entry lock makes the check and the
    /// reservation one step. `Ok(true)` means the reservation is new.
    fn claim_id(&self, id: Ulid, provider_id: Ulid, owned: bool) -> Result<bool, EngineError> {
        match self.entity_to_provider.entry(id) {
            Entry::Occupied(owner) if owned && *owner.get() == provider_id => Ok(false),
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(provider_id);
                Ok(true)
            }
        }
    }

    /// `persist_and_apply` for an event that introduces `id`; a new
    /// reservation is released again when the write fails.
    async fn persist_claimed(
        &self,
        ps: &mut ProviderState,
        event: &Event,
        id: Ulid,
        claimed: bool,
    ) -> Result<(), EngineError> {
        let result = self.persist_and_apply(ps, event).await;
        if result.is_err() && claimed {
            self.entity_to_provider.remove(&id);
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Every provider stays read-locked until the rewrite is in place, so no event
    /// can land in the old log after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.providers_gate.write().await;
        let providers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(providers.len());
        for ps in providers {
            guards.push(ps.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ProviderCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            if let Some(schedule) = &guard.schedule {
                events.push(Event::ScheduleSet {
                    provider_id: guard.id,
                    schedule: schedule.clone(),
                });
            }
            for service in guard.services.values() {
                events.push(Event::ServiceUpserted {
                    id: service.id,
                    provider_id: service.provider_id,
                    name: service.name.clone(),
                    duration_minutes: service.duration_minutes,
                    price: service.price,
                });
            }
            for appointment in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    appointment: appointment.clone(),
                });
            }
        }
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(e.to_string()))?;
        tracing::debug!(providers = guards.len(), events = event_count, "WAL compacted");
        Ok(())
    }
}

fn check_bookable(ps: &ProviderState, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    let schedule = ps.schedule.as_ref().ok_or(EngineError::NoSchedule(ps.id))?;
    check_fits(schedule, span.start, (span.len() / MS_PER_MINUTE) as u32).map_err(|reason| {
        EngineError::Unavailable {
            requested: *span,
            reason,
        }
    })?;
    check_no_conflict(ps, span, exclude)
}

fn record_rejection(err: &EngineError) {
    match err {
        EngineError::SlotConflict {
            requested,
            conflicting,
        } => {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "conflict").increment(1);
            tracing::debug!(
                start = requested.start,
                end = requested.end,
                blocking = %conflicting.id,
                "booking conflict"
            );
        }
        EngineError::Unavailable { requested, reason } => {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "unavailable").increment(1);
            let reason_label = match reason {
                UnavailableReason::DayClosed => "day_closed",
                UnavailableReason::OutsideWorkingHours => "outside_hours",
                UnavailableReason::InBreak(_) => "in_break",
            };
            tracing::debug!(start = requested.start, reason = reason_label, "booking rejected");
        }
        _ => {}
    }
}
