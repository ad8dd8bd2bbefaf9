mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::{check_fits, disabled_mask, free_starts, resolve_day, IntervalFilter};
pub use conflict::{busy_minutes, first_conflict, overlaps_any};
pub use error::{EngineError, UnavailableReason};
pub use mutations::{validate_schedule, NewAppointment};
pub use queries::QueryDuration;
pub use slots::{slots, SlotIter};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have first; compaction must see every prior append.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// A failed batch is rolled back by the WAL, so none of its events can
/// resurface on replay after the callers were told it failed.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let events: Vec<Event> = batch.iter().map(|(event, _)| event.clone()).collect();
    wal.commit(&events)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's providers, schedules, services and appointments.
///
/// Each provider sits behind its own `RwLock`. Availability queries take the read
/// lock; every write, and in particular booking check-and-insert, holds the write
/// lock from validation until the WAL has durably accepted the event.
pub struct Engine {
    pub state: DashMap<Ulid, SharedProviderState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// Reverse lookup: service or appointment id → provider id
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    /// Shared by provider create/delete, exclusive during compaction.
    pub(super) providers_gate: RwLock<()>,
}

/// Apply an event directly to a ProviderState (no locking; caller holds the lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleSet { schedule, .. } => {
            ps.schedule = Some(schedule.clone());
        }
        Event::ServiceUpserted {
            id,
            provider_id,
            name,
            duration_minutes,
            price,
        } => {
            ps.services.insert(
                *id,
                Service {
                    id: *id,
                    provider_id: *provider_id,
                    name: name.clone(),
                    duration_minutes: *duration_minutes,
                    price: *price,
                },
            );
            entity_map.insert(*id, *provider_id);
        }
        Event::ServiceRemoved { id, .. } => {
            ps.services.remove(id);
            entity_map.remove(id);
        }
        Event::AppointmentCreated { appointment } => {
            entity_map.insert(appointment.id, appointment.provider_id);
            ps.insert_appointment(appointment.clone());
        }
        Event::AppointmentRescheduled { id, start, .. } => {
            if let Some(mut appt) = ps.remove_appointment(*id) {
                appt.start = *start;
                ps.insert_appointment(appt);
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appt) = ps.appointment_mut(*id) {
                appt.status = *status;
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            ps.remove_appointment(*id);
            entity_map.remove(id);
        }
        // ProviderCreated/Deleted are handled at the DashMap level, not here
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => {}
    }
}

/// Drop every reverse-index entry owned by a provider that is going away.
fn unmap_provider(ps: &ProviderState, entity_map: &DashMap<Ulid, Ulid>) {
    for id in ps.services.keys() {
        entity_map.remove(id);
    }
    for appt in &ps.appointments {
        entity_map.remove(&appt.id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            config,
            entity_to_provider: DashMap::new(),
            providers_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never block here: this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ProviderCreated { id, name } => {
                    let ps = ProviderState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::ProviderDeleted { id } => {
                    if let Some((_, ps)) = engine.state.remove(id)
                        && let Ok(guard) = ps.try_read()
                    {
                        unmap_provider(&guard, &engine.entity_to_provider);
                    }
                }
                other => {
                    let Some(ps) = engine.get_provider(&other.provider_id()) else {
                        tracing::warn!("replay: {} for unknown provider, skipped", other.kind());
                        continue;
                    };
                    if let Ok(mut guard) = ps.try_write() {
                        apply_to_provider(&mut guard, other, &engine.entity_to_provider);
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events into {} providers",
            events.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.entity_to_provider);
        self.notify.send(ps.id, event);
        Ok(())
    }

    /// Get a provider and acquire its write lock. Fails if the provider was deleted
    /// while we waited for the lock.
    pub(super) async fn write_provider(
        &self,
        provider_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let ps = self
            .get_provider(provider_id)
            .ok_or(EngineError::NotFound(*provider_id))?;
        let guard = ps.write_owned().await;
        if !self.state.contains_key(provider_id) {
            return Err(EngineError::NotFound(*provider_id));
        }
        Ok(guard)
    }

    /// Lookup entity → provider, get provider, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .get_provider_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.write_provider(&provider_id).await
    }
}
