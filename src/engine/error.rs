use ulid::Ulid;

use crate::model::{format_hhmm, AppointmentStatus, AppointmentSummary, Span};

/// Why a requested interval cannot be booked regardless of other appointments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    DayClosed,
    OutsideWorkingHours,
    /// The break (minutes of day) the request touches.
    InBreak(Span),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::DayClosed => write!(f, "day is closed"),
            UnavailableReason::OutsideWorkingHours => write!(f, "outside working hours"),
            UnavailableReason::InBreak(b) => write!(
                f,
                "overlaps break {}-{}",
                format_hhmm(b.start),
                format_hhmm(b.end)
            ),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The provider exists but has never published a schedule.
    NoSchedule(Ulid),
    InvalidSchedule(String),
    InvalidInput(String),
    Unavailable {
        requested: Span,
        reason: UnavailableReason,
    },
    SlotConflict {
        requested: Span,
        conflicting: AppointmentSummary,
    },
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    LimitExceeded(&'static str),
    /// The store could not durably commit. Safe to re-run the check, not to assume success.
    TransientStore(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoSchedule(id) => write!(f, "no schedule for provider: {id}"),
            EngineError::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Unavailable { requested, reason } => write!(
                f,
                "interval [{}, {}) not bookable: {reason}",
                requested.start, requested.end
            ),
            EngineError::SlotConflict {
                requested,
                conflicting,
            } => write!(
                f,
                "interval [{}, {}) conflicts with {} appointment {} ({}) at [{}, {})",
                requested.start,
                requested.end,
                conflicting.status,
                conflicting.id,
                conflicting.service_name,
                conflicting.start,
                conflicting.end
            ),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot go from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::TransientStore(e) => write!(f, "store error (retryable): {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
