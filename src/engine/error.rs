use thiserror::Error;
use ulid::Ulid;

use crate::model::{CustomerId, Ms, Span};

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SchedulingWindow,
    Capacity,
    Authorization,
    Conflict,
    NotFound,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reservations must start at or after {earliest} (requested {requested})")]
    SchedulingWindow { requested: Ms, earliest: Ms },

    #[error("slot [{}, {}) has {remaining} places left, {requested} requested", .slot.start, .slot.end)]
    CapacityExceeded {
        slot: Span,
        remaining: u32,
        requested: u32,
    },

    #[error("reservation {id} does not belong to customer {customer_id}")]
    NotOwner { id: Ulid, customer_id: CustomerId },

    #[error("admin privileges required")]
    AdminRequired,

    #[error("reservation {0} is already confirmed")]
    AlreadyConfirmed(Ulid),

    #[error("reservation not found: {0}")]
    NotFound(Ulid),

    #[error("invalid time range [{start}, {end})")]
    InvalidSpan { start: Ms, end: Ms },

    #[error("participants must be at least 1")]
    InvalidParticipants,

    #[error("nothing to update")]
    EmptyPatch,

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SchedulingWindow { .. } => ErrorKind::SchedulingWindow,
            EngineError::CapacityExceeded { .. } => ErrorKind::Capacity,
            EngineError::NotOwner { .. } | EngineError::AdminRequired => ErrorKind::Authorization,
            EngineError::AlreadyConfirmed(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidSpan { .. }
            | EngineError::InvalidParticipants
            | EngineError::EmptyPatch
            | EngineError::LimitExceeded(_) => ErrorKind::InvalidRequest,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::LimitExceeded(_) => "54000",
            other => match other.kind() {
                ErrorKind::SchedulingWindow | ErrorKind::InvalidRequest => "22023",
                ErrorKind::Capacity => "53400",
                ErrorKind::Authorization => "42501",
                ErrorKind::Conflict => "55000",
                ErrorKind::NotFound => "02000",
                ErrorKind::Internal => "58000",
            },
        }
    }
}
