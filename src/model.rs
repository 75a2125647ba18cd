use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type CustomerId = u64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Closed-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Returns true if `self` fully contains `other`. Both bounds inclusive,
    /// so a span contains itself.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Parameters the slot grid is generated from. Persisted so a restart
/// replays the same grid instead of rebuilding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub horizon: Span,
    pub slot_len: Ms,
    pub capacity: u32,
}

impl GridSpec {
    pub fn slot_count(&self) -> usize {
        let len = self.horizon.duration_ms();
        (len / self.slot_len + i64::from(len % self.slot_len != 0)) as usize
    }
}

/// One capacity bucket of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: u32,
    pub span: Span,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Unconfirmed,
    Confirmed,
    /// Tombstone left on a record that was removed while another task
    /// waited on its lock.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub customer_id: CustomerId,
    pub span: Span,
    pub participants: u32,
    pub status: Status,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == Status::Confirmed
    }
}

/// Who is asking. Admins bypass ownership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Customer(CustomerId),
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

/// Partial update of a reservation. `None` means the field was not supplied
/// and keeps its current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub participants: Option<u32>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.participants.is_none()
    }

    /// Resolve the patch against the current record: `(start, end, participants)`.
    pub fn resolve(&self, current: &Reservation) -> (Ms, Ms, u32) {
        (
            self.start.unwrap_or(current.span.start),
            self.end.unwrap_or(current.span.end),
            self.participants.unwrap_or(current.participants),
        )
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GridGenerated {
        spec: GridSpec,
    },
    /// Full capacity snapshot written by compaction.
    SlotCapacities {
        remaining: Vec<u32>,
    },
    ReservationCreated {
        id: Ulid,
        customer_id: CustomerId,
        span: Span,
        participants: u32,
    },
    ReservationEdited {
        id: Ulid,
        span: Span,
        participants: u32,
    },
    /// Slots `[first_slot, first_slot + slot_count)` each lose `participants`.
    ReservationConfirmed {
        id: Ulid,
        first_slot: u32,
        slot_count: u32,
        participants: u32,
    },
    ReservationDeleted {
        id: Ulid,
    },
    /// Reservation snapshot written by compaction; never touches capacity.
    ReservationRestored {
        reservation: Reservation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableSlot {
    pub start: Ms,
    pub end: Ms,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub customer_id: CustomerId,
    pub start: Ms,
    pub end: Ms,
    pub participants: u32,
}

impl From<&Reservation> for ReservationInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            customer_id: r.customer_id,
            start: r.span.start,
            end: r.span.end,
            participants: r.participants,
        }
    }
}
