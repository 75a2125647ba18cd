use crate::model::{DAY_MS, Ms};

/// Live reservations held in memory at once.
pub const MAX_RESERVATIONS: usize = 1_000_000;

/// Slots in a generated grid (one year at 30 minutes is 17 520).
pub const MAX_GRID_SLOTS: usize = 1_000_000;

/// Widest raw slot listing window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// Longest single reservation.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
