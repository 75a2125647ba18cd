use crate::model::*;

use super::grid::SlotGrid;

// ── Availability ──────────────────────────────────────────────────

/// Slots open for booking inside `[window_start, window_end]`.
///
/// A slot qualifies when it starts at or after both `window_start` and
/// `earliest` (now + lead time), ends at or before `window_end`, and still
/// has capacity. Output keeps the grid's ascending start order.
pub fn available_slots(
    grid: &SlotGrid,
    window_start: Ms,
    window_end: Ms,
    earliest: Ms,
) -> Vec<AvailableSlot> {
    let from = window_start.max(earliest);
    if from >= window_end {
        return Vec::new();
    }
    grid.within(from, window_end)
        .iter()
        .filter(|slot| slot.remaining > 0)
        .map(|slot| AvailableSlot {
            start: slot.span.start,
            end: slot.span.end,
            remaining: slot.remaining,
        })
        .collect()
}
