use std::ops::Range;

use crate::limits::MAX_GRID_SLOTS;
use crate::model::*;

use super::EngineError;

/// The slot store: a fixed tiling of the booking horizon. Slots are never
/// added or removed after generation; only `remaining` moves.
#[derive(Debug, Clone)]
pub struct SlotGrid {
    spec: GridSpec,
    /// Sorted by `span.start`, contiguous, `id == index`.
    slots: Vec<Slot>,
}

impl SlotGrid {
    pub fn generate(spec: GridSpec) -> Result<Self, EngineError> {
        let count = spec.slot_count();
        if count > MAX_GRID_SLOTS {
            return Err(EngineError::LimitExceeded("slot grid too large"));
        }
        let slots = (0..count)
            .map(|i| {
                let start = spec.horizon.start + i as Ms * spec.slot_len;
                Slot {
                    id: i as u32,
                    span: Span::new(start, start + spec.slot_len),
                    remaining: spec.capacity,
                }
            })
            .collect();
        Ok(Self { spec, slots })
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn remaining(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.remaining).collect()
    }

    /// Overwrite every counter from a compaction snapshot. Extra or missing
    /// entries are ignored.
    pub fn restore_remaining(&mut self, remaining: &[u32]) {
        for (slot, &r) in self.slots.iter_mut().zip(remaining) {
            slot.remaining = r;
        }
    }

    /// Index range of slots fully inside `span`:
    /// `span.start <= slot.start && slot.end <= span.end`.
    pub fn contained_in(&self, span: &Span) -> Range<usize> {
        let first = self.slots.partition_point(|s| s.span.start < span.start);
        let last = self.slots.partition_point(|s| s.span.end <= span.end);
        first..last.max(first)
    }

    /// Slots whose start is at or after `from` and whose end is at or before `to`.
    pub fn within(&self, from: Ms, to: Ms) -> &[Slot] {
        let first = self.slots.partition_point(|s| s.span.start < from);
        let last = self.slots.partition_point(|s| s.span.end <= to);
        &self.slots[first..last.max(first)]
    }

    /// Fail on the first slot in `range` that cannot take `amount` more.
    pub fn check_capacity(&self, range: Range<usize>, amount: u32) -> Result<(), EngineError> {
        match self.slots[range].iter().find(|s| s.remaining < amount) {
            Some(slot) => Err(EngineError::CapacityExceeded {
                slot: slot.span,
                remaining: slot.remaining,
                requested: amount,
            }),
            None => Ok(()),
        }
    }

    /// Take `amount` from every slot in `range`, or from none of them.
    pub fn consume(&mut self, range: Range<usize>, amount: u32) -> Result<(), EngineError> {
        self.check_capacity(range.clone(), amount)?;
        for slot in &mut self.slots[range] {
            slot.remaining -= amount;
        }
        Ok(())
    }

    /// Apply a consumption recorded in the WAL. Saturates instead of failing:
    /// the entry was validated when it was written.
    pub fn replay_consume(&mut self, range: Range<usize>, amount: u32) {
        let end = range.end.min(self.slots.len());
        let start = range.start.min(end);
        for slot in &mut self.slots[start..end] {
            slot.remaining = slot.remaining.saturating_sub(amount);
        }
    }
}
