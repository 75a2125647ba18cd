use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::available_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Open slots inside `[window_start, window_end]`, never earlier than
    /// now + lead time. The window is clamped to the horizon, so any
    /// well-formed window succeeds.
    pub async fn find_available(&self, window_start: Ms, window_end: Ms) -> Result<Vec<AvailableSlot>, EngineError> {
        let earliest = self.policy.earliest_start(self.now());
        let grid = self.grid.read().await;
        let spec = grid.spec();
        let from = window_start.max(spec.horizon.start);
        let to = window_end.min(spec.horizon.end.saturating_add(spec.slot_len));
        Ok(available_slots(&grid, from, to, earliest))
    }

    /// Raw slot listing, full slots included. Missing bounds and bounds
    /// outside the horizon are clamped to it.
    pub async fn list_slots(&self, from: Option<Ms>, to: Option<Ms>) -> Result<Vec<Slot>, EngineError> {
        let grid = self.grid.read().await;
        let spec = grid.spec();
        let from = from.map_or(spec.horizon.start, |f| f.max(spec.horizon.start));
        let to = to.unwrap_or(Ms::MAX).min(spec.horizon.end + spec.slot_len);
        if to.saturating_sub(from) > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        Ok(grid.within(from, to).to_vec())
    }

    /// Current counter for the slot starting exactly at `start`.
    pub async fn slot_remaining(&self, start: Ms) -> Option<u32> {
        let grid = self.grid.read().await;
        let slots = grid.slots();
        slots
            .binary_search_by_key(&start, |s| s.span.start)
            .ok()
            .map(|i| slots[i].remaining)
    }

    pub async fn list_reservations(&self, customer_id: CustomerId) -> Vec<ReservationInfo> {
        self.collect_reservations(|r| r.customer_id == customer_id).await
    }

    pub async fn list_all_reservations(&self) -> Vec<ReservationInfo> {
        self.collect_reservations(|_| true).await
    }

    /// Full record including status, for callers that need more than the
    /// listing projection.
    pub async fn reservation(&self, id: Ulid) -> Option<Reservation> {
        let shared = self.get_reservation(&id)?;
        let guard = shared.read().await;
        (guard.status != Status::Deleted).then(|| (*guard).clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Snapshot matching records ordered by id (creation order).
    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<ReservationInfo> {
        // Clone the handles first so no DashMap shard lock is held across an await.
        let handles: Vec<_> = self.reservations.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for shared in handles {
            let r = shared.read().await;
            if r.status != Status::Deleted && keep(&*r) {
                out.push(ReservationInfo::from(&*r));
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
