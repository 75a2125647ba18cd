use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::policy::{validate_participants, validate_span};
use super::{apply_to_reservation, authorize, Engine, EngineError, WalCommand};

fn capacity_rejected(e: EngineError) -> EngineError {
    if let EngineError::CapacityExceeded { .. } = e {
        metrics::counter!(CAPACITY_REJECTIONS_TOTAL).increment(1);
        debug!("capacity check failed: {e}");
    }
    e
}

impl Engine {
    /// Record a new unconfirmed reservation. Checks lead time and the
    /// current capacity of every contained slot; consumes nothing.
    pub async fn create_reservation(
        &self,
        customer_id: CustomerId,
        start: Ms,
        end: Ms,
        participants: u32,
    ) -> Result<Ulid, EngineError> {
        let span = validate_span(start, end)?;
        let participants = validate_participants(participants)?;
        self.policy.check_lead_time(span.start, self.now())?;
        if self.reservations.len() >= MAX_RESERVATIONS {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }

        // Read lock held across the WAL append: no confirm can consume
        // between the check and the commit.
        let grid = self.grid.read().await;
        grid.check_capacity(grid.contained_in(&span), participants)
            .map_err(capacity_rejected)?;

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            customer_id,
            span,
            participants,
        };
        self.wal_append(&event).await?;
        self.reservations.insert(
            id,
            Arc::new(RwLock::new(Reservation {
                id,
                customer_id,
                span,
                participants,
                status: Status::Unconfirmed,
            })),
        );
        drop(grid);

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        metrics::gauge!(RESERVATIONS_LIVE).set(self.reservations.len() as f64);
        info!(%id, customer_id, participants, "reservation requested");
        Ok(id)
    }

    /// Apply the supplied fields of `patch` to an unconfirmed reservation.
    /// The updated range is re-checked against capacity; on failure nothing
    /// changes. The lead-time rule is not applied here.
    pub async fn edit_reservation(
        &self,
        id: Ulid,
        caller: Caller,
        patch: ReservationPatch,
    ) -> Result<(), EngineError> {
        if patch.is_empty() {
            return Err(EngineError::EmptyPatch);
        }
        let mut reservation = self.lock_reservation(id).await?;
        authorize(caller, &reservation)?;
        if reservation.is_confirmed() {
            return Err(EngineError::AlreadyConfirmed(id));
        }

        let (start, end, participants) = patch.resolve(&reservation);
        let span = validate_span(start, end)?;
        let participants = validate_participants(participants)?;

        let grid = self.grid.read().await;
        grid.check_capacity(grid.contained_in(&span), participants)
            .map_err(capacity_rejected)?;

        let event = Event::ReservationEdited { id, span, participants };
        self.wal_append(&event).await?;
        apply_to_reservation(&mut reservation, &event);
        drop(grid);

        info!(%id, ?caller, participants, "reservation updated");
        Ok(())
    }

    /// Consume capacity for every contained slot and mark the reservation
    /// confirmed. All slots are checked before any is decremented.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let mut reservation = self.lock_reservation(id).await?;
        if reservation.is_confirmed() {
            return Err(EngineError::AlreadyConfirmed(id));
        }

        let mut grid = self.grid.write().await;
        let range = grid.contained_in(&reservation.span);
        grid.check_capacity(range.clone(), reservation.participants)
            .map_err(capacity_rejected)?;

        let event = Event::ReservationConfirmed {
            id,
            first_slot: range.start as u32,
            slot_count: range.len() as u32,
            participants: reservation.participants,
        };
        self.wal_append(&event).await?;
        grid.consume(range.clone(), reservation.participants)?;
        apply_to_reservation(&mut reservation, &event);
        drop(grid);

        metrics::counter!(RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        metrics::counter!(PARTICIPANTS_CONFIRMED_TOTAL).increment(u64::from(reservation.participants));
        info!(
            %id,
            customer_id = reservation.customer_id,
            participants = reservation.participants,
            slots = range.len(),
            "reservation confirmed"
        );
        Ok(())
    }

    /// Customers may delete their own unconfirmed reservations. Admins may
    /// delete anything; capacity consumed by a confirmed reservation is not
    /// given back.
    pub async fn delete_reservation(&self, id: Ulid, caller: Caller) -> Result<(), EngineError> {
        let mut reservation = self.lock_reservation(id).await?;
        authorize(caller, &reservation)?;
        if !caller.is_admin() && reservation.is_confirmed() {
            return Err(EngineError::AlreadyConfirmed(id));
        }

        let was_confirmed = reservation.is_confirmed();
        let event = Event::ReservationDeleted { id };
        self.wal_append(&event).await?;
        apply_to_reservation(&mut reservation, &event);
        self.reservations.remove(&id);

        if was_confirmed {
            warn!(
                %id,
                participants = reservation.participants,
                "confirmed reservation deleted by admin; capacity not restored"
            );
        }
        metrics::counter!(RESERVATIONS_DELETED_TOTAL).increment(1);
        metrics::gauge!(RESERVATIONS_LIVE).set(self.reservations.len() as f64);
        info!(%id, ?caller, "reservation deleted");
        Ok(())
    }

    /// Rewrite the WAL as a snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
}
