mod availability;
mod error;
mod grid;
mod mutations;
mod policy;
mod queries;

pub use availability::available_slots;
pub use error::{EngineError, ErrorKind};
pub use grid::SlotGrid;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::model::*;
use crate::wal::Wal;

pub type SharedReservation = Arc<RwLock<Reservation>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partial bytes don't
    // bleed into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Fold the log as it stands on disk into a snapshot and swap it in.
/// Runs on the writer task, so no append can interleave.
fn compact(wal: &mut Wal) -> io::Result<()> {
    wal.flush_sync()?;
    let events = Wal::replay(wal.path())?;
    let before = events.len();
    let state = ReplayState::fold(&events);
    let snapshot = state.snapshot();
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    info!("compacted WAL {}: {before} -> {} events", wal.path().display(), snapshot.len());
    Ok(())
}

// ── Replay ───────────────────────────────────────────────

/// Plain (unlocked) state rebuilt from WAL events.
#[derive(Default)]
pub(super) struct ReplayState {
    pub(super) grid: Option<SlotGrid>,
    pub(super) reservations: HashMap<Ulid, Reservation>,
}

impl ReplayState {
    pub(super) fn fold(events: &[Event]) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::GridGenerated { spec } => {
                if self.grid.is_none() {
                    match SlotGrid::generate(*spec) {
                        Ok(grid) => self.grid = Some(grid),
                        Err(e) => warn!("replay: cannot rebuild grid: {e}"),
                    }
                }
            }
            Event::SlotCapacities { remaining } => {
                if let Some(grid) = self.grid.as_mut() {
                    grid.restore_remaining(remaining);
                }
            }
            Event::ReservationCreated {
                id,
                customer_id,
                span,
                participants,
            } => {
                self.reservations.insert(
                    *id,
                    Reservation {
                        id: *id,
                        customer_id: *customer_id,
                        span: *span,
                        participants: *participants,
                        status: Status::Unconfirmed,
                    },
                );
            }
            Event::ReservationEdited { id, .. } | Event::ReservationConfirmed { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    apply_to_reservation(r, event);
                }
                if let Event::ReservationConfirmed {
                    first_slot,
                    slot_count,
                    participants,
                    ..
                } = event
                    && let Some(grid) = self.grid.as_mut()
                {
                    let first = *first_slot as usize;
                    grid.replay_consume(first..first + *slot_count as usize, *participants);
                }
            }
            Event::ReservationDeleted { id } => {
                self.reservations.remove(id);
            }
            Event::ReservationRestored { reservation } => {
                self.reservations.insert(reservation.id, reservation.clone());
            }
        }
    }

    /// Minimal event list recreating this state, capacity included.
    fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.reservations.len() + 2);
        if let Some(grid) = &self.grid {
            events.push(Event::GridGenerated { spec: *grid.spec() });
            events.push(Event::SlotCapacities {
                remaining: grid.remaining(),
            });
        }
        let mut live: Vec<&Reservation> = self.reservations.values().collect();
        live.sort_by_key(|r| r.id);
        events.extend(live.into_iter().map(|r| Event::ReservationRestored {
            reservation: r.clone(),
        }));
        events
    }
}

/// Apply a per-reservation event to the record (caller holds its lock).
pub(super) fn apply_to_reservation(r: &mut Reservation, event: &Event) {
    match event {
        Event::ReservationEdited {
            span, participants, ..
        } => {
            r.span = *span;
            r.participants = *participants;
        }
        Event::ReservationConfirmed { .. } => r.status = Status::Confirmed,
        Event::ReservationDeleted { .. } => r.status = Status::Deleted,
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// Slot store, reservation store and lifecycle rules behind one handle.
///
/// Locking: each reservation has its own lock; the grid has one. A task
/// always takes the reservation lock before the grid lock. Capacity only
/// moves under the grid write lock.
pub struct Engine {
    pub(super) grid: RwLock<SlotGrid>,
    pub(super) reservations: DashMap<Ulid, SharedReservation>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) policy: BookingPolicy,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay `wal_path` and start the WAL writer. Generates and persists the
    /// slot grid on first start only.
    pub fn new(wal_path: PathBuf, policy: BookingPolicy, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let events = Wal::replay(&wal_path).map_err(wal_err)?;
        let mut state = ReplayState::fold(&events);
        let mut wal = Wal::open(&wal_path).map_err(wal_err)?;

        let grid = match state.grid.take() {
            Some(grid) => {
                if *grid.spec() != policy.grid {
                    warn!(
                        "configured slot grid differs from the persisted one in {}; keeping persisted grid",
                        wal_path.display()
                    );
                }
                grid
            }
            None => {
                let grid = SlotGrid::generate(policy.grid)?;
                wal.append_buffered(&Event::GridGenerated { spec: policy.grid })
                    .and_then(|()| wal.flush_sync())
                    .map_err(wal_err)?;
                info!("generated {} slots", grid.len());
                grid
            }
        };

        let reservations = DashMap::with_capacity(state.reservations.len());
        for (id, r) in state.reservations {
            reservations.insert(id, Arc::new(RwLock::new(r)));
        }
        metrics::gauge!(crate::observability::RESERVATIONS_LIVE).set(reservations.len() as f64);
        info!(
            "replayed {} events from {}: {} slots, {} reservations",
            events.len(),
            wal_path.display(),
            grid.len(),
            reservations.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            grid: RwLock::new(grid),
            reservations,
            wal_tx,
            policy,
            clock,
        })
    }

    /// Open the engine's log inside `data_dir`.
    pub fn open(data_dir: &Path, policy: BookingPolicy, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        Self::new(data_dir.join("slotbook.wal"), policy, clock)
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(wal_err)
    }

    pub(super) fn get_reservation(&self, id: &Ulid) -> Option<SharedReservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    /// Lookup + write lock. A record deleted while we waited reads as missing.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Reservation>, EngineError> {
        let shared = self.get_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.write_owned().await;
        if guard.status == Status::Deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }
}

/// Customers may only touch their own reservations; admins touch any.
pub(super) fn authorize(caller: Caller, reservation: &Reservation) -> Result<(), EngineError> {
    match caller {
        Caller::Admin => Ok(()),
        Caller::Customer(customer_id) if customer_id == reservation.customer_id => Ok(()),
        Caller::Customer(customer_id) => Err(EngineError::NotOwner {
            id: reservation.id,
            customer_id,
        }),
    }
}

fn wal_err(e: io::Error) -> EngineError {
    EngineError::WalError(e.to_string())
}
