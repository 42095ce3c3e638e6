mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{free_gaps, Availability, AvailabilityComputer, FREE_ALL_DAY};
pub use conflict::{ConflictChecker, Rejection, Verdict};
pub use error::{EngineError, SchedulingError, StoreError};
pub use store::ReservationStore;

use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::{Wal, WalWriter};

/// One lock per room: held for writing across check-then-insert, so two
/// overlapping requests for the same room are serialized.
pub type SharedRoomState = Arc<RwLock<RoomState>>;

pub struct Engine {
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: reservation id → room id.
    reservation_to_room: DashMap<Ulid, Ulid>,
    /// Serializes room creation, room deletion and WAL compaction.
    catalog: Mutex<()>,
    wal: WalWriter,
    clock: Arc<dyn Clock>,
    tz: Tz,
}

/// Apply an event to a room the caller already holds the lock for.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.room_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
        }
        // Room lifecycle lives at the map level.
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>, tz: Tz) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalWriter::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            rooms: DashMap::new(),
            reservation_to_room: DashMap::new(),
            catalog: Mutex::new(()),
            wal,
            clock,
            tz,
        };

        // Sole owner of every lock during replay, so try_write never contends.
        // blocking_write would panic when this runs inside the runtime.
        for event in &events {
            match event {
                Event::RoomCreated { room } => {
                    engine
                        .rooms
                        .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                }
                Event::RoomDeleted { id } => {
                    if let Some((_, rs)) = engine.rooms.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        engine.unindex_room(&guard);
                    }
                }
                Event::ReservationCreated { reservation } => {
                    engine.replay_into(reservation.room_id, event);
                }
                Event::ReservationDeleted { room_id, .. } => {
                    engine.replay_into(*room_id, event);
                }
            }
        }

        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(engine.rooms.len() as f64);
        info!(
            rooms = engine.rooms.len(),
            reservations = engine.reservation_to_room.len(),
            replayed = events.len(),
            "engine ready"
        );
        Ok(engine)
    }

    fn replay_into(&self, room_id: Ulid, event: &Event) {
        if let Some(rs) = self.get_room_state(&room_id)
            && let Ok(mut guard) = rs.try_write()
        {
            apply_to_room(&mut guard, event, &self.reservation_to_room);
        }
    }

    fn unindex_room(&self, rs: &RoomState) {
        for r in &rs.reservations {
            self.reservation_to_room.remove(&r.id);
        }
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether `rs` is still the state registered under `room_id`. A lock
    /// taken on a room that was since deleted or replaced guards nothing.
    fn is_registered(&self, room_id: &Ulid, rs: &SharedRoomState) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably log, then apply to the locked room.
    async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_to_room);
        Ok(())
    }
}
