use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{validate_span_limits, ConflictChecker};
use super::{Engine, EngineError, SchedulingError};

fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.id.is_nil() {
        return Err(SchedulingError::InvalidInput("room id is empty").into());
    }
    if room.name.trim().is_empty() {
        return Err(SchedulingError::InvalidInput("room name is empty").into());
    }
    if room.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if room.equipment.len() > MAX_EQUIPMENT_TAGS {
        return Err(EngineError::LimitExceeded("too many equipment tags"));
    }
    if room.equipment.iter().any(|t| t.len() > MAX_TAG_LEN) {
        return Err(EngineError::LimitExceeded("equipment tag too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_room(&self, principal: &Principal, room: Room) -> Result<(), EngineError> {
        if !principal.is_admin() {
            return Err(EngineError::Forbidden("only admins may create rooms"));
        }
        validate_room(&room)?;

        let _catalog = self.catalog.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            warn!(limit = MAX_ROOMS, "room limit reached");
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        info!(room_id = %room.id, name = %room.name, by = %principal.user, "room created");
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        Ok(())
    }

    /// Removes the room together with every reservation it holds.
    pub async fn delete_room(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        if !principal.is_admin() {
            return Err(EngineError::Forbidden("only admins may delete rooms"));
        }

        let _catalog = self.catalog.lock().await;
        let rs = self.get_room_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;

        self.wal_append(&Event::RoomDeleted { id }).await?;
        self.rooms.remove(&id);
        self.unindex_room(&guard);
        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        info!(
            room_id = %id,
            cascaded = guard.reservations.len(),
            by = %principal.user,
            "room deleted"
        );
        Ok(())
    }

    /// Check and insert under the room's write lock: no other request for
    /// this room can slip in between the conflict check and the insert.
    pub async fn create_reservation(
        &self,
        principal: &Principal,
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        if room_id.is_nil() {
            return Err(SchedulingError::InvalidInput("room id is empty").into());
        }
        if id.is_nil() {
            return Err(SchedulingError::InvalidInput("reservation id is empty").into());
        }
        if principal.user.is_empty() || principal.user.len() > MAX_USER_LEN {
            return Err(SchedulingError::InvalidInput("bad user name").into());
        }

        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        // The room may have been deleted, or deleted and recreated, while we waited.
        if !self.is_registered(&room_id, &rs) {
            return Err(EngineError::NotFound(room_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            warn!(room_id = %room_id, "reservation limit reached");
            return Err(EngineError::LimitExceeded("too many reservations in room"));
        }

        let now = self.now_ms();
        if let Err(e) = ConflictChecker::new(&*guard)
            .validate(room_id, start, end, now)
            .await
        {
            if matches!(e, SchedulingError::Conflict { .. }) {
                metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            }
            debug!(room_id = %room_id, start, end, error = %e, "reservation rejected");
            return Err(e.into());
        }
        // Only a well-formed future range gets this far, so a stale or
        // inverted one always reports as a time range problem.
        validate_span_limits(start, end)?;

        let span = Span::new(start, end);
        if guard.has_exact(&span) {
            return Err(EngineError::Duplicate(room_id));
        }
        if self.reservation_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let reservation = Reservation {
            id,
            room_id,
            user: principal.user.clone(),
            span,
            status: ReservationStatus::Confirmed,
            created_at: now,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )
        .await?;
        info!(reservation_id = %id, room_id = %room_id, start, end, user = %principal.user, "reservation created");
        Ok(reservation)
    }

    pub async fn delete_reservation(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        let room_id = self
            .room_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if !self.is_registered(&room_id, &rs) {
            return Err(EngineError::NotFound(id));
        }

        let reservation = guard.get_reservation(id).ok_or(EngineError::NotFound(id))?;
        if !principal.may_delete(reservation) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may cancel a reservation",
            ));
        }

        self.persist_and_apply(&mut guard, &Event::ReservationDeleted { id, room_id })
            .await?;
        info!(reservation_id = %id, room_id = %room_id, by = %principal.user, "reservation deleted");
        Ok(())
    }

    /// Rewrite the WAL as the minimal event list reproducing current state.
    ///
    /// Holds the catalog lock and a read lock on every room until the rewrite
    /// lands, so no mutation can be appended to a file that is about to be replaced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(shared.len());
        for rs in shared {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
