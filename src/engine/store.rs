use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, StoreError};

/// Read side of reservation persistence, as seen by the scheduling core.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Every reservation of `room_id` with `existing.start < end && existing.end > start`.
    async fn find_overlapping(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Every reservation of `room_id` whose start lies in `[day_start, day_end]`,
    /// ascending by start.
    async fn find_by_room_and_day(
        &self,
        room_id: Ulid,
        day_start: Ms,
        day_end: Ms,
    ) -> Result<Vec<Reservation>, StoreError>;
}

/// A locked room answers for itself. This is what lets the engine run the
/// conflict check while already holding the room's write lock.
#[async_trait]
impl ReservationStore for RoomState {
    async fn find_overlapping(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Reservation>, StoreError> {
        if room_id != self.id() {
            return Ok(Vec::new());
        }
        Ok(self.overlapping(start, end).cloned().collect())
    }

    async fn find_by_room_and_day(
        &self,
        room_id: Ulid,
        day_start: Ms,
        day_end: Ms,
    ) -> Result<Vec<Reservation>, StoreError> {
        if room_id != self.id() {
            return Ok(Vec::new());
        }
        Ok(self.starting_within(day_start, day_end).to_vec())
    }
}

/// Unknown rooms have no reservations; existence is the caller's concern.
#[async_trait]
impl ReservationStore for Engine {
    async fn find_overlapping(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(rs) = self.get_room_state(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        guard.find_overlapping(room_id, start, end).await
    }

    async fn find_by_room_and_day(
        &self,
        room_id: Ulid,
        day_start: Ms,
        day_end: Ms,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(rs) = self.get_room_state(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        guard.find_by_room_and_day(room_id, day_start, day_end).await
    }
}
