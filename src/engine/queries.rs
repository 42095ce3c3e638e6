use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::DayBounds;
use crate::model::*;

use super::availability::{Availability, AvailabilityComputer};
use super::conflict::{validate_span_limits, ConflictChecker, Verdict};
use super::{Engine, EngineError, SchedulingError};

impl Engine {
    /// Dry run of `create_reservation`: what would the checker say right now.
    /// Nothing is locked beyond the read, so an accepted verdict is advisory.
    ///
    /// Fails the same way the create would for unknown rooms and ranges past
    /// the span limits.
    pub async fn check_reservation(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Verdict, EngineError> {
        self.require_room(room_id)?;
        let verdict = ConflictChecker::new(self)
            .verdict(room_id, start, end, self.now_ms())
            .await?;
        if verdict.accepted {
            validate_span_limits(start, end)?;
        }
        Ok(verdict)
    }

    /// Free intervals of the facility-local day containing `date`.
    pub async fn availability(&self, room_id: Ulid, date: Ms) -> Result<Availability, EngineError> {
        self.require_room(room_id)?;
        let availability = AvailabilityComputer::new(self, self.tz)
            .compute(room_id, date)
            .await?;
        Ok(availability)
    }

    pub async fn availability_on(
        &self,
        room_id: Ulid,
        date: NaiveDate,
    ) -> Result<Availability, EngineError> {
        self.require_room(room_id)?;
        let day = DayBounds::of_date(date, self.tz)
            .ok_or(SchedulingError::InvalidInput("date out of range"))?;
        let availability = AvailabilityComputer::new(self, self.tz)
            .compute_day(room_id, day)
            .await?;
        Ok(availability)
    }

    /// Ordered by id, which for ULIDs is creation order.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self.get_room_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    /// Ascending by start.
    pub async fn list_reservations(&self, room_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    /// Nil ids fall through so the computer reports them as invalid input.
    fn require_room(&self, room_id: Ulid) -> Result<(), EngineError> {
        if room_id.is_nil() || self.rooms.contains_key(&room_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(room_id))
        }
    }
}
