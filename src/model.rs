use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
///
/// Availability output reuses this shape; its final interval of a day ends at
/// the inclusive day end (`23:59:59.999`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span only if it is non-degenerate.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub equipment: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    /// Login name of the creating user; owns the reservation for deletion.
    pub user: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

/// Who is asking. Authentication happens at the connection layer; the engine
/// only sees the resolved principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Member,
}

impl Principal {
    pub fn admin(user: impl Into<String>) -> Self {
        Self { user: user.into(), role: Role::Admin }
    }

    pub fn member(user: impl Into<String>) -> Self {
        Self { user: user.into(), role: Role::Member }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn may_delete(&self, reservation: &Reservation) -> bool {
        self.is_admin() || self.user == reservation.user
    }
}

/// A room plus its reservations, guarded together by one per-room lock.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.room.id
    }

    /// Insert keeping start order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps `[start, end)`.
    /// Everything at index >= the partition point starts at or after `end`.
    pub fn overlapping(&self, start: Ms, end: Ms) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.span.start < end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > start)
    }

    /// Reservations whose start lies in the closed range `[from, to]`.
    pub fn starting_within(&self, from: Ms, to: Ms) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.span.start < from);
        let hi = self.reservations.partition_point(|r| r.span.start <= to);
        &self.reservations[lo..hi.max(lo)]
    }

    /// Storage-level backstop: the exact `(room, start, end)` tuple is unique.
    pub fn has_exact(&self, span: &Span) -> bool {
        self.reservations.iter().any(|r| r.span == *span)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    /// Cascades: every reservation of the room goes with it.
    RoomDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}
