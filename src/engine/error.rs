use ulid::Ulid;

use crate::model::Ms;

/// Outcomes of the scheduling core. Everything except `Upstream` is an
/// expected, caller-correctable rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// Missing or empty room id.
    InvalidInput(&'static str),
    /// `start >= end`, or the range is not strictly after `now`.
    TimeRangeInvalid { start: Ms, end: Ms, now: Ms },
    /// The candidate overlaps these existing reservations.
    Conflict { room_id: Ulid, with: Vec<Ulid> },
    /// The reservation store failed.
    Upstream(String),
}

impl SchedulingError {
    /// `false` only for store failures, which the caller reports as internal.
    pub fn is_expected(&self) -> bool {
        !matches!(self, SchedulingError::Upstream(_))
    }
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::InvalidInput(what) => write!(f, "invalid input: {what}"),
            SchedulingError::TimeRangeInvalid { start, end, now } => write!(
                f,
                "invalid time range [{start}, {end}): must be non-empty and after {now}"
            ),
            SchedulingError::Conflict { room_id, with } => {
                write!(f, "room {room_id} already booked by")?;
                for (i, id) in with.iter().enumerate() {
                    write!(f, "{}{id}", if i == 0 { " " } else { ", " })?;
                }
                Ok(())
            }
            SchedulingError::Upstream(e) => write!(f, "reservation store failed: {e}"),
        }
    }
}

impl std::error::Error for SchedulingError {}

/// Failure reported by a `ReservationStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for SchedulingError {
    fn from(e: StoreError) -> Self {
        SchedulingError::Upstream(e.0)
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Same room, same exact start and end as an existing reservation.
    Duplicate(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    Scheduling(SchedulingError),
    WalError(String),
}

impl From<SchedulingError> for EngineError {
    fn from(e: SchedulingError) -> Self {
        EngineError::Scheduling(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Duplicate(id) => {
                write!(f, "reservation with identical room and times exists: {id}")
            }
            EngineError::Forbidden(what) => write!(f, "permission denied: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Scheduling(e) => e.fmt(f),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Scheduling(e) => Some(e),
            _ => None,
        }
    }
}
