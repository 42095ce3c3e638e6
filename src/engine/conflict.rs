use ulid::Ulid;

use crate::model::*;

use super::store::ReservationStore;
use super::{EngineError, SchedulingError};

pub(crate) fn validate_span_limits(start: Ms, end: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// Why a candidate reservation was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidRoom,
    InvalidTimeRange,
    Conflict,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::InvalidRoom => "InvalidRoom",
            Rejection::InvalidTimeRange => "InvalidTimeRange",
            Rejection::Conflict => "Conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: Option<Rejection>,
}

impl Verdict {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: Rejection) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }

    /// Fold a validation outcome into a verdict. Store failures are not a
    /// verdict and come back as the error.
    pub fn from_outcome(outcome: Result<(), SchedulingError>) -> Result<Self, SchedulingError> {
        match outcome {
            Ok(()) => Ok(Self::accepted()),
            Err(SchedulingError::InvalidInput(_)) => Ok(Self::rejected(Rejection::InvalidRoom)),
            Err(SchedulingError::TimeRangeInvalid { .. }) => {
                Ok(Self::rejected(Rejection::InvalidTimeRange))
            }
            Err(SchedulingError::Conflict { .. }) => Ok(Self::rejected(Rejection::Conflict)),
            Err(e @ SchedulingError::Upstream(_)) => Err(e),
        }
    }
}

/// Decides whether a candidate reservation may be created.
///
/// Read-only: one store query at most, and none at all when the candidate
/// fails the room or time checks. Passing is only meaningful if the caller
/// keeps the room locked until its insert lands; see `Engine::create_reservation`.
pub struct ConflictChecker<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ReservationStore + ?Sized> ConflictChecker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn validate(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        now: Ms,
    ) -> Result<(), SchedulingError> {
        if room_id.is_nil() {
            return Err(SchedulingError::InvalidInput("room id is empty"));
        }
        if !(start < end && start > now && end > now) {
            return Err(SchedulingError::TimeRangeInvalid { start, end, now });
        }

        let existing = self.store.find_overlapping(room_id, start, end).await?;
        if existing.is_empty() {
            return Ok(());
        }
        Err(SchedulingError::Conflict {
            room_id,
            with: existing.into_iter().map(|r| r.id).collect(),
        })
    }

    pub async fn verdict(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        now: Ms,
    ) -> Result<Verdict, SchedulingError> {
        Verdict::from_outcome(self.validate(room_id, start, end, now).await)
    }
}
