use chrono_tz::Tz;
use ulid::Ulid;

use crate::calendar::DayBounds;
use crate::model::*;

use super::store::ReservationStore;
use super::SchedulingError;

pub const FREE_ALL_DAY: &str = "room is available all day";

/// Free time of one room over one calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub room_id: Ulid,
    pub day: DayBounds,
    /// Ordered, non-overlapping. Empty means fully booked.
    pub available_times: Vec<Span>,
    /// Set when the room has no reservations at all that day.
    pub message: Option<&'static str>,
}

impl Availability {
    pub fn is_fully_booked(&self) -> bool {
        self.available_times.is_empty()
    }
}

// ── Gap computation ───────────────────────────────────────────────

/// Complement of `reservations` within `day`.
///
/// Expects reservations that start inside the day and do not overlap each
/// other. The input is sorted here anyway, malformed spans are skipped and a
/// running cursor clips overlaps, so the output never holds an interval with
/// `start >= end` even when that expectation is broken.
///
/// The last interval ends at `day.end` inclusive; all others are half-open.
pub fn free_gaps(day: DayBounds, reservations: &[Reservation]) -> Vec<Span> {
    let mut booked: Vec<Span> = reservations
        .iter()
        .map(|r| r.span)
        .filter(|s| s.start < s.end)
        .collect();
    booked.sort_by_key(|s| s.start);

    let mut free = Vec::new();
    let mut cursor = day.start;

    for span in booked {
        if span.start > cursor
            && let Some(gap) = Span::checked(cursor, span.start.min(day.end))
        {
            free.push(gap);
        }
        cursor = cursor.max(span.end);
        if cursor >= day.end {
            return free;
        }
    }

    if let Some(tail) = Span::checked(cursor, day.end) {
        free.push(tail);
    }
    free
}

/// Computes free intervals of a room for a calendar day in `tz`.
///
/// Only reservations *starting* within the day are considered, so a booking
/// that begins before midnight and runs into the day does not shorten its
/// first free interval.
pub struct AvailabilityComputer<'a, S: ?Sized> {
    store: &'a S,
    tz: Tz,
}

impl<'a, S: ReservationStore + ?Sized> AvailabilityComputer<'a, S> {
    pub fn new(store: &'a S, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// `date` may be any instant within the wanted day.
    pub async fn compute(&self, room_id: Ulid, date: Ms) -> Result<Availability, SchedulingError> {
        let day = DayBounds::containing(date, self.tz)
            .ok_or(SchedulingError::InvalidInput("date out of range"))?;
        self.compute_day(room_id, day).await
    }

    pub async fn compute_day(
        &self,
        room_id: Ulid,
        day: DayBounds,
    ) -> Result<Availability, SchedulingError> {
        if room_id.is_nil() {
            return Err(SchedulingError::InvalidInput("room id is empty"));
        }

        let reservations = self
            .store
            .find_by_room_and_day(room_id, day.start, day.end)
            .await?;

        if reservations.is_empty() {
            return Ok(Availability {
                room_id,
                day,
                available_times: vec![Span::new(day.start, day.end)],
                message: Some(FREE_ALL_DAY),
            });
        }

        Ok(Availability {
            room_id,
            day,
            available_times: free_gaps(day, &reservations),
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::engine::StoreError;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    const DAY: DayBounds = DayBounds {
        start: 0,
        end: 24 * H - 1,
    };

    fn booked(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            user: "alice".into(),
            span: Span { start, end },
            status: ReservationStatus::Confirmed,
            created_at: 0,
        }
    }

    // ── free_gaps ────────────────────────────────────────

    #[test]
    fn two_reservations_three_gaps() {
        let free = free_gaps(DAY, &[booked(8 * H, 10 * H), booked(14 * H, 16 * H)]);
        assert_eq!(
            free,
            vec![
                Span::new(0, 8 * H),
                Span::new(10 * H, 14 * H),
                Span::new(16 * H, 24 * H - 1),
            ]
        );
    }

    #[test]
    fn back_to_back_leaves_no_gap_between() {
        let free = free_gaps(DAY, &[booked(9 * H, 11 * H), booked(11 * H, 13 * H)]);
        assert_eq!(free, vec![Span::new(0, 9 * H), Span::new(13 * H, 24 * H - 1)]);
    }

    #[test]
    fn reservation_at_day_start_has_no_leading_gap() {
        let free = free_gaps(DAY, &[booked(0, 2 * H)]);
        assert_eq!(free, vec![Span::new(2 * H, 24 * H - 1)]);
    }

    #[test]
    fn full_day_reservation_leaves_nothing() {
        assert!(free_gaps(DAY, &[booked(0, 24 * H)]).is_empty());
        assert!(free_gaps(DAY, &[booked(0, 24 * H - 1)]).is_empty());
    }

    #[test]
    fn reservation_past_midnight_clips_tail() {
        let free = free_gaps(DAY, &[booked(22 * H, 26 * H)]);
        assert_eq!(free, vec![Span::new(0, 22 * H)]);
    }

    #[test]
    fn unsorted_input_is_sorted() {
        let free = free_gaps(DAY, &[booked(14 * H, 16 * H), booked(8 * H, 10 * H)]);
        assert_eq!(free.len(), 3);
        assert_eq!(free[1], Span::new(10 * H, 14 * H));
    }

    #[test]
    fn overlapping_input_never_yields_negative_gaps() {
        // Broken upstream invariant: [9,12) and [10,11) overlap, [11,13) overlaps the first.
        let free = free_gaps(
            DAY,
            &[booked(9 * H, 12 * H), booked(10 * H, 11 * H), booked(11 * H, 13 * H)],
        );
        assert_eq!(free, vec![Span::new(0, 9 * H), Span::new(13 * H, 24 * H - 1)]);
        assert!(free.iter().all(|s| s.start < s.end));
    }

    #[test]
    fn malformed_reservations_skipped() {
        let free = free_gaps(DAY, &[booked(10 * H, 10 * H), booked(12 * H, 11 * H)]);
        assert_eq!(free, vec![Span::new(0, 24 * H - 1)]);
    }

    #[test]
    fn short_gaps_are_kept() {
        let free = free_gaps(DAY, &[booked(0, 10 * H), booked(10 * H + M, 24 * H)]);
        assert_eq!(free, vec![Span::new(10 * H, 10 * H + M)]);
    }

    // ── AvailabilityComputer ─────────────────────────────

    /// Store honouring the by-day contract over a fixed list.
    struct DayStore(Vec<Reservation>);

    #[async_trait]
    impl ReservationStore for DayStore {
        async fn find_overlapping(
            &self,
            _room_id: Ulid,
            _start: Ms,
            _end: Ms,
        ) -> Result<Vec<Reservation>, StoreError> {
            unreachable!("availability never checks overlap")
        }

        async fn find_by_room_and_day(
            &self,
            room_id: Ulid,
            day_start: Ms,
            day_end: Ms,
        ) -> Result<Vec<Reservation>, StoreError> {
            let mut hits: Vec<Reservation> = self
                .0
                .iter()
                .filter(|r| r.room_id == room_id)
                .filter(|r| r.span.start >= day_start && r.span.start <= day_end)
                .cloned()
                .collect();
            hits.sort_by_key(|r| r.span.start);
            Ok(hits)
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ReservationStore for BrokenStore {
        async fn find_overlapping(
            &self,
            _room_id: Ulid,
            _start: Ms,
            _end: Ms,
        ) -> Result<Vec<Reservation>, StoreError> {
            Err(StoreError("timeout".into()))
        }

        async fn find_by_room_and_day(
            &self,
            _room_id: Ulid,
            _day_start: Ms,
            _day_end: Ms,
        ) -> Result<Vec<Reservation>, StoreError> {
            Err(StoreError("timeout".into()))
        }
    }

    fn at(d: u32, h: u32) -> Ms {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn in_room(room_id: Ulid, start: Ms, end: Ms) -> Reservation {
        Reservation {
            room_id,
            ..booked(start, end)
        }
    }

    #[tokio::test]
    async fn empty_day_is_one_full_interval() {
        let room = Ulid::new();
        let store = DayStore(vec![]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let avail = computer.compute(room, at(15, 13)).await.unwrap();
        assert_eq!(avail.available_times, vec![Span::new(at(15, 0), at(16, 0) - 1)]);
        assert_eq!(avail.message, Some(FREE_ALL_DAY));
    }

    #[tokio::test]
    async fn gaps_around_one_reservation() {
        let room = Ulid::new();
        let store = DayStore(vec![in_room(room, at(15, 10), at(15, 12))]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let avail = computer.compute(room, at(15, 0)).await.unwrap();
        assert_eq!(
            avail.available_times,
            vec![
                Span::new(at(15, 0), at(15, 10)),
                Span::new(at(15, 12), at(16, 0) - 1),
            ]
        );
        assert_eq!(avail.message, None);
    }

    #[tokio::test]
    async fn other_days_and_rooms_ignored() {
        let room = Ulid::new();
        let store = DayStore(vec![
            in_room(room, at(14, 10), at(14, 12)),
            in_room(room, at(16, 10), at(16, 12)),
            in_room(Ulid::new(), at(15, 10), at(15, 12)),
        ]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let avail = computer.compute(room, at(15, 9)).await.unwrap();
        assert_eq!(avail.available_times.len(), 1);
        assert_eq!(avail.message, Some(FREE_ALL_DAY));
    }

    #[tokio::test]
    async fn reservation_from_previous_day_is_not_seen() {
        // Starts 22:00 on the 14th, ends 02:00 on the 15th. Only reservations
        // starting within the queried day count, so the 15th reads as free.
        let room = Ulid::new();
        let store = DayStore(vec![in_room(room, at(14, 22), at(15, 2))]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let avail = computer.compute(room, at(15, 12)).await.unwrap();
        assert_eq!(avail.available_times, vec![Span::new(at(15, 0), at(16, 0) - 1)]);
    }

    #[tokio::test]
    async fn full_day_booking_is_fully_booked() {
        let room = Ulid::new();
        let store = DayStore(vec![in_room(room, at(15, 0), at(16, 0))]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let avail = computer.compute(room, at(15, 8)).await.unwrap();
        assert!(avail.is_fully_booked());
        assert_eq!(avail.message, None);
    }

    #[tokio::test]
    async fn day_follows_configured_timezone() {
        // Berlin is UTC+1 in January: its 15th runs 14th 23:00Z .. 15th 22:59:59.999Z.
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let room = Ulid::new();
        let store = DayStore(vec![in_room(room, at(15, 9), at(15, 11))]);
        let computer = AvailabilityComputer::new(&store, tz);
        let avail = computer.compute(room, at(15, 12)).await.unwrap();
        assert_eq!(
            avail.available_times,
            vec![
                Span::new(at(14, 23), at(15, 9)),
                Span::new(at(15, 11), at(15, 23) - 1),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_calls_agree() {
        let room = Ulid::new();
        let store = DayStore(vec![
            in_room(room, at(15, 8), at(15, 10)),
            in_room(room, at(15, 14), at(15, 16)),
        ]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let first = computer.compute(room, at(15, 1)).await.unwrap();
        let second = computer.compute(room, at(15, 1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.available_times.len(), 3);
    }

    #[tokio::test]
    async fn nil_room_rejected() {
        let store = DayStore(vec![]);
        let computer = AvailabilityComputer::new(&store, Tz::UTC);
        let result = computer.compute(Ulid::nil(), at(15, 1)).await;
        assert!(matches!(result, Err(SchedulingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn store_failure_is_upstream() {
        let computer = AvailabilityComputer::new(&BrokenStore, Tz::UTC);
        let result = computer.compute(Ulid::new(), at(15, 1)).await;
        assert_eq!(result, Err(SchedulingError::Upstream("timeout".into())));
    }
}
