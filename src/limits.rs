use crate::model::Ms;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EQUIPMENT_TAGS: usize = 64;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_USER_LEN: usize = 128;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
/// Highest `$N` placeholder a prepared statement may use.
pub const MAX_PARAMS: usize = 64;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// A single reservation may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
