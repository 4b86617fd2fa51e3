use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_CLIENTS_PER_CALENDAR: usize = 10_000;
pub const MAX_BOOKINGS_PER_CALENDAR: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_UPCOMING_COUNT: usize = 100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
