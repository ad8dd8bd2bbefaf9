//! Hard limits on tenant-controlled input. Everything a client can grow is capped here.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PROVIDERS_PER_TENANT: usize = 100_000;
pub const MAX_SERVICES_PER_PROVIDER: usize = 1_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 200_000;
pub const MAX_BREAKS_PER_DAY: usize = 48;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// A service or appointment lasts at most one day.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;
pub const MAX_SLOT_GRANULARITY: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest date range a single appointment listing may cover.
pub const MAX_LIST_RANGE_DAYS: i64 = 366;
