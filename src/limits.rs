//! Hard caps on inputs and state growth. All are rejected with
//! `EngineError::LimitExceeded` rather than silently truncated.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PLAN_LEN: usize = 128;
pub const MAX_BENEFIT_LEN: usize = 128;
pub const MAX_ACTOR_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 512;

pub const MAX_MEMBERS: usize = 100_000;
pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_SLOTS_PER_RESOURCE: usize = 500;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 1_000_000;
pub const MAX_SUBSCRIPTIONS_PER_MEMBER: usize = 200;
pub const MAX_ENTRIES_PER_SUBSCRIPTION: usize = 50;
pub const MAX_ENTITLEMENT_BATCH: usize = 50;

pub const MAX_IN_CLAUSE_IDS: usize = 100;
pub const MAX_CALENDAR_WINDOW_DAYS: i64 = 366;
pub const MAX_LIST_LIMIT: usize = 1_000;

/// Calendar dates outside this year range are malformed input, not data.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;
