use ulid::Ulid;

use crate::model::ReservationStatus;

/// Closed taxonomy of recoverable, caller-facing failures. Kinds are
/// programmatically distinguishable; messages carry the counts a UI
/// needs ("0 of N remaining", configured capacity).
#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    InvalidRequest(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NoActiveSubscription {
        member_id: Ulid,
    },
    BenefitNotGranted {
        benefit: String,
    },
    InsufficientCredits {
        remaining: u32,
        allocated: u32,
    },
    SlotFull {
        max_capacity: u32,
    },
    AlreadyBooked {
        reservation_id: Ulid,
    },
    AlreadyCancelled(Ulid),
    AlreadyAttended(Ulid),
    AlreadyNoShow(Ulid),
    ResourceUnavailable(Ulid),
    SlotUnavailable(Ulid),
    LimitExceeded(&'static str),
    /// Unexpected persistence failure — logged with context, surfaced as
    /// a retryable message. Nothing partial was committed.
    WalError(String),
}

impl EngineError {
    /// Map a terminal reservation status to its transition-guard error.
    pub fn already_closed(id: Ulid, status: ReservationStatus) -> Self {
        match status {
            ReservationStatus::Cancelled => EngineError::AlreadyCancelled(id),
            ReservationStatus::Attended => EngineError::AlreadyAttended(id),
            ReservationStatus::NoShow => EngineError::AlreadyNoShow(id),
            // Confirmed is not terminal; callers guard before mapping.
            ReservationStatus::Confirmed => EngineError::InvalidRequest("reservation is still confirmed"),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoActiveSubscription { member_id } => {
                write!(f, "member {member_id} has no active subscription")
            }
            EngineError::BenefitNotGranted { benefit } => {
                write!(f, "benefit not granted by subscription plan: {benefit}")
            }
            EngineError::InsufficientCredits { remaining, allocated } => {
                write!(f, "insufficient credits: {remaining} of {allocated} remaining")
            }
            EngineError::SlotFull { max_capacity } => {
                write!(f, "slot full: all {max_capacity} spots taken")
            }
            EngineError::AlreadyBooked { reservation_id } => {
                write!(f, "member already holds reservation {reservation_id} for this slot and date")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "reservation {id} is already cancelled"),
            EngineError::AlreadyAttended(id) => write!(f, "reservation {id} is already attended"),
            EngineError::AlreadyNoShow(id) => write!(f, "reservation {id} is already marked no-show"),
            EngineError::ResourceUnavailable(id) => write!(f, "resource unavailable: {id}"),
            EngineError::SlotUnavailable(id) => write!(f, "slot unavailable: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
