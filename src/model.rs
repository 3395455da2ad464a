use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Lifecycle status of a reservation. `Confirmed` is the only non-terminal
/// state; `Confirmed` and `Attended` hold slot capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Attended,
    NoShow,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_holding(self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::Attended)
    }

    pub fn label(self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Attended => "attended",
            ReservationStatus::NoShow => "no_show",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Closed,
}

/// Per-(period, benefit) usage allowance. `allocated` is fixed at grant
/// time; only the reservation lifecycle moves `used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub benefit: String,
    pub allocated: u32,
    pub used: u32,
}

impl LedgerEntry {
    pub fn new(id: Ulid, benefit: String, allocated: u32) -> Self {
        Self { id, benefit, allocated, used: 0 }
    }

    pub fn remaining(&self) -> u32 {
        self.allocated - self.used
    }

    /// Consume one credit. Err carries (remaining, allocated).
    pub fn debit(&mut self) -> Result<(), (u32, u32)> {
        if self.used >= self.allocated {
            return Err((self.remaining(), self.allocated));
        }
        self.used += 1;
        Ok(())
    }

    /// Return one credit. Clamped: `used` never underflows, so
    /// `remaining + used == allocated` holds unconditionally.
    pub fn credit(&mut self) {
        self.used = self.used.saturating_sub(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPeriod {
    pub id: Ulid,
    pub plan: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub status: SubscriptionStatus,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
pub struct MemberState {
    pub id: Ulid,
    pub name: String,
    pub subscriptions: Vec<SubscriptionPeriod>,
}

impl MemberState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self { id, name, subscriptions: Vec::new() }
    }

    pub fn subscription(&self, id: Ulid) -> Option<&SubscriptionPeriod> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn subscription_mut(&mut self, id: Ulid) -> Option<&mut SubscriptionPeriod> {
        self.subscriptions.iter_mut().find(|s| s.id == id)
    }
}

/// A repeating weekly time window on a resource. Holds no capacity state;
/// capacity is derived per concrete date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub is_active: bool,
}

/// One concrete booking of (member, slot, date). Never physically deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub member_id: Ulid,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub status: ReservationStatus,
    /// Ledger entry this reservation debited; None for credit-free resources.
    pub ledger_entry: Option<Ulid>,
    pub created_at: Ms,
    pub closed_at: Option<Ms>,
    pub closed_by: Option<String>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Max concurrent holding reservations per (slot, date).
    pub max_capacity: u32,
    pub is_active: bool,
    /// Benefit that gates access; None means reservable without credits.
    pub linked_benefit: Option<String>,
    pub slots: Vec<Slot>,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, max_capacity: u32, linked_benefit: Option<String>) -> Self {
        Self {
            id,
            name,
            max_capacity,
            is_active: true,
            linked_benefit,
            slots: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn slot(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberRegistered {
        id: Ulid,
        name: String,
    },
    SubscriptionActivated {
        id: Ulid,
        member_id: Ulid,
        plan: String,
        starts_on: NaiveDate,
        ends_on: NaiveDate,
    },
    SubscriptionClosed {
        id: Ulid,
        member_id: Ulid,
    },
    /// `used` is 0 for a fresh grant; compaction re-emits entries with
    /// their current counts so balances survive a WAL rewrite.
    LedgerEntryCreated {
        id: Ulid,
        subscription_id: Ulid,
        member_id: Ulid,
        benefit: String,
        allocated: u32,
        used: u32,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        max_capacity: u32,
        linked_benefit: Option<String>,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        max_capacity: u32,
    },
    ResourceRetired {
        id: Ulid,
    },
    SlotAdded {
        id: Ulid,
        resource_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    SlotRetired {
        id: Ulid,
        resource_id: Ulid,
    },
    /// One record commits the capacity consumption, the ledger debit
    /// (when `ledger_entry` is set) and the row insert together.
    ReservationConfirmed {
        id: Ulid,
        member_id: Ulid,
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        ledger_entry: Option<Ulid>,
        at: Ms,
    },
    /// `refund_entry` is decided when the command runs, so replay credits
    /// exactly once and never re-derives the refund from row state.
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        member_id: Ulid,
        refund_entry: Option<Ulid>,
        actor: Option<String>,
        reason: Option<String>,
        at: Ms,
    },
    ReservationAttended {
        id: Ulid,
        resource_id: Ulid,
        actor: Option<String>,
        at: Ms,
    },
    ReservationNoShow {
        id: Ulid,
        resource_id: Ulid,
        actor: Option<String>,
        at: Ms,
    },
    /// Compaction-only: recreates a reservation row in its final state
    /// with no ledger side effect.
    ReservationRestored {
        resource_id: Ulid,
        member_id: Ulid,
        reservation: Reservation,
    },
}

// ── Result types ─────────────────────────────────────────────────

/// Returned to the caller of a successful `create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationReceipt {
    pub reservation_id: Ulid,
    pub resource_name: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Absent when the resource is not benefit-gated.
    pub remaining_credits: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot_id: Ulid,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub booked_count: u32,
    pub available_spots: u32,
    pub is_full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSummary {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

/// Staff calendar row — includes member identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub reservation_id: Ulid,
    pub member_id: Ulid,
    pub member_name: String,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBalance {
    pub entry_id: Ulid,
    pub benefit: String,
    pub allocated: u32,
    pub used: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub max_capacity: u32,
    pub is_active: bool,
    pub linked_benefit: Option<String>,
}
