use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::{MAX_VALID_YEAR, MIN_VALID_YEAR};
use crate::model::{Ms, ResourceState};

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// Count reservations holding capacity for (slot, date).
///
/// Authoritative only under the resource write lock that also inserts the
/// new row; read elsewhere (query layer) it is informational and must
/// never gate a write.
pub(crate) fn holding_count(resource: &ResourceState, slot_id: Ulid, date: NaiveDate) -> u32 {
    resource
        .reservations
        .iter()
        .filter(|r| r.slot_id == slot_id && r.date == date && r.status.is_holding())
        .count() as u32
}

/// The capacity gate. Fails closed when the tuple is at its ceiling.
/// Must run under the same write lock as the insert it protects — the
/// count re-read here is what makes two racing callers serialize.
pub(crate) fn check_capacity(
    resource: &ResourceState,
    slot_id: Ulid,
    date: NaiveDate,
) -> Result<(), EngineError> {
    if holding_count(resource, slot_id, date) >= resource.max_capacity {
        return Err(EngineError::SlotFull {
            max_capacity: resource.max_capacity,
        });
    }
    Ok(())
}

/// One holding reservation per (member, slot, date).
pub(crate) fn check_member_free(
    resource: &ResourceState,
    member_id: Ulid,
    slot_id: Ulid,
    date: NaiveDate,
) -> Result<(), EngineError> {
    if let Some(existing) = resource.reservations.iter().find(|r| {
        r.member_id == member_id && r.slot_id == slot_id && r.date == date && r.status.is_holding()
    }) {
        return Err(EngineError::AlreadyBooked {
            reservation_id: existing.id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, ReservationStatus};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn reservation(member_id: Ulid, slot_id: Ulid, on: NaiveDate, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            member_id,
            slot_id,
            date: on,
            status,
            ledger_entry: None,
            created_at: 0,
            closed_at: None,
            closed_by: None,
            cancel_reason: None,
        }
    }

    #[test]
    fn holding_count_ignores_released_statuses() {
        let mut rs = ResourceState::new(Ulid::new(), "Lane".into(), 2, None);
        let sid = Ulid::new();
        let on = date(2026, 8, 10);
        rs.reservations.push(reservation(Ulid::new(), sid, on, ReservationStatus::Confirmed));
        rs.reservations.push(reservation(Ulid::new(), sid, on, ReservationStatus::Attended));
        rs.reservations.push(reservation(Ulid::new(), sid, on, ReservationStatus::Cancelled));
        rs.reservations.push(reservation(Ulid::new(), sid, on, ReservationStatus::NoShow));
        // Different slot and date never count
        rs.reservations.push(reservation(Ulid::new(), Ulid::new(), on, ReservationStatus::Confirmed));
        rs.reservations.push(reservation(Ulid::new(), sid, date(2026, 8, 17), ReservationStatus::Confirmed));

        assert_eq!(holding_count(&rs, sid, on), 2);
    }

    #[test]
    fn capacity_gate_fails_closed_at_ceiling() {
        let mut rs = ResourceState::new(Ulid::new(), "Lane".into(), 1, None);
        let sid = Ulid::new();
        let on = date(2026, 8, 10);
        assert!(check_capacity(&rs, sid, on).is_ok());

        rs.reservations.push(reservation(Ulid::new(), sid, on, ReservationStatus::Confirmed));
        assert_eq!(
            check_capacity(&rs, sid, on),
            Err(EngineError::SlotFull { max_capacity: 1 })
        );
    }

    #[test]
    fn member_duplicate_detected_only_while_holding() {
        let mut rs = ResourceState::new(Ulid::new(), "Lane".into(), 5, None);
        let member = Ulid::new();
        let sid = Ulid::new();
        let on = date(2026, 8, 10);

        assert!(check_member_free(&rs, member, sid, on).is_ok());

        rs.reservations.push(reservation(member, sid, on, ReservationStatus::Cancelled));
        assert!(check_member_free(&rs, member, sid, on).is_ok());

        rs.reservations.push(reservation(member, sid, on, ReservationStatus::Confirmed));
        assert!(matches!(
            check_member_free(&rs, member, sid, on),
            Err(EngineError::AlreadyBooked { .. })
        ));
    }

    #[test]
    fn date_range_guard() {
        assert!(validate_date(date(2026, 8, 10)).is_ok());
        assert!(validate_date(date(1999, 12, 31)).is_err());
        assert!(validate_date(date(2101, 1, 1)).is_err());
    }
}
