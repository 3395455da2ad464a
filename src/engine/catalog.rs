use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::{ResourceState, Slot};

use super::EngineError;

/// Reject reservations against retired resources. Callers already hold
/// a lock on `resource`.
pub(crate) fn ensure_bookable(resource: &ResourceState) -> Result<(), EngineError> {
    if !resource.is_active {
        return Err(EngineError::ResourceUnavailable(resource.id));
    }
    Ok(())
}

/// Resolve a slot for a concrete date: it must belong to this resource,
/// be active, and recur on the date's weekday.
pub(crate) fn slot_on<'a>(
    resource: &'a ResourceState,
    slot_id: Ulid,
    date: NaiveDate,
) -> Result<&'a Slot, EngineError> {
    let slot = resource
        .slot(slot_id)
        .filter(|s| s.is_active)
        .ok_or(EngineError::SlotUnavailable(slot_id))?;
    if slot.weekday != date.weekday() {
        return Err(EngineError::InvalidRequest("date does not fall on the slot's weekday"));
    }
    Ok(slot)
}

/// Active slots recurring on the given date's weekday. Pure read.
pub(crate) fn slots_for_date<'a>(
    resource: &'a ResourceState,
    date: NaiveDate,
) -> impl Iterator<Item = &'a Slot> {
    let weekday = date.weekday();
    resource
        .slots
        .iter()
        .filter(move |s| s.is_active && s.weekday == weekday)
}
