use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::{holding_count, validate_date};
use super::{catalog, ledger, Engine, EngineError};

/// Read-side projections. Counts read here are informational — they may
/// lag a racing writer by a moment and never gate a write.
impl Engine {
    /// Spots left per active slot of a resource on a given date.
    pub async fn list_available_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        validate_date(date)?;
        let resource = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = resource.read().await;
        catalog::ensure_bookable(&guard)?;

        let mut out = Vec::new();
        for slot in catalog::slots_for_date(&guard, date) {
            let booked = holding_count(&guard, slot.id, date);
            let available = guard.max_capacity.saturating_sub(booked);
            out.push(SlotAvailability {
                slot_id: slot.id,
                start: slot.start,
                end: slot.end,
                booked_count: booked,
                available_spots: available,
                is_full: available == 0,
            });
        }
        out.sort_by_key(|s| s.start);
        Ok(out)
    }

    /// A member's reservations, newest first, optionally filtered by
    /// status. `limit` is clamped to MAX_LIST_LIMIT.
    pub async fn member_reservations(
        &self,
        member_id: Ulid,
        status: Option<ReservationStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ReservationSummary>, EngineError> {
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }
        let limit = limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);

        let mut out = Vec::new();
        let resource_ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        for rid in resource_ids {
            let Some(resource) = self.get_resource(&rid) else { continue };
            let guard = resource.read().await;
            for resv in &guard.reservations {
                if resv.member_id != member_id {
                    continue;
                }
                if let Some(wanted) = status
                    && resv.status != wanted
                {
                    continue;
                }
                let Some(slot) = guard.slot(resv.slot_id) else { continue };
                out.push(ReservationSummary {
                    id: resv.id,
                    resource_id: guard.id,
                    resource_name: guard.name.clone(),
                    slot_id: resv.slot_id,
                    date: resv.date,
                    start: slot.start,
                    end: slot.end,
                    status: resv.status,
                    created_at: resv.created_at,
                });
            }
        }
        out.sort_by(|a, b| (b.date, b.start).cmp(&(a.date, a.start)));
        out.truncate(limit);
        Ok(out)
    }

    /// Staff calendar feed over a date range, optionally restricted to a
    /// set of resources. Includes member identity.
    pub async fn reservations_in_range(
        &self,
        resource_ids: Option<Vec<Ulid>>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_date(from)?;
        validate_date(to)?;
        if to < from {
            return Err(EngineError::InvalidRequest("range end is before start"));
        }
        if (to - from).num_days() > MAX_CALENDAR_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("calendar window too wide"));
        }
        if let Some(ids) = &resource_ids
            && ids.len() > MAX_IN_CLAUSE_IDS
        {
            return Err(EngineError::LimitExceeded("too many resource IDs"));
        }

        let targets: Vec<Ulid> = match resource_ids {
            Some(ids) => ids,
            None => self.resources.iter().map(|e| *e.key()).collect(),
        };

        // Collect rows with the resource lock only; member names are
        // resolved afterwards so no resource lock is ever held while
        // waiting on a member lock (writers lock member before resource).
        let mut out = Vec::new();
        for rid in targets {
            let Some(resource) = self.get_resource(&rid) else { continue };
            let guard = resource.read().await;
            for resv in &guard.reservations {
                if resv.date < from || resv.date > to {
                    continue;
                }
                let Some(slot) = guard.slot(resv.slot_id) else { continue };
                out.push(CalendarEntry {
                    reservation_id: resv.id,
                    member_id: resv.member_id,
                    member_name: String::new(),
                    resource_id: guard.id,
                    resource_name: guard.name.clone(),
                    slot_id: resv.slot_id,
                    date: resv.date,
                    start: slot.start,
                    end: slot.end,
                    status: resv.status,
                });
            }
        }

        let mut names: HashMap<Ulid, String> = HashMap::new();
        for entry in &mut out {
            if !names.contains_key(&entry.member_id)
                && let Some(member) = self.get_member(&entry.member_id)
            {
                names.insert(entry.member_id, member.read().await.name.clone());
            }
            if let Some(name) = names.get(&entry.member_id) {
                entry.member_name = name.clone();
            }
        }

        out.sort_by(|a, b| (a.date, a.start, a.reservation_id).cmp(&(b.date, b.start, b.reservation_id)));
        Ok(out)
    }

    /// Current balances on the member's authoritative (active) period.
    pub async fn ledger_balances(&self, member_id: Ulid) -> Result<Vec<LedgerBalance>, EngineError> {
        let member = self.get_member(&member_id).ok_or(EngineError::NotFound(member_id))?;
        let guard = member.read().await;
        let Some(period) = ledger::active_period(&guard) else {
            return Ok(Vec::new());
        };
        Ok(period
            .entries
            .iter()
            .map(|e| LedgerBalance {
                entry_id: e.id,
                benefit: e.benefit.clone(),
                allocated: e.allocated,
                used: e.used,
                remaining: e.remaining(),
            })
            .collect())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(resource) = self.get_resource(&id) else { continue };
            let guard = resource.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                max_capacity: guard.max_capacity,
                is_active: guard.is_active,
                linked_benefit: guard.linked_benefit.clone(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
