use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Weekday};
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::capacity::{self, now_ms, validate_date};
use super::{apply_member_event, apply_resource_event, catalog, ledger};
use super::{Engine, EngineError, WalCommand};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidRequest("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_actor(actor: &Option<String>) -> Result<(), EngineError> {
    if let Some(a) = actor
        && a.len() > MAX_ACTOR_LEN
    {
        return Err(EngineError::LimitExceeded("actor too long"));
    }
    Ok(())
}

impl Engine {
    // ── Membership ingest (external member management writes through here) ──

    pub async fn register_member(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        if self.members.len() >= MAX_MEMBERS {
            return Err(EngineError::LimitExceeded("too many members"));
        }
        if self.members.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::MemberRegistered { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.members
            .insert(id, Arc::new(RwLock::new(MemberState::new(id, name))));
        Ok(())
    }

    pub async fn activate_subscription(
        &self,
        id: Ulid,
        member_id: Ulid,
        plan: String,
        starts_on: NaiveDate,
        ends_on: NaiveDate,
    ) -> Result<(), EngineError> {
        if plan.is_empty() || plan.len() > MAX_PLAN_LEN {
            return Err(EngineError::InvalidRequest("bad plan name"));
        }
        validate_date(starts_on)?;
        validate_date(ends_on)?;
        if ends_on < starts_on {
            return Err(EngineError::InvalidRequest("subscription ends before it starts"));
        }
        if self.subscription_members.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let member = self.get_member(&member_id).ok_or(EngineError::NotFound(member_id))?;
        let mut guard = member.write().await;
        if guard.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_MEMBER {
            return Err(EngineError::LimitExceeded("too many subscription periods"));
        }

        let event = Event::SubscriptionActivated { id, member_id, plan, starts_on, ends_on };
        self.wal_append(&event).await?;
        apply_member_event(&mut guard, &event);
        self.index_event(&event);
        Ok(())
    }

    pub async fn close_subscription(&self, id: Ulid) -> Result<(), EngineError> {
        let member_id = *self
            .subscription_members
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value();
        let member = self.get_member(&member_id).ok_or(EngineError::NotFound(member_id))?;
        let mut guard = member.write().await;
        let period = guard.subscription(id).ok_or(EngineError::NotFound(id))?;
        if period.status == SubscriptionStatus::Closed {
            return Err(EngineError::InvalidRequest("subscription already closed"));
        }

        let event = Event::SubscriptionClosed { id, member_id };
        self.wal_append(&event).await?;
        apply_member_event(&mut guard, &event);
        Ok(())
    }

    /// Grant entitlement entries, all-or-nothing. Rows may span several
    /// members; their locks are acquired in sorted order to prevent
    /// deadlock against concurrent grants.
    pub async fn grant_entitlements(
        &self,
        rows: Vec<(Ulid, Ulid, String, u32)>, // (entry id, subscription id, benefit, allocated)
    ) -> Result<(), EngineError> {
        if rows.is_empty() {
            return Ok(());
        }
        if rows.len() > MAX_ENTITLEMENT_BATCH {
            return Err(EngineError::LimitExceeded("entitlement batch too large"));
        }
        for (entry_id, _, benefit, _) in &rows {
            if benefit.is_empty() || benefit.len() > MAX_BENEFIT_LEN {
                return Err(EngineError::InvalidRequest("bad benefit name"));
            }
            if self.entry_exists(entry_id) {
                return Err(EngineError::AlreadyExists(*entry_id));
            }
        }

        // Resolve each subscription to its member.
        let mut events = Vec::with_capacity(rows.len());
        let mut member_ids = Vec::new();
        for (entry_id, subscription_id, benefit, allocated) in rows {
            let member_id = *self
                .subscription_members
                .get(&subscription_id)
                .ok_or(EngineError::NotFound(subscription_id))?
                .value();
            member_ids.push(member_id);
            events.push(Event::LedgerEntryCreated {
                id: entry_id,
                subscription_id,
                member_id,
                benefit,
                allocated,
                used: 0,
            });
        }

        member_ids.sort();
        member_ids.dedup();

        let mut guards = Vec::with_capacity(member_ids.len());
        let mut guard_index = HashMap::new();
        for mid in &member_ids {
            let member = self.get_member(mid).ok_or(EngineError::NotFound(*mid))?;
            guard_index.insert(*mid, guards.len());
            guards.push(member.write_owned().await);
        }

        // Phase 1: validate against current state + intra-batch duplicates.
        let mut batch_benefits: HashMap<Ulid, Vec<String>> = HashMap::new();
        for event in &events {
            let Event::LedgerEntryCreated { subscription_id, member_id, benefit, .. } = event else {
                unreachable!()
            };
            let guard = &guards[guard_index[member_id]];
            let period = guard
                .subscription(*subscription_id)
                .ok_or(EngineError::NotFound(*subscription_id))?;
            if period.entries.len() >= MAX_ENTRIES_PER_SUBSCRIPTION {
                return Err(EngineError::LimitExceeded("too many entries on subscription"));
            }
            let duplicate = period
                .entries
                .iter()
                .map(|e| e.benefit.as_str())
                .chain(
                    batch_benefits
                        .get(subscription_id)
                        .into_iter()
                        .flatten()
                        .map(String::as_str),
                )
                .any(|b| b.eq_ignore_ascii_case(benefit));
            if duplicate {
                return Err(EngineError::InvalidRequest("benefit already granted for period"));
            }
            batch_benefits
                .entry(*subscription_id)
                .or_default()
                .push(benefit.clone());
        }

        // Phase 2: all validated — commit.
        for event in events {
            self.wal_append(&event).await?;
            let Event::LedgerEntryCreated { member_id, .. } = &event else {
                unreachable!()
            };
            apply_member_event(&mut guards[guard_index[member_id]], &event);
        }
        Ok(())
    }

    fn entry_exists(&self, entry_id: &Ulid) -> bool {
        self.members.iter().any(|m| {
            m.value()
                .try_read()
                .is_ok_and(|g| ledger::entry_by_id(&g, *entry_id).is_some())
        })
    }

    // ── Resource catalog ─────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        max_capacity: u32,
        linked_benefit: Option<String>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if max_capacity == 0 {
            return Err(EngineError::InvalidRequest("max_capacity must be at least 1"));
        }
        if let Some(b) = &linked_benefit
            && (b.is_empty() || b.len() > MAX_BENEFIT_LEN)
        {
            return Err(EngineError::InvalidRequest("bad benefit name"));
        }
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            max_capacity,
            linked_benefit: linked_benefit.clone(),
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, max_capacity, linked_benefit);
        self.resources.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        max_capacity: u32,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if max_capacity == 0 {
            return Err(EngineError::InvalidRequest("max_capacity must be at least 1"));
        }
        let resource = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = resource.write().await;

        let event = Event::ResourceUpdated { id, name, max_capacity };
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard, &event);
        Ok(())
    }

    /// Retire rather than delete: reservation rows are audit-retained and
    /// must keep resolving their resource.
    pub async fn retire_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let resource = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = resource.write().await;
        if !guard.is_active {
            return Err(EngineError::ResourceUnavailable(id));
        }

        let event = Event::ResourceRetired { id };
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard, &event);
        Ok(())
    }

    pub async fn add_slot(
        &self,
        id: Ulid,
        resource_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<(), EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRequest("slot start must be before end"));
        }
        if self.slot_resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let resource = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = resource.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }

        let event = Event::SlotAdded { id, resource_id, weekday, start, end };
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard, &event);
        self.index_event(&event);
        Ok(())
    }

    pub async fn retire_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let resource_id = *self
            .slot_resources
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value();
        let resource = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = resource.write().await;
        let slot = guard.slot(id).ok_or(EngineError::NotFound(id))?;
        if !slot.is_active {
            return Err(EngineError::SlotUnavailable(id));
        }

        let event = Event::SlotRetired { id, resource_id };
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard, &event);
        Ok(())
    }

    // ── Reservation lifecycle ────────────────────────────────

    /// Reserve one unit of slot capacity and, for benefit-gated resources,
    /// one unit of ledger credit. The duplicate, capacity and credit
    /// checks and the row insert all happen under the member + resource
    /// write locks (member first — the one lock order used everywhere),
    /// so racing callers serialize and the loser sees the updated counts.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        member_id: Ulid,
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
    ) -> Result<ReservationReceipt, EngineError> {
        validate_date(date)?;
        if self.reservation_refs.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let member = self.get_member(&member_id).ok_or(EngineError::NotFound(member_id))?;
        let resource = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;

        let mut member_guard = member.write_owned().await;
        let mut resource_guard = resource.write_owned().await;

        catalog::ensure_bookable(&resource_guard)?;
        let slot = catalog::slot_on(&resource_guard, slot_id, date)?;
        let (start, end) = (slot.start, slot.end);
        if resource_guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        // Entitlement resolution first: a member who cannot use the
        // resource at all never sees SlotFull.
        let ledger_entry = match resource_guard.linked_benefit.clone() {
            Some(benefit) => Some(ledger::resolve_entry(&member_guard, &benefit)?.id),
            None => None,
        };

        capacity::check_member_free(&resource_guard, member_id, slot_id, date)?;
        capacity::check_capacity(&resource_guard, slot_id, date)
            .inspect_err(|_| metrics::counter!(crate::observability::SLOT_FULL_TOTAL).increment(1))?;
        if let Some(entry_id) = ledger_entry {
            let entry = ledger::entry_by_id_mut(&mut member_guard, entry_id)
                .ok_or(EngineError::NotFound(entry_id))?;
            if entry.remaining() == 0 {
                metrics::counter!(crate::observability::INSUFFICIENT_CREDITS_TOTAL).increment(1);
                return Err(EngineError::InsufficientCredits {
                    remaining: entry.remaining(),
                    allocated: entry.allocated,
                });
            }
        }

        let event = Event::ReservationConfirmed {
            id,
            member_id,
            resource_id,
            slot_id,
            date,
            ledger_entry,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        apply_member_event(&mut member_guard, &event);
        apply_resource_event(&mut resource_guard, &event);
        self.index_event(&event);

        let remaining_credits =
            ledger_entry.and_then(|eid| ledger::entry_by_id(&member_guard, eid).map(|e| e.remaining()));

        metrics::counter!(crate::observability::RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        self.notify.send(
            resource_id,
            &Notice::confirmed(id, member_id, &resource_guard.name, date, start),
        );

        Ok(ReservationReceipt {
            reservation_id: id,
            resource_name: resource_guard.name.clone(),
            date,
            start,
            end,
            remaining_credits,
        })
    }

    /// Cancel a confirmed reservation: release capacity and refund the
    /// debited credit (if any) exactly once, in one atomic unit.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        cancelled_by: Option<String>,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_actor(&cancelled_by)?;
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let refs = self.reservation_ref(&id).ok_or(EngineError::NotFound(id))?;
        let member = self
            .get_member(&refs.member_id)
            .ok_or(EngineError::NotFound(refs.member_id))?;
        let resource = self
            .get_resource(&refs.resource_id)
            .ok_or(EngineError::NotFound(refs.resource_id))?;

        let mut member_guard = member.write_owned().await;
        let mut resource_guard = resource.write_owned().await;

        let resv = resource_guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if resv.status != ReservationStatus::Confirmed {
            return Err(EngineError::already_closed(id, resv.status));
        }
        // The Confirmed guard above is what makes the refund exactly-once:
        // a second cancel can never reach this point.
        let refund_entry = resv.ledger_entry;
        let (date, slot_id) = (resv.date, resv.slot_id);

        let event = Event::ReservationCancelled {
            id,
            resource_id: refs.resource_id,
            member_id: refs.member_id,
            refund_entry,
            actor: cancelled_by,
            reason,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        apply_member_event(&mut member_guard, &event);
        apply_resource_event(&mut resource_guard, &event);

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        let start = resource_guard.slot(slot_id).map(|s| s.start).unwrap_or(NaiveTime::MIN);
        self.notify.send(
            refs.resource_id,
            &Notice::cancelled(id, refs.member_id, &resource_guard.name, date, start),
        );
        Ok(())
    }

    /// Mark attendance. Capacity stays held; the credit stays consumed.
    pub async fn mark_attended(&self, id: Ulid, actor: Option<String>) -> Result<(), EngineError> {
        self.close_with_status(id, actor, ReservationStatus::Attended).await
    }

    /// Mark a no-show. Capacity is released; the credit is forfeited
    /// (no refund — see the transition table).
    pub async fn mark_no_show(&self, id: Ulid, actor: Option<String>) -> Result<(), EngineError> {
        self.close_with_status(id, actor, ReservationStatus::NoShow).await
    }

    async fn close_with_status(
        &self,
        id: Ulid,
        actor: Option<String>,
        status: ReservationStatus,
    ) -> Result<(), EngineError> {
        validate_actor(&actor)?;
        let refs = self.reservation_ref(&id).ok_or(EngineError::NotFound(id))?;
        let resource = self
            .get_resource(&refs.resource_id)
            .ok_or(EngineError::NotFound(refs.resource_id))?;
        let mut guard = resource.write().await;

        let resv = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if resv.status != ReservationStatus::Confirmed {
            return Err(EngineError::already_closed(id, resv.status));
        }

        let event = match status {
            ReservationStatus::Attended => Event::ReservationAttended {
                id,
                resource_id: refs.resource_id,
                actor,
                at: now_ms(),
            },
            ReservationStatus::NoShow => Event::ReservationNoShow {
                id,
                resource_id: refs.resource_id,
                actor,
                at: now_ms(),
            },
            _ => return Err(EngineError::InvalidRequest("not an attendance status")),
        };
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard, &event);
        Ok(())
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the WAL with the minimal events that recreate current
    /// state: catalog and membership rows, ledger entries with their
    /// current counts, and reservation rows restored verbatim (no ledger
    /// side effects on replay).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let member_ids: Vec<Ulid> = self.members.iter().map(|e| *e.key()).collect();
        for mid in member_ids {
            let Some(member) = self.get_member(&mid) else { continue };
            let guard = member.read().await;
            events.push(Event::MemberRegistered { id: guard.id, name: guard.name.clone() });
            for period in &guard.subscriptions {
                events.push(Event::SubscriptionActivated {
                    id: period.id,
                    member_id: guard.id,
                    plan: period.plan.clone(),
                    starts_on: period.starts_on,
                    ends_on: period.ends_on,
                });
                for entry in &period.entries {
                    events.push(Event::LedgerEntryCreated {
                        id: entry.id,
                        subscription_id: period.id,
                        member_id: guard.id,
                        benefit: entry.benefit.clone(),
                        allocated: entry.allocated,
                        used: entry.used,
                    });
                }
                if period.status == SubscriptionStatus::Closed {
                    events.push(Event::SubscriptionClosed { id: period.id, member_id: guard.id });
                }
            }
        }

        let resource_ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        for rid in resource_ids {
            let Some(resource) = self.get_resource(&rid) else { continue };
            let guard = resource.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                max_capacity: guard.max_capacity,
                linked_benefit: guard.linked_benefit.clone(),
            });
            for slot in &guard.slots {
                events.push(Event::SlotAdded {
                    id: slot.id,
                    resource_id: guard.id,
                    weekday: slot.weekday,
                    start: slot.start,
                    end: slot.end,
                });
                if !slot.is_active {
                    events.push(Event::SlotRetired { id: slot.id, resource_id: guard.id });
                }
            }
            for resv in &guard.reservations {
                events.push(Event::ReservationRestored {
                    resource_id: guard.id,
                    member_id: resv.member_id,
                    reservation: resv.clone(),
                });
            }
            if !guard.is_active {
                events.push(Event::ResourceRetired { id: guard.id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
