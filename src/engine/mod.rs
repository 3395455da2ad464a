mod capacity;
mod catalog;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedMemberState = Arc<RwLock<MemberState>>;
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Where a reservation lives: the resource that owns its row and the
/// member whose ledger it may have debited.
#[derive(Debug, Clone, Copy)]
pub struct ReservationRef {
    pub resource_id: Ulid,
    pub member_id: Ulid,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) members: DashMap<Ulid, SharedMemberState>,
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// subscription id → member id
    pub(super) subscription_members: DashMap<Ulid, Ulid>,
    /// slot id → resource id (retired slots stay mapped — rows reference them)
    pub(super) slot_resources: DashMap<Ulid, Ulid>,
    /// reservation id → owning resource + member
    pub(super) reservation_refs: DashMap<Ulid, ReservationRef>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply the member-side effect of an event (subscription bookkeeping,
/// ledger debit/credit). No locking — caller holds the member write lock.
fn apply_member_event(member: &mut MemberState, event: &Event) {
    match event {
        Event::SubscriptionActivated { id, plan, starts_on, ends_on, .. } => {
            member.subscriptions.push(SubscriptionPeriod {
                id: *id,
                plan: plan.clone(),
                starts_on: *starts_on,
                ends_on: *ends_on,
                status: SubscriptionStatus::Active,
                entries: Vec::new(),
            });
        }
        Event::SubscriptionClosed { id, .. } => {
            if let Some(period) = member.subscription_mut(*id) {
                period.status = SubscriptionStatus::Closed;
            }
        }
        Event::LedgerEntryCreated { id, subscription_id, benefit, allocated, used, .. } => {
            if let Some(period) = member.subscription_mut(*subscription_id) {
                period.entries.push(LedgerEntry {
                    id: *id,
                    benefit: benefit.clone(),
                    allocated: *allocated,
                    used: *used,
                });
            }
        }
        Event::ReservationConfirmed { ledger_entry: Some(entry_id), .. } => {
            let member_id = member.id;
            match ledger::entry_by_id_mut(member, *entry_id) {
                Some(entry) => {
                    if entry.debit().is_err() {
                        // Checked before the event was written; seeing it
                        // here means the WAL and state disagree.
                        warn!(member = %member_id, entry = %entry_id, "debit on exhausted ledger entry");
                    }
                }
                None => warn!(member = %member_id, entry = %entry_id, "debit for unknown ledger entry"),
            }
        }
        Event::ReservationCancelled { refund_entry: Some(entry_id), .. } => {
            let member_id = member.id;
            match ledger::entry_by_id_mut(member, *entry_id) {
                Some(entry) => entry.credit(),
                None => warn!(member = %member_id, entry = %entry_id, "refund for unknown ledger entry"),
            }
        }
        _ => {}
    }
}

/// Apply the resource-side effect of an event (catalog changes, the
/// reservation row itself). No locking — caller holds the resource write lock.
fn apply_resource_event(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ResourceUpdated { name, max_capacity, .. } => {
            rs.name = name.clone();
            rs.max_capacity = *max_capacity;
        }
        Event::ResourceRetired { .. } => {
            rs.is_active = false;
        }
        Event::SlotAdded { id, weekday, start, end, .. } => {
            rs.slots.push(Slot {
                id: *id,
                weekday: *weekday,
                start: *start,
                end: *end,
                is_active: true,
            });
        }
        Event::SlotRetired { id, .. } => {
            if let Some(slot) = rs.slot_mut(*id) {
                slot.is_active = false;
            }
        }
        Event::ReservationConfirmed { id, member_id, slot_id, date, ledger_entry, at, .. } => {
            rs.reservations.push(Reservation {
                id: *id,
                member_id: *member_id,
                slot_id: *slot_id,
                date: *date,
                status: ReservationStatus::Confirmed,
                ledger_entry: *ledger_entry,
                created_at: *at,
                closed_at: None,
                closed_by: None,
                cancel_reason: None,
            });
        }
        Event::ReservationCancelled { id, actor, reason, at, .. } => {
            if let Some(resv) = rs.reservation_mut(*id) {
                resv.status = ReservationStatus::Cancelled;
                resv.closed_at = Some(*at);
                resv.closed_by = actor.clone();
                resv.cancel_reason = reason.clone();
            }
        }
        Event::ReservationAttended { id, actor, at, .. } => {
            if let Some(resv) = rs.reservation_mut(*id) {
                resv.status = ReservationStatus::Attended;
                resv.closed_at = Some(*at);
                resv.closed_by = actor.clone();
            }
        }
        Event::ReservationNoShow { id, actor, at, .. } => {
            if let Some(resv) = rs.reservation_mut(*id) {
                resv.status = ReservationStatus::NoShow;
                resv.closed_at = Some(*at);
                resv.closed_by = actor.clone();
            }
        }
        Event::ReservationRestored { reservation, .. } => {
            rs.reservations.push(reservation.clone());
        }
        // MemberRegistered/SubscriptionActivated/.../ResourceCreated are
        // handled at the map level or on the member side.
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            members: DashMap::new(),
            resources: DashMap::new(),
            subscription_members: DashMap::new(),
            slot_resources: DashMap::new(),
            reservation_refs: DashMap::new(),
            wal_tx,
            notify,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never block here: this may
        // run inside an async context.
        for event in &events {
            match event {
                Event::MemberRegistered { id, name } => {
                    engine
                        .members
                        .insert(*id, Arc::new(RwLock::new(MemberState::new(*id, name.clone()))));
                }
                Event::ResourceCreated { id, name, max_capacity, linked_benefit } => {
                    let rs = ResourceState::new(*id, name.clone(), *max_capacity, linked_benefit.clone());
                    engine.resources.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    if let Some(member_id) = event_member_id(other)
                        && let Some(entry) = engine.members.get(&member_id)
                    {
                        let arc = entry.value().clone();
                        drop(entry);
                        let mut guard = arc.try_write().expect("replay: uncontended write");
                        apply_member_event(&mut guard, other);
                    }
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.resources.get(&resource_id)
                    {
                        let arc = entry.value().clone();
                        drop(entry);
                        let mut guard = arc.try_write().expect("replay: uncontended write");
                        apply_resource_event(&mut guard, other);
                    }
                }
            }
            engine.index_event(event);
        }

        Ok(engine)
    }

    /// Maintain the reverse-lookup indexes for an event. Idempotent;
    /// called on replay and after every runtime apply.
    pub(super) fn index_event(&self, event: &Event) {
        match event {
            Event::SubscriptionActivated { id, member_id, .. } => {
                self.subscription_members.insert(*id, *member_id);
            }
            Event::SlotAdded { id, resource_id, .. } => {
                self.slot_resources.insert(*id, *resource_id);
            }
            Event::ReservationConfirmed { id, member_id, resource_id, .. } => {
                self.reservation_refs.insert(
                    *id,
                    ReservationRef { resource_id: *resource_id, member_id: *member_id },
                );
            }
            Event::ReservationRestored { resource_id, member_id, reservation } => {
                self.reservation_refs.insert(
                    reservation.id,
                    ReservationRef { resource_id: *resource_id, member_id: *member_id },
                );
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_member(&self, id: &Ulid) -> Option<SharedMemberState> {
        self.members.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn reservation_ref(&self, id: &Ulid) -> Option<ReservationRef> {
        self.reservation_refs.get(id).map(|e| *e.value())
    }
}

/// The member whose state an event mutates, if any.
fn event_member_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SubscriptionActivated { member_id, .. }
        | Event::SubscriptionClosed { member_id, .. }
        | Event::LedgerEntryCreated { member_id, .. }
        | Event::ReservationConfirmed { member_id, .. }
        | Event::ReservationCancelled { member_id, .. } => Some(*member_id),
        _ => None,
    }
}

/// The resource whose state an event mutates, if any.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceUpdated { id, .. } | Event::ResourceRetired { id } => Some(*id),
        Event::SlotAdded { resource_id, .. }
        | Event::SlotRetired { resource_id, .. }
        | Event::ReservationConfirmed { resource_id, .. }
        | Event::ReservationCancelled { resource_id, .. }
        | Event::ReservationAttended { resource_id, .. }
        | Event::ReservationNoShow { resource_id, .. }
        | Event::ReservationRestored { resource_id, .. } => Some(*resource_id),
        _ => None,
    }
}
