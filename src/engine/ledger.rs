use ulid::Ulid;

use crate::model::{LedgerEntry, MemberState, SubscriptionPeriod, SubscriptionStatus};

use super::EngineError;

/// The authoritative subscription period: the Active one ending last.
/// "Exactly one Active" is enforced upstream; if that invariant slips,
/// selection stays deterministic.
pub(crate) fn active_period(member: &MemberState) -> Option<&SubscriptionPeriod> {
    member
        .subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .max_by_key(|s| s.ends_on)
}

fn active_period_mut(member: &mut MemberState) -> Option<&mut SubscriptionPeriod> {
    member
        .subscriptions
        .iter_mut()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .max_by_key(|s| s.ends_on)
}

/// Resolve the member's ledger entry for `benefit` (case-insensitive)
/// within the active period. Callers hold at least the member read lock.
pub(crate) fn resolve_entry<'a>(
    member: &'a MemberState,
    benefit: &str,
) -> Result<&'a LedgerEntry, EngineError> {
    let period = active_period(member).ok_or(EngineError::NoActiveSubscription {
        member_id: member.id,
    })?;
    period
        .entries
        .iter()
        .find(|e| e.benefit.eq_ignore_ascii_case(benefit))
        .ok_or_else(|| EngineError::BenefitNotGranted {
            benefit: benefit.to_string(),
        })
}

/// Mutable variant used inside the create/cancel atomic unit. Callers
/// hold the member write lock.
pub(crate) fn resolve_entry_mut<'a>(
    member: &'a mut MemberState,
    benefit: &str,
) -> Result<&'a mut LedgerEntry, EngineError> {
    let member_id = member.id;
    let period = active_period_mut(member).ok_or(EngineError::NoActiveSubscription { member_id })?;
    period
        .entries
        .iter_mut()
        .find(|e| e.benefit.eq_ignore_ascii_case(benefit))
        .ok_or_else(|| EngineError::BenefitNotGranted {
            benefit: benefit.to_string(),
        })
}

/// Locate an entry by id across all periods (refund path, receipts).
pub(crate) fn entry_by_id(member: &MemberState, entry_id: Ulid) -> Option<&LedgerEntry> {
    member
        .subscriptions
        .iter()
        .flat_map(|s| s.entries.iter())
        .find(|e| e.id == entry_id)
}

pub(crate) fn entry_by_id_mut(member: &mut MemberState, entry_id: Ulid) -> Option<&mut LedgerEntry> {
    member
        .subscriptions
        .iter_mut()
        .flat_map(|s| s.entries.iter_mut())
        .find(|e| e.id == entry_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn period(status: SubscriptionStatus, ends_on: NaiveDate, entries: Vec<LedgerEntry>) -> SubscriptionPeriod {
        SubscriptionPeriod {
            id: Ulid::new(),
            plan: "Gold".into(),
            starts_on: date(2026, 1, 1),
            ends_on,
            status,
            entries,
        }
    }

    #[test]
    fn no_subscriptions_means_no_active_period() {
        let member = MemberState::new(Ulid::new(), "Alice".into());
        assert!(active_period(&member).is_none());
        assert!(matches!(
            resolve_entry(&member, "Pool Access"),
            Err(EngineError::NoActiveSubscription { .. })
        ));
    }

    #[test]
    fn closed_period_is_not_authoritative() {
        let mut member = MemberState::new(Ulid::new(), "Alice".into());
        member.subscriptions.push(period(
            SubscriptionStatus::Closed,
            date(2026, 12, 31),
            vec![LedgerEntry::new(Ulid::new(), "Pool Access".into(), 10)],
        ));
        assert!(matches!(
            resolve_entry(&member, "Pool Access"),
            Err(EngineError::NoActiveSubscription { .. })
        ));
    }

    #[test]
    fn most_recently_ending_active_period_wins() {
        let mut member = MemberState::new(Ulid::new(), "Alice".into());
        let short = LedgerEntry::new(Ulid::new(), "Pool Access".into(), 1);
        let long = LedgerEntry::new(Ulid::new(), "Pool Access".into(), 20);
        let long_id = long.id;
        member
            .subscriptions
            .push(period(SubscriptionStatus::Active, date(2026, 6, 30), vec![short]));
        member
            .subscriptions
            .push(period(SubscriptionStatus::Active, date(2026, 12, 31), vec![long]));

        let entry = resolve_entry(&member, "Pool Access").unwrap();
        assert_eq!(entry.id, long_id);
    }

    #[test]
    fn benefit_name_matches_case_insensitively() {
        let mut member = MemberState::new(Ulid::new(), "Alice".into());
        member.subscriptions.push(period(
            SubscriptionStatus::Active,
            date(2026, 12, 31),
            vec![LedgerEntry::new(Ulid::new(), "Pool Access".into(), 5)],
        ));
        assert!(resolve_entry(&member, "pool access").is_ok());
        assert!(resolve_entry(&member, "POOL ACCESS").is_ok());
        assert!(matches!(
            resolve_entry(&member, "Sauna"),
            Err(EngineError::BenefitNotGranted { .. })
        ));
    }

    #[test]
    fn entry_by_id_searches_all_periods() {
        let mut member = MemberState::new(Ulid::new(), "Alice".into());
        let old = LedgerEntry::new(Ulid::new(), "Pool Access".into(), 3);
        let old_id = old.id;
        member
            .subscriptions
            .push(period(SubscriptionStatus::Closed, date(2025, 12, 31), vec![old]));
        member
            .subscriptions
            .push(period(SubscriptionStatus::Active, date(2026, 12, 31), vec![]));

        assert!(entry_by_id(&member, old_id).is_some());
        assert!(entry_by_id(&member, Ulid::new()).is_none());
    }
}
