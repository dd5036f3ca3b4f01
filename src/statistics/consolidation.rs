//! Derivation of aggregated statistics rows from their children.
//!
//! Only (Monthly, NodeAccount) rows are collected from daemons. Every other
//! row is the sum of a fixed set of child rows given by [`dependency`].

use std::collections::BTreeMap;

use crate::db::entities::prelude::{Granularity, Period, StatTarget, StatisticModel, TargetKind};

/// Assignment id to (node id, account id).
pub type Memberships = BTreeMap<i32, (i32, i32)>;

/// The (kind, granularity) of the rows a (granularity, kind) row is summed
/// from. `None` for collected leaves.
pub fn dependency(granularity: Granularity, kind: TargetKind) -> Option<(TargetKind, Granularity)> {
    match (granularity, kind) {
        (Granularity::Monthly, TargetKind::NodeAccount) => None,
        (Granularity::Monthly, TargetKind::Node)
        | (Granularity::Monthly, TargetKind::Account)
        | (Granularity::Monthly, TargetKind::Fleet) => Some((TargetKind::NodeAccount, Granularity::Monthly)),
        (Granularity::Yearly, kind) => Some((kind, Granularity::Monthly)),
        (Granularity::Total, kind) => Some((kind, Granularity::Yearly)),
    }
}

fn period_matches(parent: &Period, child: &Period) -> bool {
    if parent.granularity() == child.granularity() {
        parent == child
    } else {
        parent.is_parent_of(child)
    }
}

fn target_matches(parent: StatTarget, child: StatTarget, memberships: &Memberships) -> bool {
    match (parent, child) {
        (StatTarget::Fleet, _) => true,
        (StatTarget::NodeAccount(a), StatTarget::NodeAccount(b)) => a == b,
        (StatTarget::Node(a), StatTarget::Node(b)) => a == b,
        (StatTarget::Account(a), StatTarget::Account(b)) => a == b,
        (StatTarget::Node(node), StatTarget::NodeAccount(id)) => {
            memberships.get(&id).is_some_and(|(n, _)| *n == node)
        }
        (StatTarget::Account(account), StatTarget::NodeAccount(id)) => {
            memberships.get(&id).is_some_and(|(_, a)| *a == account)
        }
        _ => false,
    }
}

/// The rows of `rows` that (period, target) is summed from.
pub fn children<'a>(
    period: Period,
    target: StatTarget,
    rows: &'a [StatisticModel],
    memberships: &'a Memberships,
) -> impl Iterator<Item = &'a StatisticModel> + 'a {
    let dep = dependency(period.granularity(), target.kind());
    rows.iter().filter(move |row| match dep {
        Some((kind, granularity)) => {
            row.target.kind() == kind
                && row.period.granularity() == granularity
                && period_matches(&period, &row.period)
                && target_matches(target, row.target, memberships)
        }
        None => false,
    })
}

/// Sums the children of (period, target). `None` for a collected leaf.
///
/// Past and live counters are summed separately, the collection time is the
/// latest of the children.
pub fn consolidate(
    period: Period,
    target: StatTarget,
    rows: &[StatisticModel],
    memberships: &Memberships,
) -> Option<StatisticModel> {
    dependency(period.granularity(), target.kind())?;
    let mut row = StatisticModel::empty(period, target);
    for child in children(period, target, rows, memberships) {
        row.transferred_past = row.transferred_past.saturating_add(child.transferred_past);
        row.transferred_live = row.transferred_live.saturating_add(child.transferred_live);
        row.dt_collected = row.dt_collected.max(child.dt_collected);
    }
    Some(row)
}
