//! Deterministic bucket assignment.
//!
//! Every node applies the same ordered stream of changes to the same group
//! table, so every function here must depend only on the table itself:
//! members are iterated in address order and buckets in id order.

use crate::partitioning::ownership::{Group, GroupMember};
use crate::types::{BucketId, ClusterNodeAddress};
use std::collections::BTreeMap;

/// What happened to a bucket while applying a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketChangeKind {
    /// An unowned bucket got an owner without moving data.
    Assigned { to: ClusterNodeAddress },
    /// A handoff from `from` to `to` started.
    TransferStarted { from: ClusterNodeAddress, to: ClusterNodeAddress },
    /// A handoff was abandoned; `from` keeps the bucket.
    TransferCancelled { from: ClusterNodeAddress, to: ClusterNodeAddress },
    /// A handoff completed.
    Transferred { from: ClusterNodeAddress, to: ClusterNodeAddress },
    /// The owner departed and a backup took over.
    Promoted { from: ClusterNodeAddress, to: ClusterNodeAddress },
    /// The owner departed without a live backup. The bucket is empty.
    Lost { from: ClusterNodeAddress },
    /// The backup set changed.
    BackupsChanged { backups: Vec<ClusterNodeAddress> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketChange {
    pub bucket: BucketId,
    pub kind: BucketChangeKind,
}

impl BucketChange {
    fn new(bucket: BucketId, kind: BucketChangeKind) -> Self {
        Self { bucket, kind }
    }
}

/// Add `node` to the group (or cancel its leaving) and rebalance.
pub fn add_member(group: &mut Group, node: &ClusterNodeAddress) -> Vec<BucketChange> {
    match group.members.binary_search_by(|m| m.address.cmp(node)) {
        Ok(idx) => group.members[idx].leaving = false,
        Err(idx) => group.members.insert(
            idx,
            GroupMember {
                address: node.clone(),
                leaving: false,
            },
        ),
    }
    rebalance(group)
}

/// Start moving every bucket away from `node`. The member is dropped from the
/// group once it neither owns nor receives a bucket.
pub fn mark_leaving(group: &mut Group, node: &ClusterNodeAddress) -> Vec<BucketChange> {
    match group.members.iter_mut().find(|m| &m.address == node) {
        Some(member) => member.leaving = true,
        None => return Vec::new(),
    }
    rebalance(group)
}

/// Drop departed nodes: promote the first live backup of each bucket they
/// owned, or mark the bucket lost, then rebalance.
pub fn remove_members(group: &mut Group, departed: &[ClusterNodeAddress]) -> Vec<BucketChange> {
    let before = group.members.len();
    group.members.retain(|m| !departed.contains(&m.address));
    if group.members.len() == before {
        return Vec::new();
    }

    let mut changes = Vec::new();
    for (id, bucket) in group.buckets.iter_mut().enumerate() {
        let id = id as BucketId;

        if bucket.pending.as_ref().is_some_and(|p| departed.contains(p)) {
            bucket.pending = None;
        }
        bucket.backups.retain(|b| !departed.contains(b));

        let Some(owner) = bucket.owner.clone() else {
            continue;
        };
        if !departed.contains(&owner) {
            continue;
        }

        let promoted = bucket
            .backups
            .iter()
            .find(|b| group.members.iter().any(|m| &m.address == *b))
            .cloned();
        match promoted {
            Some(to) => {
                bucket.backups.retain(|b| b != &to);
                if bucket.pending.as_ref() == Some(&to) {
                    bucket.pending = None;
                }
                bucket.owner = Some(to.clone());
                changes.push(BucketChange::new(id, BucketChangeKind::Promoted { from: owner, to }));
            }
            None => {
                bucket.owner = None;
                bucket.pending = None;
                changes.push(BucketChange::new(id, BucketChangeKind::Lost { from: owner }));
            }
        }
    }

    changes.extend(rebalance(group));
    changes
}

/// Complete the handoff of `bucket` from `from` to `to`. Returns `None` when
/// the table does not show that handoff in flight.
pub fn commit_transfer(
    group: &mut Group,
    bucket: BucketId,
    from: &ClusterNodeAddress,
    to: &ClusterNodeAddress,
) -> Option<Vec<BucketChange>> {
    let ownership = group.buckets.get_mut(bucket as usize)?;
    if ownership.owner.as_ref() != Some(from) || ownership.pending.as_ref() != Some(to) {
        return None;
    }
    ownership.owner = Some(to.clone());
    ownership.pending = None;

    let mut changes = vec![BucketChange::new(
        bucket,
        BucketChangeKind::Transferred {
            from: from.clone(),
            to: to.clone(),
        },
    )];
    changes.extend(rebalance(group));
    Some(changes)
}

/// Bring planned ownership to an even spread over active members.
///
/// Targets are `B / n` buckets per member; the `B % n` extra buckets go to the
/// members already planned to hold the most, ties broken by address. Only
/// unowned buckets, buckets of leaving members and the surplus of members
/// above target move, the surplus taken from the highest bucket ids.
pub fn rebalance(group: &mut Group) -> Vec<BucketChange> {
    let active: Vec<ClusterNodeAddress> = group.active_members().into_iter().cloned().collect();
    if active.is_empty() {
        // Nobody left to hand buckets to.
        for bucket in group.buckets.iter_mut() {
            bucket.owner = None;
            bucket.pending = None;
            bucket.backups.clear();
        }
        group.members.clear();
        return Vec::new();
    }

    let mut changes = Vec::new();
    let bucket_count = group.bucket_count as usize;
    let n = active.len();
    let base = bucket_count / n;
    let extra = bucket_count % n;

    let mut counts: BTreeMap<ClusterNodeAddress, usize> =
        active.iter().map(|a| (a.clone(), 0)).collect();
    for bucket in &group.buckets {
        if let Some(count) = bucket.planned_owner().and_then(|p| counts.get_mut(p)) {
            *count += 1;
        }
    }

    let mut by_load = active.clone();
    by_load.sort_by(|a, b| counts[b].cmp(&counts[a]).then_with(|| a.cmp(b)));
    let targets: BTreeMap<ClusterNodeAddress, usize> = by_load
        .into_iter()
        .enumerate()
        .map(|(idx, addr)| (addr, base + usize::from(idx < extra)))
        .collect();

    let mut movable = Vec::new();
    for id in (0..bucket_count).rev() {
        match group.buckets[id].planned_owner() {
            None => movable.push(id),
            Some(planned) => match counts.get_mut(planned) {
                None => movable.push(id),
                Some(count) if *count > targets[planned] => {
                    *count -= 1;
                    movable.push(id);
                }
                Some(_) => {}
            },
        }
    }
    movable.reverse();

    for id in movable {
        let current = group.buckets[id].owner.clone();
        let recipient = current
            .as_ref()
            .filter(|o| counts.get(*o).is_some_and(|c| *c < targets[*o]))
            .cloned()
            .or_else(|| active.iter().find(|a| counts[*a] < targets[*a]).cloned());
        let Some(recipient) = recipient else {
            continue;
        };
        if let Some(count) = counts.get_mut(&recipient) {
            *count += 1;
        }

        let bucket = &mut group.buckets[id];
        let id = id as BucketId;
        match bucket.owner.clone() {
            None => {
                bucket.owner = Some(recipient.clone());
                bucket.pending = None;
                changes.push(BucketChange::new(id, BucketChangeKind::Assigned { to: recipient }));
            }
            Some(owner) if owner == recipient => {
                if let Some(to) = bucket.pending.take() {
                    changes.push(BucketChange::new(
                        id,
                        BucketChangeKind::TransferCancelled { from: owner, to },
                    ));
                }
            }
            Some(owner) => {
                if bucket.pending.as_ref() != Some(&recipient) {
                    bucket.pending = Some(recipient.clone());
                    changes.push(BucketChange::new(
                        id,
                        BucketChangeKind::TransferStarted {
                            from: owner,
                            to: recipient,
                        },
                    ));
                }
            }
        }
    }

    changes.extend(assign_backups(group, &active));
    prune_leaving(group);
    changes
}

/// Backups of a bucket are the `replica_count` active members following its
/// owner in address order.
fn assign_backups(group: &mut Group, active: &[ClusterNodeAddress]) -> Vec<BucketChange> {
    let replicas = group.replica_count as usize;
    let mut changes = Vec::new();

    for (id, bucket) in group.buckets.iter_mut().enumerate() {
        let backups: Vec<ClusterNodeAddress> = match &bucket.owner {
            Some(owner) if replicas > 0 => {
                let start = active.partition_point(|a| a <= owner);
                active
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(active.len())
                    .filter(|a| *a != owner)
                    .take(replicas)
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        };

        if backups != bucket.backups {
            bucket.backups = backups.clone();
            changes.push(BucketChange::new(
                id as BucketId,
                BucketChangeKind::BackupsChanged { backups },
            ));
        }
    }
    changes
}

fn prune_leaving(group: &mut Group) {
    let buckets = &group.buckets;
    group.members.retain(|m| {
        !m.leaving
            || buckets
                .iter()
                .any(|b| b.is_owner(&m.address) || b.is_pending(&m.address))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupKey;
    use std::net::SocketAddr;

    fn addr(port: u16) -> ClusterNodeAddress {
        ClusterNodeAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn group(buckets: u32, replicas: u32) -> Group {
        Group::new(GroupKey::cache("orders"), buckets, replicas)
    }

    /// Complete every in-flight handoff.
    fn settle(group: &mut Group) {
        loop {
            let next = group
                .buckets
                .iter()
                .enumerate()
                .find_map(|(id, b)| Some((id as BucketId, b.owner.clone()?, b.pending.clone()?)));
            match next {
                Some((bucket, from, to)) => {
                    commit_transfer(group, bucket, &from, &to).unwrap();
                }
                None => break,
            }
        }
    }

    fn counts(group: &Group) -> Vec<usize> {
        group
            .active_members()
            .into_iter()
            .map(|m| group.owned_buckets(m).len())
            .collect()
    }

    #[test]
    fn test_first_member_gets_everything_directly() {
        let mut g = group(17, 0);
        let changes = add_member(&mut g, &addr(1));

        assert_eq!(g.owned_buckets(&addr(1)).len(), 17);
        assert_eq!(g.transfers_in_flight(), 0);
        assert!(changes
            .iter()
            .all(|c| matches!(c.kind, BucketChangeKind::Assigned { .. })));
    }

    #[test]
    fn test_join_rebalance_counts() {
        let mut g = group(17, 0);
        add_member(&mut g, &addr(1));

        let changes = add_member(&mut g, &addr(2));
        assert_eq!(g.transfers_in_flight(), 8);
        assert!(changes
            .iter()
            .all(|c| matches!(&c.kind, BucketChangeKind::TransferStarted { to, .. } if to == &addr(2))));
        // Surplus moves from the highest bucket ids.
        assert_eq!(g.planned_buckets(&addr(2)), (9..17).collect::<Vec<_>>());
        settle(&mut g);
        assert_eq!(counts(&g), vec![9, 8]);

        add_member(&mut g, &addr(3));
        settle(&mut g);
        assert_eq!(counts(&g), vec![6, 6, 5]);
    }

    #[test]
    fn test_join_during_transfer_uses_planned_counts() {
        let mut g = group(17, 0);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        add_member(&mut g, &addr(3));
        settle(&mut g);

        let mut sorted = counts(&g);
        sorted.sort_unstable();
        assert_eq!(sorted, vec![5, 6, 6]);
        assert_eq!(g.unowned_buckets(), Vec::<BucketId>::new());
    }

    #[test]
    fn test_departure_without_backup_loses_buckets() {
        let mut g = group(17, 0);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        add_member(&mut g, &addr(3));
        settle(&mut g);
        let owned_by_2 = g.owned_buckets(&addr(2));

        let changes = remove_members(&mut g, &[addr(2)]);
        let lost: Vec<BucketId> = changes
            .iter()
            .filter(|c| matches!(c.kind, BucketChangeKind::Lost { .. }))
            .map(|c| c.bucket)
            .collect();
        assert_eq!(lost, owned_by_2);

        // Lost buckets are reassigned empty, without a handoff.
        assert!(g.unowned_buckets().is_empty());
        let mut sorted = counts(&g);
        sorted.sort_unstable();
        assert_eq!(sorted.iter().sum::<usize>(), 17);
        assert!(sorted[1] - sorted[0] <= 1);
    }

    #[test]
    fn test_departure_promotes_backup() {
        let mut g = group(8, 1);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        settle(&mut g);

        for bucket in g.owned_buckets(&addr(1)) {
            assert_eq!(g.bucket(bucket).unwrap().backups, vec![addr(2)]);
        }

        let changes = remove_members(&mut g, &[addr(1)]);
        assert!(changes
            .iter()
            .any(|c| matches!(&c.kind, BucketChangeKind::Promoted { to, .. } if to == &addr(2))));
        assert!(!changes
            .iter()
            .any(|c| matches!(c.kind, BucketChangeKind::Lost { .. })));
        assert_eq!(g.owned_buckets(&addr(2)).len(), 8);
    }

    #[test]
    fn test_departed_pending_target_is_cleared() {
        let mut g = group(4, 0);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        assert_eq!(g.transfers_in_flight(), 2);

        remove_members(&mut g, &[addr(2)]);
        assert_eq!(g.transfers_in_flight(), 0);
        assert_eq!(g.owned_buckets(&addr(1)).len(), 4);
    }

    #[test]
    fn test_leaving_member_hands_off_then_is_removed() {
        let mut g = group(6, 0);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        settle(&mut g);

        mark_leaving(&mut g, &addr(2));
        assert!(g.is_member(&addr(2)));
        assert_eq!(g.planned_buckets(&addr(1)).len(), 6);

        settle(&mut g);
        assert!(!g.is_member(&addr(2)));
        assert_eq!(g.owned_buckets(&addr(1)).len(), 6);
    }

    #[test]
    fn test_last_member_leaving_empties_group() {
        let mut g = group(4, 0);
        add_member(&mut g, &addr(1));
        mark_leaving(&mut g, &addr(1));
        assert!(g.members().is_empty());
        assert_eq!(g.unowned_buckets().len(), 4);
    }

    #[test]
    fn test_rejoin_cancels_transfer() {
        let mut g = group(4, 0);
        add_member(&mut g, &addr(1));
        add_member(&mut g, &addr(2));
        settle(&mut g);

        mark_leaving(&mut g, &addr(2));
        assert_eq!(g.transfers_in_flight(), 2);

        let changes = add_member(&mut g, &addr(2));
        assert_eq!(g.transfers_in_flight(), 0);
        assert_eq!(
            changes
                .iter()
                .filter(|c| matches!(c.kind, BucketChangeKind::TransferCancelled { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_commit_rejects_stale_transfer() {
        let mut g = group(4, 0);
        add_member(&mut g, &addr(1));
        assert!(commit_transfer(&mut g, 0, &addr(1), &addr(2)).is_none());
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let build = || {
            let mut g = group(271, 1);
            for port in [5, 3, 9, 1] {
                add_member(&mut g, &addr(port));
            }
            remove_members(&mut g, &[addr(9)]);
            g
        };
        assert_eq!(build(), build());
    }
}
