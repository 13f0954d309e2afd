//! Group ownership tables and queries over them.

use crate::partitioning::bucket::{bucket_of, BucketOwnership};
use crate::types::{BucketId, ClusterNodeAddress, GroupKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role of a node for a specific bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipRole {
    /// Serves reads and writes for the bucket.
    Primary,
    /// Receiving the bucket from the current primary.
    Incoming,
    /// Holds a replica.
    Backup,
    /// Should not hold the bucket.
    None,
}

/// A node participating in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: ClusterNodeAddress,
    /// Handing its buckets off before leaving the group.
    pub leaving: bool,
}

/// One partitioned group: its members and bucket ownership table.
///
/// Members are kept sorted by address so that every node iterating them sees
/// the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub(crate) key: GroupKey,
    pub(crate) bucket_count: u32,
    pub(crate) replica_count: u32,
    pub(crate) members: Vec<GroupMember>,
    pub(crate) buckets: Vec<BucketOwnership>,
}

impl Group {
    /// Empty group with every bucket unowned.
    pub fn new(key: GroupKey, bucket_count: u32, replica_count: u32) -> Self {
        Self {
            key,
            bucket_count,
            replica_count,
            members: Vec::new(),
            buckets: vec![BucketOwnership::default(); bucket_count as usize],
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn is_member(&self, node: &ClusterNodeAddress) -> bool {
        self.members.iter().any(|m| &m.address == node)
    }

    pub fn is_leaving(&self, node: &ClusterNodeAddress) -> bool {
        self.members.iter().any(|m| &m.address == node && m.leaving)
    }

    /// Members not leaving, in address order.
    pub fn active_members(&self) -> Vec<&ClusterNodeAddress> {
        self.members
            .iter()
            .filter(|m| !m.leaving)
            .map(|m| &m.address)
            .collect()
    }

    pub fn buckets(&self) -> &[BucketOwnership] {
        &self.buckets
    }

    pub fn bucket(&self, bucket: BucketId) -> Option<&BucketOwnership> {
        self.buckets.get(bucket as usize)
    }

    /// Bucket a key falls into in this group.
    pub fn bucket_of(&self, key: &[u8]) -> BucketId {
        bucket_of(key, self.bucket_count)
    }

    pub fn owner_of_bucket(&self, bucket: BucketId) -> Option<&ClusterNodeAddress> {
        self.bucket(bucket).and_then(|b| b.owner.as_ref())
    }

    /// Bucket and current primary owner of a key.
    pub fn owner_of(&self, key: &[u8]) -> (BucketId, Option<&ClusterNodeAddress>) {
        let bucket = self.bucket_of(key);
        (bucket, self.owner_of_bucket(bucket))
    }

    /// Buckets whose primary is `node`.
    pub fn owned_buckets(&self, node: &ClusterNodeAddress) -> Vec<BucketId> {
        self.bucket_ids()
            .filter(|&b| self.buckets[b as usize].is_owner(node))
            .collect()
    }

    /// Buckets `node` will own once in-flight transfers complete.
    pub fn planned_buckets(&self, node: &ClusterNodeAddress) -> Vec<BucketId> {
        self.bucket_ids()
            .filter(|&b| self.buckets[b as usize].planned_owner() == Some(node))
            .collect()
    }

    pub fn role(&self, bucket: BucketId, node: &ClusterNodeAddress) -> OwnershipRole {
        match self.bucket(bucket) {
            Some(b) if b.is_owner(node) => OwnershipRole::Primary,
            Some(b) if b.is_pending(node) => OwnershipRole::Incoming,
            Some(b) if b.backups.contains(node) => OwnershipRole::Backup,
            _ => OwnershipRole::None,
        }
    }

    /// Primary owners with the buckets they serve.
    pub fn group_map(&self) -> BTreeMap<ClusterNodeAddress, Vec<BucketId>> {
        let mut map: BTreeMap<ClusterNodeAddress, Vec<BucketId>> = BTreeMap::new();
        for (id, bucket) in self.buckets.iter().enumerate() {
            if let Some(owner) = &bucket.owner {
                map.entry(owner.clone()).or_default().push(id as BucketId);
            }
        }
        map
    }

    /// Number of buckets with a handoff in flight.
    pub fn transfers_in_flight(&self) -> usize {
        self.buckets.iter().filter(|b| b.in_transfer()).count()
    }

    /// Buckets without a primary.
    pub fn unowned_buckets(&self) -> Vec<BucketId> {
        self.bucket_ids()
            .filter(|&b| self.buckets[b as usize].owner.is_none())
            .collect()
    }

    fn bucket_ids(&self) -> impl Iterator<Item = BucketId> {
        0..self.bucket_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> ClusterNodeAddress {
        ClusterNodeAddress::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_queries() {
        let (a, b) = (addr(1), addr(2));
        let mut group = Group::new(GroupKey::cache("orders"), 4, 1);
        group.members = vec![
            GroupMember { address: a.clone(), leaving: false },
            GroupMember { address: b.clone(), leaving: true },
        ];
        group.buckets[0].owner = Some(a.clone());
        group.buckets[1].owner = Some(a.clone());
        group.buckets[1].pending = Some(b.clone());
        group.buckets[2].owner = Some(b.clone());
        group.buckets[2].backups = vec![a.clone()];

        assert_eq!(group.owned_buckets(&a), vec![0, 1]);
        assert_eq!(group.planned_buckets(&b), vec![1, 2]);
        assert_eq!(group.unowned_buckets(), vec![3]);
        assert_eq!(group.transfers_in_flight(), 1);
        assert_eq!(group.active_members(), vec![&a]);
        assert!(group.is_leaving(&b));

        assert_eq!(group.role(0, &a), OwnershipRole::Primary);
        assert_eq!(group.role(1, &b), OwnershipRole::Incoming);
        assert_eq!(group.role(2, &a), OwnershipRole::Backup);
        assert_eq!(group.role(3, &a), OwnershipRole::None);

        let map = group.group_map();
        assert_eq!(map[&a], vec![0, 1]);
        assert_eq!(map[&b], vec![2]);
    }

    #[test]
    fn test_owner_of_key() {
        let a = addr(1);
        let mut group = Group::new(GroupKey::cache("c"), 8, 0);
        for bucket in group.buckets.iter_mut() {
            bucket.owner = Some(a.clone());
        }
        let (bucket, owner) = group.owner_of(b"some-key");
        assert!(bucket < 8);
        assert_eq!(owner, Some(&a));
    }
}
