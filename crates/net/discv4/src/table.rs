//! The routing table: kademlia buckets plus the per node liveness and bond records.

use crate::node::{kad_key, NodeKey, NodeRecord, PeerId};
use discv5::{
    kbucket::{self, BucketInsertResult, KBucketsTable, NodeStatus, MAX_NODES_PER_BUCKET},
    ConnectionDirection, ConnectionState,
};
use schnellru::{ByLength, LruMap};
use std::{collections::HashMap, fmt, net::IpAddr, time::Duration};
use tokio::time::Instant;

/// The maximum number of bond records, the least recently updated record is evicted first.
pub(crate) const MAX_BOND_RECORDS: u32 = 8192;

/// Table entry bookkeeping that is not stored in the buckets.
#[derive(Debug, Clone, Copy)]
struct NodeEntry {
    record: NodeRecord,
    /// How often the node answered a liveness check.
    liveness_checks: usize,
    /// When the node was last checked, `None` if it never was.
    last_validated: Option<Instant>,
}

/// When a node last proved its endpoint.
#[derive(Debug, Clone, Copy, Default)]
struct Bond {
    last_ping_received: Option<Instant>,
    last_pong_received: Option<Instant>,
}

/// The kademlia table of known nodes.
///
/// Bond records are keyed by `(id, ip)` and kept independent of table membership, a node that
/// pinged us is bonded before it's inserted. At most [`MAX_BOND_RECORDS`] are kept.
pub(crate) struct Table {
    kbuckets: KBucketsTable<NodeKey, NodeRecord>,
    /// Mirrors the nodes stored in `kbuckets`.
    nodes: HashMap<PeerId, NodeEntry>,
    bonds: LruMap<(PeerId, IpAddr), Bond, ByLength>,
    bond_expiration: Duration,
}

impl Table {
    pub(crate) fn new(local_id: PeerId, bond_expiration: Duration) -> Self {
        Self::with_bond_capacity(local_id, bond_expiration, MAX_BOND_RECORDS)
    }

    pub(crate) fn with_bond_capacity(
        local_id: PeerId,
        bond_expiration: Duration,
        max_bonds: u32,
    ) -> Self {
        let kbuckets = KBucketsTable::new(
            kad_key(local_id),
            Duration::from_secs(60),
            MAX_NODES_PER_BUCKET,
            None,
            None,
        );
        Self {
            kbuckets,
            nodes: HashMap::new(),
            bonds: LruMap::new(ByLength::new(max_bonds)),
            bond_expiration,
        }
    }

    /// Number of nodes in the table.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &PeerId) -> bool {
        self.nodes.contains_key(id)
    }

    /// The number of liveness checks the node passed, `None` if it is not in the table.
    #[cfg(test)]
    pub(crate) fn liveness_checks(&self, id: &PeerId) -> Option<usize> {
        self.nodes.get(id).map(|entry| entry.liveness_checks)
    }

    /// Inserts a node that was relayed by another node.
    ///
    /// Returns true if the node was inserted.
    pub(crate) fn add_seen_node(&mut self, record: NodeRecord) -> bool {
        self.insert(record, 0)
    }

    /// Inserts a node that proved its endpoint, or marks an existing entry as live.
    ///
    /// Returns true if the node was inserted.
    pub(crate) fn add_verified_node(&mut self, record: NodeRecord, now: Instant) -> bool {
        if let Some(entry) = self.nodes.get_mut(&record.id) {
            entry.liveness_checks = entry.liveness_checks.max(1);
            entry.last_validated = Some(now);
            return false
        }
        let inserted = self.insert(record, 1);
        if let Some(entry) = self.nodes.get_mut(&record.id) {
            entry.last_validated = Some(now);
        }
        inserted
    }

    fn insert(&mut self, record: NodeRecord, liveness_checks: usize) -> bool {
        let key = kad_key(record.id);
        match self.kbuckets.entry(&key) {
            kbucket::Entry::Absent(entry) => {
                let status = NodeStatus {
                    direction: ConnectionDirection::Outgoing,
                    state: ConnectionState::Connected,
                };
                match entry.insert(record, status) {
                    BucketInsertResult::Inserted => {
                        self.nodes.insert(
                            record.id,
                            NodeEntry { record, liveness_checks, last_validated: None },
                        );
                        true
                    }
                    // bucket is full
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Removes the node from the table.
    ///
    /// Returns true if the node was in the table.
    pub(crate) fn remove(&mut self, id: &PeerId) -> bool {
        if self.nodes.remove(id).is_none() {
            return false
        }
        self.kbuckets.remove(&kad_key(*id));
        true
    }

    /// Records a successful liveness check of a table entry.
    pub(crate) fn record_liveness(&mut self, id: &PeerId, now: Instant) {
        if let Some(entry) = self.nodes.get_mut(id) {
            entry.liveness_checks += 1;
            entry.last_validated = Some(now);
        }
    }

    /// Returns the entry that was validated the longest time ago, never validated entries first.
    pub(crate) fn least_recently_validated(&self) -> Option<NodeRecord> {
        self.nodes.values().min_by_key(|entry| entry.last_validated).map(|entry| entry.record)
    }

    /// Returns up to `n` nodes ordered by ascending distance to the target.
    ///
    /// If `only_live` is set, nodes that never passed a liveness check are skipped.
    pub(crate) fn find_closest(
        &mut self,
        target: PeerId,
        n: usize,
        only_live: bool,
    ) -> Vec<NodeRecord> {
        let key = kad_key(target);
        let nodes = &self.nodes;
        self.kbuckets
            .closest_values(&key)
            .filter(|entry| {
                !only_live ||
                    nodes.get(&entry.value.id).map(|n| n.liveness_checks > 0).unwrap_or_default()
            })
            .take(n)
            .map(|entry| entry.value)
            .collect()
    }

    pub(crate) fn last_ping_received(&self, id: PeerId, ip: IpAddr) -> Option<Instant> {
        self.bonds.peek(&(id, ip)).and_then(|bond| bond.last_ping_received)
    }

    pub(crate) fn last_pong_received(&self, id: PeerId, ip: IpAddr) -> Option<Instant> {
        self.bonds.peek(&(id, ip)).and_then(|bond| bond.last_pong_received)
    }

    pub(crate) fn update_last_ping_received(&mut self, id: PeerId, ip: IpAddr, now: Instant) {
        if let Some(bond) = self.bonds.get_or_insert((id, ip), Bond::default) {
            bond.last_ping_received = Some(now);
        }
    }

    pub(crate) fn update_last_pong_received(&mut self, id: PeerId, ip: IpAddr, now: Instant) {
        if let Some(bond) = self.bonds.get_or_insert((id, ip), Bond::default) {
            bond.last_pong_received = Some(now);
        }
    }

    fn is_fresh(&self, timestamp: Option<Instant>, now: Instant) -> bool {
        timestamp.map(|ts| now.saturating_duration_since(ts) < self.bond_expiration).unwrap_or_default()
    }

    /// Whether we received a pong from this endpoint recently.
    pub(crate) fn has_recent_pong(&self, id: PeerId, ip: IpAddr, now: Instant) -> bool {
        self.is_fresh(self.last_pong_received(id, ip), now)
    }

    /// Whether the endpoint pinged us recently.
    pub(crate) fn has_recent_ping(&self, id: PeerId, ip: IpAddr, now: Instant) -> bool {
        self.is_fresh(self.last_ping_received(id, ip), now)
    }

    /// Whether the endpoint is bonded, i.e. it either answered our ping or pinged us recently.
    pub(crate) fn has_bond(&self, id: PeerId, ip: IpAddr, now: Instant) -> bool {
        self.has_recent_pong(id, ip, now) || self.has_recent_ping(id, ip, now)
    }

    /// Removes all bond records that are no longer fresh.
    pub(crate) fn prune_bonds(&mut self, now: Instant) {
        let expiration = self.bond_expiration;
        let fresh = |ts: Option<Instant>| {
            ts.map(|ts| now.saturating_duration_since(ts) < expiration).unwrap_or_default()
        };
        let stale = self
            .bonds
            .iter()
            .filter(|(_, bond)| !fresh(bond.last_ping_received) && !fresh(bond.last_pong_received))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in stale {
            self.bonds.remove(&key);
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("nodes", &self.nodes.len())
            .field("bonds", &self.bonds.len())
            .field("bond_expiration", &self.bond_expiration)
            .finish_non_exhaustive()
    }
}
