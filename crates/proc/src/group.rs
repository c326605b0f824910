//! Replica selection: maps a key to its shard and to the connection of the
//! storage server owning that shard in each zone.

use crate::replica::ReplicaConnection;
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// One selected replica.
#[derive(Clone)]
pub struct ReplicaSlot {
    pub zone: usize,
    pub conn: Arc<dyn ReplicaConnection>,
}

impl std::fmt::Debug for ReplicaSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSlot")
            .field("zone", &self.zone)
            .field("conn", &self.conn.name())
            .finish()
    }
}

/// The replicas chosen for the current request. Only available
/// connections are kept; the position in the group is the replica index
/// used by the processor.
#[derive(Debug, Default)]
pub struct ReplicaGroup {
    slots: Vec<ReplicaSlot>,
    num_zones: usize,
    shard_id: u16,
}

impl ReplicaGroup {
    pub fn clear(&mut self) {
        self.slots.clear();
        self.num_zones = 0;
        self.shard_id = 0;
    }

    /// Resolve `key` and fill the group. Returns `true` if at least
    /// `num_writes` replicas are available.
    pub fn select(
        &mut self,
        resolver: &dyn ShardResolver,
        key: &[u8],
        num_zones: usize,
        num_writes: usize,
    ) -> bool {
        self.clear();
        self.num_zones = num_zones;
        self.shard_id = resolver.resolve(key, self);
        self.slots.truncate(num_zones);
        self.slots.len() >= num_writes
    }

    /// Add a replica. Called by resolvers.
    pub fn push(&mut self, zone: usize, conn: Arc<dyn ReplicaConnection>) {
        self.slots.push(ReplicaSlot { zone, conn });
    }

    pub fn get(&self, index: usize) -> Option<&ReplicaSlot> {
        self.slots.get(index)
    }

    pub fn num_available(&self) -> usize {
        self.slots.len()
    }

    /// Zones without a usable replica.
    pub fn num_broken(&self) -> usize {
        self.num_zones.saturating_sub(self.slots.len())
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }
}

/// Resolves shard ownership for keys.
pub trait ShardResolver: Send + Sync + 'static {
    /// Push the available replicas for `key` into `group` in zone order and
    /// return the key's shard id.
    fn resolve(&self, key: &[u8], group: &mut ReplicaGroup) -> u16;
}

/// Fixed topology: `num_shards` shards spread over the hosts of each zone.
/// A shard lives on host `shard % hosts_in_zone` of every zone.
pub struct StaticShardMap {
    num_shards: u16,
    zones: Vec<Vec<Arc<dyn ReplicaConnection>>>,
}

impl std::fmt::Debug for StaticShardMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticShardMap")
            .field("num_shards", &self.num_shards)
            .field("num_zones", &self.zones.len())
            .finish_non_exhaustive()
    }
}

impl StaticShardMap {
    pub fn new(num_shards: u16, zones: Vec<Vec<Arc<dyn ReplicaConnection>>>) -> Self {
        Self {
            num_shards: num_shards.max(1),
            zones,
        }
    }

    /// One host per zone.
    pub fn single_host_per_zone(replicas: Vec<Arc<dyn ReplicaConnection>>) -> Self {
        Self::new(1, replicas.into_iter().map(|r| vec![r]).collect())
    }

    /// Map a key to its shard by SHA-1.
    pub fn shard_of(&self, key: &[u8]) -> u16 {
        let hash = Sha1::digest(key);
        let prefix = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (prefix % self.num_shards as u32) as u16
    }
}

impl ShardResolver for StaticShardMap {
    fn resolve(&self, key: &[u8], group: &mut ReplicaGroup) -> u16 {
        let shard = self.shard_of(key);
        for (zone, hosts) in self.zones.iter().enumerate() {
            if hosts.is_empty() {
                continue;
            }
            let conn = &hosts[shard as usize % hosts.len()];
            if conn.is_available() {
                group.push(zone, Arc::clone(conn));
            }
        }
        shard
    }
}
