// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Client-side map from (table, row key) to the tablet owning it and its
//! replica set.
//!
//! Lookups hit a per-table map ordered by tablet start key. Misses fetch
//! from the master; concurrent misses on the same (table, key) coalesce
//! into one in-flight master RPC through a per-key broadcast.

use crate::client::broadcast::{BroadcastOnce, BroadcastOnceReceiver};
use crate::client::registry::TabletServerRegistry;
use crate::error::{Error, Result};
use crate::metadata::{Replica, ReplicaRole, TabletLocation};
use crate::proto::{GetTableLocationsRequest, PbTabletLocation};
use crate::rpc::RpcClient;
use crate::util::ExponentialBackoff;
use crate::{TableId, TabletId};
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of tablet records fetched per master lookup.
const FETCH_BATCH_TABLETS: u32 = 10;

/// Result of one master fetch, shared among coalesced waiters.
#[derive(Debug, Clone)]
enum LookupOutcome {
    Found(Arc<TabletLocation>),
    NotFound(String),
    TimedOut(String),
    Unavailable(String),
}

impl LookupOutcome {
    fn to_result(&self) -> Result<Arc<TabletLocation>> {
        match self {
            LookupOutcome::Found(location) => Ok(Arc::clone(location)),
            LookupOutcome::NotFound(message) => Err(Error::not_found(message.clone())),
            LookupOutcome::TimedOut(message) => Err(Error::timed_out(message.clone())),
            LookupOutcome::Unavailable(message) => {
                Err(Error::service_unavailable(message.clone()))
            }
        }
    }
}

#[derive(Debug)]
pub struct MetaCache {
    /// Per table: tablet records ordered by start key. Range lookup is a
    /// predecessor search over start keys.
    tables: RwLock<HashMap<TableId, BTreeMap<Bytes, Arc<TabletLocation>>>>,
    /// In-flight master fetches by probed (table, key).
    inflight: Mutex<HashMap<(TableId, Bytes), BroadcastOnceReceiver<LookupOutcome>>>,
    /// Highest epoch ever seen per tablet. Survives invalidation so a
    /// re-fetched record's epoch still strictly increases.
    epochs: Mutex<HashMap<TabletId, u64>>,
    rpc: Arc<RpcClient>,
    master_addr: String,
    admin_timeout: Duration,
    registry: Arc<TabletServerRegistry>,
}

impl MetaCache {
    pub fn new(
        rpc: Arc<RpcClient>,
        master_addr: String,
        admin_timeout: Duration,
        registry: Arc<TabletServerRegistry>,
    ) -> Self {
        MetaCache {
            tables: Default::default(),
            inflight: Default::default(),
            epochs: Default::default(),
            rpc,
            master_addr,
            admin_timeout,
            registry,
        }
    }

    /// Synchronous cache probe. No master traffic.
    pub fn cached_lookup(&self, table_id: TableId, key: &[u8]) -> Option<Arc<TabletLocation>> {
        let tables = self.tables.read();
        let table = tables.get(&table_id)?;
        let (_, location) = table
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()?;
        location.contains_key(key).then(|| Arc::clone(location))
    }

    /// Resolves the tablet owning `key`, fetching from the master on a miss.
    /// Fails with `NotFound` only when the master confirms no range owns the
    /// key; master unavailability surfaces as `TimedOut` or
    /// `ServiceUnavailable` once the admin timeout is spent.
    pub async fn lookup(&self, table_id: TableId, key: &[u8]) -> Result<Arc<TabletLocation>> {
        if let Some(location) = self.cached_lookup(table_id, key) {
            return Ok(location);
        }
        self.coalesced_fetch(table_id, key).await
    }

    /// Resolves the tablet owning `key` together with its current leader.
    /// A cached record without a leader counts as a miss and is re-fetched.
    pub async fn lookup_leader(
        &self,
        table_id: TableId,
        key: &[u8],
    ) -> Result<(Arc<TabletLocation>, Replica)> {
        if let Some(location) = self.cached_lookup(table_id, key) {
            if let Some(leader) = location.leader() {
                return Ok((Arc::clone(&location), leader.clone()));
            }
            self.invalidate(table_id, location.tablet_id);
        }
        let location = self.coalesced_fetch(table_id, key).await?;
        match location.leader() {
            Some(leader) => {
                let leader = leader.clone();
                Ok((location, leader))
            }
            None => Err(Error::service_unavailable(format!(
                "tablet {} has no leader",
                location.tablet_id
            ))),
        }
    }

    async fn coalesced_fetch(&self, table_id: TableId, key: &[u8]) -> Result<Arc<TabletLocation>> {
        let probe: Bytes = Bytes::copy_from_slice(key);
        let (sender, receiver) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&(table_id, probe.clone())) {
                Some(receiver) => (None, receiver.clone()),
                None => {
                    let broadcast = BroadcastOnce::default();
                    let receiver = broadcast.receiver();
                    inflight.insert((table_id, probe.clone()), receiver.clone());
                    (Some(broadcast), receiver)
                }
            }
        };

        if let Some(broadcast) = sender {
            // This caller performs the fetch; the others wait on the
            // broadcast.
            let outcome = self.fetch_from_master(table_id, &probe).await;
            self.inflight.lock().remove(&(table_id, probe));
            broadcast.broadcast(outcome.clone());
            return outcome.to_result();
        }

        match receiver.receive().await {
            Ok(outcome) => outcome.to_result(),
            // The fetching caller was cancelled before broadcasting;
            // fall back to a fetch of our own.
            Err(_) => Box::pin(self.coalesced_fetch(table_id, key)).await,
        }
    }

    async fn fetch_from_master(&self, table_id: TableId, key: &Bytes) -> LookupOutcome {
        let deadline = Instant::now() + self.admin_timeout;
        let mut backoff = ExponentialBackoff::default();
        let mut last_error = String::from("no attempt made");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return LookupOutcome::TimedOut(format!(
                    "location lookup for table {table_id} exhausted its budget; last error: {last_error}"
                ));
            }

            match self.try_fetch_once(table_id, key, remaining).await {
                Ok(outcome) => return outcome,
                Err(e) => match e {
                    Error::Connection { .. }
                    | Error::TimedOut { .. }
                    | Error::ServiceUnavailable { .. } => {
                        last_error = e.to_string();
                    }
                    Error::NotFound { message } => return LookupOutcome::NotFound(message),
                    other => {
                        return LookupOutcome::Unavailable(format!(
                            "location lookup for table {table_id} failed: {other}"
                        ));
                    }
                },
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return LookupOutcome::TimedOut(format!(
                    "location lookup for table {table_id} exhausted its budget; last error: {last_error}"
                ));
            }
            let delay = backoff.next_delay().min(remaining);
            debug!(
                "Retrying location lookup for table {table_id} in {delay:?} after: {last_error}"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_fetch_once(
        &self,
        table_id: TableId,
        key: &Bytes,
        timeout: Duration,
    ) -> Result<LookupOutcome> {
        let conn = self.rpc.get_connection(&self.master_addr).await?;
        let response = conn
            .request(
                GetTableLocationsRequest {
                    table_id,
                    start_key: key.clone(),
                    max_tablets: FETCH_BATCH_TABLETS,
                },
                timeout,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(crate::error::ServerErrorCode::for_code(error.code).to_error(error.message));
        }

        let found = self.populate(table_id, response.tablets, key);
        Ok(match found {
            Some(location) => LookupOutcome::Found(location),
            None => LookupOutcome::NotFound(format!(
                "no tablet owns the requested key of table {table_id}"
            )),
        })
    }

    /// Merges fetched records into the cache and returns the one covering
    /// `key`, if any.
    fn populate(
        &self,
        table_id: TableId,
        pb_tablets: Vec<PbTabletLocation>,
        key: &[u8],
    ) -> Option<Arc<TabletLocation>> {
        for replica in pb_tablets.iter().flat_map(|t| &t.replicas) {
            self.registry
                .observe(replica.server_id, &format!("{}:{}", replica.host, replica.port));
        }

        let mut tables = self.tables.write();
        let table = tables.entry(table_id).or_default();
        let mut epochs = self.epochs.lock();

        for pb in pb_tablets {
            let previous = epochs.get(&pb.tablet_id).copied().unwrap_or(0);
            let epoch = pb.epoch.max(previous + 1);
            epochs.insert(pb.tablet_id, epoch);

            let location = Arc::new(TabletLocation {
                tablet_id: pb.tablet_id,
                start_key: pb.start_key,
                end_key: pb.end_key,
                replicas: pb
                    .replicas
                    .into_iter()
                    .map(|r| Replica {
                        server_id: r.server_id,
                        role: ReplicaRole::for_code(r.role),
                    })
                    .collect(),
                epoch,
                populated_at: Instant::now(),
            });

            // Drop any cached record overlapping the incoming range; stale
            // post-split/merge records must not shadow it.
            let overlapping: Vec<Bytes> = table
                .values()
                .filter(|existing| ranges_overlap(existing, &location))
                .map(|existing| existing.start_key.clone())
                .collect();
            for start in overlapping {
                table.remove(&start);
            }
            table.insert(location.start_key.clone(), location);
        }

        let (_, location) = table
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()?;
        location.contains_key(key).then(|| Arc::clone(location))
    }

    /// Evicts one tablet's record; the next lookup re-fetches.
    pub fn invalidate(&self, table_id: TableId, tablet_id: TabletId) {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get_mut(&table_id) {
            let start = table
                .values()
                .find(|l| l.tablet_id == tablet_id)
                .map(|l| l.start_key.clone());
            if let Some(start) = start {
                table.remove(&start);
                debug!("Invalidated location of tablet {tablet_id} in table {table_id}");
            }
        }
    }

    /// Demotes `server_id` within the tablet's cached record after a
    /// NotLeader response. The record stays usable for reads; writers
    /// needing a leader treat it as a miss.
    pub fn mark_follower(&self, table_id: TableId, tablet_id: TabletId, server_id: crate::ServerId) {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&table_id) else {
            return;
        };
        let Some(start) = table
            .values()
            .find(|l| l.tablet_id == tablet_id)
            .map(|l| l.start_key.clone())
        else {
            return;
        };
        if let Some(existing) = table.get(&start) {
            let mut updated = TabletLocation::clone(existing);
            let mut changed = false;
            for replica in &mut updated.replicas {
                if replica.server_id == server_id && replica.role == ReplicaRole::Leader {
                    replica.role = ReplicaRole::Follower;
                    changed = true;
                }
            }
            if changed {
                warn!(
                    "Demoted server {server_id} from leader of tablet {tablet_id} in table {table_id}"
                );
                table.insert(start, Arc::new(updated));
            }
        }
    }

    /// Drops every cached record of a table, e.g. after the table is deleted.
    pub fn invalidate_table(&self, table_id: TableId) {
        self.tables.write().remove(&table_id);
    }
}

fn ranges_overlap(a: &TabletLocation, b: &TabletLocation) -> bool {
    let a_ends_after_b_starts = a.end_key.is_empty() || a.end_key > b.start_key;
    let b_ends_after_a_starts = b.end_key.is_empty() || b.end_key > a.start_key;
    a_ends_after_b_starts && b_ends_after_a_starts
}
