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

//! Process-wide registry of known tablet servers: last-known address,
//! reachability backoff, and cached RPC proxies.

use crate::ServerId;
use crate::error::{Error, Result};
use crate::rpc::{RpcClient, ServerConnection};
use crate::util::ExponentialBackoff;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct TabletServerState {
    pub server_id: ServerId,
    addr: Mutex<String>,
    /// Connection attempts are skipped until this instant after a failure.
    unreachable_until: Mutex<Option<Instant>>,
    backoff: Mutex<ExponentialBackoff>,
}

impl TabletServerState {
    fn new(server_id: ServerId, addr: String) -> Self {
        TabletServerState {
            server_id,
            addr: Mutex::new(addr),
            unreachable_until: Mutex::new(None),
            backoff: Mutex::new(ExponentialBackoff::default()),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.lock().clone()
    }

    fn is_backed_off(&self) -> bool {
        match *self.unreachable_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn mark_unreachable(&self) {
        let delay = self.backoff.lock().next_delay();
        *self.unreachable_until.lock() = Some(Instant::now() + delay);
    }

    fn mark_reachable(&self) {
        *self.unreachable_until.lock() = None;
        self.backoff.lock().reset();
    }
}

#[derive(Debug)]
pub struct TabletServerRegistry {
    servers: DashMap<ServerId, Arc<TabletServerState>>,
    rpc: Arc<RpcClient>,
}

impl TabletServerRegistry {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        TabletServerRegistry {
            servers: DashMap::new(),
            rpc,
        }
    }

    /// Records a server sighting from a master location response. The address
    /// of a known server is refreshed in place.
    pub fn observe(&self, server_id: ServerId, addr: &str) {
        match self.servers.get(&server_id) {
            Some(state) => {
                let mut current = state.addr.lock();
                if *current != addr {
                    debug!(
                        "Tablet server {server_id} moved from {} to {addr}",
                        *current
                    );
                    *current = addr.to_string();
                }
            }
            None => {
                self.servers
                    .insert(server_id, Arc::new(TabletServerState::new(server_id, addr.to_string())));
            }
        }
    }

    pub fn get(&self, server_id: ServerId) -> Option<Arc<TabletServerState>> {
        self.servers.get(&server_id).map(|s| Arc::clone(&s))
    }

    /// Hands out the cached proxy for a server, respecting its backoff
    /// window. A fresh connection failure arms the backoff.
    pub async fn connection(&self, server_id: ServerId) -> Result<ServerConnection> {
        let state = self.get(server_id).ok_or_else(|| {
            Error::service_unavailable(format!("tablet server {server_id} is not known"))
        })?;
        if state.is_backed_off() {
            return Err(Error::service_unavailable(format!(
                "tablet server {server_id} is backed off after a failure"
            )));
        }
        let addr = state.addr();
        match self.rpc.get_connection(&addr).await {
            Ok(conn) => {
                state.mark_reachable();
                Ok(conn)
            }
            Err(e) => {
                warn!("Failed to connect to tablet server {server_id} at {addr}: {e}");
                state.mark_unreachable();
                Err(e)
            }
        }
    }

    /// Arms the backoff window for a server observed failing mid-request.
    pub fn mark_unreachable(&self, server_id: ServerId) {
        if let Some(state) = self.get(server_id) {
            state.mark_unreachable();
        }
    }

    #[cfg(test)]
    pub(crate) fn known_servers(&self) -> Vec<ServerId> {
        self.servers.iter().map(|e| *e.key()).collect()
    }
}
