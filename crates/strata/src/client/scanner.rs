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

//! Per-read state machine: open, iterate, close across one or more tablets
//! under a replica-selection and read-mode policy.

use crate::client::table::Table;
use crate::error::{Error, Result, ServerErrorCode};
use crate::metadata::{Replica, ReplicaRole, TabletLocation};
use crate::proto::{PbColumnPredicate, ScanCloseRequest, ScanNextRequest, ScanOpenRequest};
use crate::row::{Datum, Row, RowBlock, encode_sortable_datum};
use crate::util::ExponentialBackoff;
use crate::ServerId;
use bytes::Bytes;
use log::debug;
use parse_display::Display;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Policy for choosing among a tablet's replicas.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSelection {
    /// Always the current leader; a leaderless record is refreshed.
    LeaderOnly,
    /// The closest replica by network distance; ties broken randomly.
    /// Without locality information all replicas tie.
    ClosestReplica,
    /// The replica at index 0 of the record, a stable order.
    FirstReplica,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The server returns all writes visible when the request arrives; no
    /// snapshot timestamp is returned.
    ReadLatest,
    /// The server serves at a snapshot, waiting out transactions with lower
    /// timestamps. Without a caller-set timestamp the server picks its
    /// current clock reading.
    ReadAtSnapshot,
}

impl ReadMode {
    fn code(self) -> i32 {
        match self {
            ReadMode::ReadLatest => 0,
            ReadMode::ReadAtSnapshot => 1,
        }
    }
}

/// One conjunctive range predicate over a column. Bounds are inclusive and
/// each side optional.
#[derive(Debug, Clone)]
pub struct ColumnRangePredicate {
    column_index: usize,
    lower: Option<Datum>,
    upper: Option<Datum>,
}

impl ColumnRangePredicate {
    pub fn new(column_index: usize, lower: Option<Datum>, upper: Option<Datum>) -> Self {
        ColumnRangePredicate {
            column_index,
            lower,
            upper,
        }
    }

    /// Convenience equality predicate.
    pub fn equals(column_index: usize, value: Datum) -> Self {
        ColumnRangePredicate {
            column_index,
            lower: Some(value.clone()),
            upper: Some(value),
        }
    }

    fn to_pb(&self) -> PbColumnPredicate {
        PbColumnPredicate {
            column_index: self.column_index as u32,
            lower: self.lower.as_ref().map(encode_sortable_datum),
            upper: self.upper.as_ref().map(encode_sortable_datum),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScannerState {
    Fresh,
    Open,
    Drained,
    Closed,
}

/// A single scanner. Not safe for concurrent use; different scanners over
/// one table may run on different tasks.
pub struct Scanner {
    table: Table,
    state: ScannerState,
    projection: Option<Vec<usize>>,
    predicates: Vec<ColumnRangePredicate>,
    read_mode: ReadMode,
    snapshot_ts: Option<u64>,
    selection: ReplicaSelection,
    batch_size_bytes: u32,
    scanner_id: Option<u64>,
    current_server: Option<ServerId>,
    current_tablet: Option<Arc<TabletLocation>>,
    has_more_in_tablet: bool,
    buffered: Option<Vec<Row>>,
}

impl Scanner {
    pub(crate) fn new(table: Table) -> Scanner {
        let batch_size_bytes = table.context().config.scan_batch_size_bytes;
        Scanner {
            table,
            state: ScannerState::Fresh,
            projection: None,
            predicates: Vec::new(),
            read_mode: ReadMode::ReadLatest,
            snapshot_ts: None,
            selection: ReplicaSelection::LeaderOnly,
            batch_size_bytes,
            scanner_id: None,
            current_server: None,
            current_tablet: None,
            has_more_in_tablet: false,
            buffered: None,
        }
    }

    fn check_fresh(&self, what: &str) -> Result<()> {
        if self.state != ScannerState::Fresh {
            return Err(Error::illegal_state(format!(
                "{what} requires a scanner that has not been opened"
            )));
        }
        Ok(())
    }

    /// Restricts the scan to the given column indices. Defaults to the full
    /// table schema.
    pub fn set_projection(&mut self, columns: &[usize]) -> Result<()> {
        self.check_fresh("set_projection")?;
        for &index in columns {
            self.table.schema().column(index)?;
        }
        self.projection = Some(columns.to_vec());
        Ok(())
    }

    /// Adds a predicate; all predicates must pass for a row to be returned.
    pub fn add_conjunct_predicate(&mut self, predicate: ColumnRangePredicate) -> Result<()> {
        self.check_fresh("add_conjunct_predicate")?;
        let column = self.table.schema().column(predicate.column_index)?;
        for bound in [&predicate.lower, &predicate.upper].into_iter().flatten() {
            if bound.column_type() != column.column_type {
                return Err(Error::invalid_argument(format!(
                    "predicate bound type {} does not match column '{}' of type {}",
                    bound.column_type(),
                    column.name,
                    column.column_type
                )));
            }
        }
        self.predicates.push(predicate);
        Ok(())
    }

    /// Hint for the byte size of each returned batch. Zero before open means
    /// the open call itself returns no rows.
    pub fn set_batch_size_bytes(&mut self, batch_size: u32) -> Result<()> {
        self.check_fresh("set_batch_size_bytes")?;
        self.batch_size_bytes = batch_size;
        Ok(())
    }

    pub fn set_selection(&mut self, selection: ReplicaSelection) -> Result<()> {
        self.check_fresh("set_selection")?;
        self.selection = selection;
        Ok(())
    }

    pub fn set_read_mode(&mut self, read_mode: ReadMode) -> Result<()> {
        self.check_fresh("set_read_mode")?;
        self.read_mode = read_mode;
        Ok(())
    }

    /// Sets the snapshot timestamp, in microseconds, for
    /// [`ReadMode::ReadAtSnapshot`] scans.
    pub fn set_snapshot(&mut self, snapshot_ts_micros: u64) -> Result<()> {
        self.check_fresh("set_snapshot")?;
        self.snapshot_ts = Some(snapshot_ts_micros);
        Ok(())
    }

    /// The snapshot timestamp the scan ran at, once known.
    pub fn snapshot_ts_micros(&self) -> Option<u64> {
        self.snapshot_ts
    }

    /// Resolves the first tablet of the scan and opens a server-side
    /// scanner on it, skipping over empty tablets.
    pub async fn open(&mut self) -> Result<()> {
        self.check_fresh("open")?;
        self.open_tablet_at(Bytes::new()).await
    }

    /// Opens a scanner on the tablet owning `start_key` and advances past
    /// empty tablets. Transitions to Open or Drained.
    async fn open_tablet_at(&mut self, mut start_key: Bytes) -> Result<()> {
        loop {
            let location = self
                .table
                .context()
                .meta_cache
                .lookup(self.table.id(), &start_key)
                .await?;
            let (rows, has_more) = self.open_one_tablet(&location).await?;

            self.current_tablet = Some(Arc::clone(&location));
            if !rows.is_empty() || has_more {
                self.state = ScannerState::Open;
                self.buffered = Some(rows);
                self.has_more_in_tablet = has_more;
                return Ok(());
            }
            // the tablet had no data for this scan
            self.release_server_scanner();
            if location.is_last() {
                self.state = ScannerState::Drained;
                return Ok(());
            }
            start_key = location.end_key.clone();
        }
    }

    /// Opens a server-side scanner on one tablet, retrying replica and
    /// leadership failures with backoff bounded by the admin timeout.
    async fn open_one_tablet(
        &mut self,
        location: &Arc<TabletLocation>,
    ) -> Result<(Vec<Row>, bool)> {
        let context = Arc::clone(self.table.context());
        let deadline = Instant::now() + context.admin_timeout();
        let mut backoff = ExponentialBackoff::default();
        let mut location = Arc::clone(location);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timed_out(format!(
                    "opening a scanner on tablet {} exhausted its budget",
                    location.tablet_id
                )));
            }

            match self.try_open_once(&location, remaining).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retriable() => {
                    debug!(
                        "Scan open on tablet {} failed, retrying: {error}",
                        location.tablet_id
                    );
                    let delay = backoff.next_delay().min(remaining);
                    tokio::time::sleep(delay).await;
                    // re-resolve in case the failure invalidated the record
                    location = context
                        .meta_cache
                        .lookup(self.table.id(), &location.start_key)
                        .await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_open_once(
        &mut self,
        location: &Arc<TabletLocation>,
        timeout: Duration,
    ) -> Result<(Vec<Row>, bool)> {
        let context = Arc::clone(self.table.context());
        let replica = self.select_replica(location).await?;
        let connection = match context.registry.connection(replica.server_id).await {
            Ok(connection) => connection,
            Err(error) => {
                context.meta_cache.mark_follower(
                    self.table.id(),
                    location.tablet_id,
                    replica.server_id,
                );
                return Err(error);
            }
        };

        let request = ScanOpenRequest {
            tablet_id: location.tablet_id,
            projection: self
                .projection
                .clone()
                .unwrap_or_else(|| (0..self.table.schema().num_columns()).collect())
                .into_iter()
                .map(|c| c as u32)
                .collect(),
            predicates: self.predicates.iter().map(|p| p.to_pb()).collect(),
            read_mode: self.read_mode.code(),
            snapshot_ts_micros: self.snapshot_ts,
            batch_size_bytes: self.batch_size_bytes,
        };

        let response = connection.request(request, timeout).await?;
        if let Some(error) = response.error {
            let code = ServerErrorCode::for_code(error.code);
            match code {
                ServerErrorCode::NotLeader => {
                    context.meta_cache.mark_follower(
                        self.table.id(),
                        location.tablet_id,
                        replica.server_id,
                    );
                }
                ServerErrorCode::TabletNotFound => {
                    context
                        .meta_cache
                        .invalidate(self.table.id(), location.tablet_id);
                }
                _ => {}
            }
            return Err(code.to_error(error.message));
        }

        if self.read_mode == ReadMode::ReadAtSnapshot && self.snapshot_ts.is_none() {
            self.snapshot_ts = response.snapshot_ts_micros;
        }
        self.scanner_id = Some(response.scanner_id);
        self.current_server = Some(replica.server_id);

        let rows = match response.rows {
            Some(block) => RowBlock::decode(&self.projected_schema(), block.num_rows, block.data)?,
            None => Vec::new(),
        };
        Ok((rows, response.has_more))
    }

    /// The schema rows decode against. The server returns rows in the full
    /// table schema with non-projected columns absent.
    fn projected_schema(&self) -> Arc<crate::metadata::Schema> {
        self.table.schema_arc()
    }

    async fn select_replica(&self, location: &Arc<TabletLocation>) -> Result<Replica> {
        match self.selection {
            ReplicaSelection::LeaderOnly => match location.leader() {
                Some(leader) => Ok(leader.clone()),
                None => {
                    let (_, leader) = self
                        .table
                        .context()
                        .meta_cache
                        .lookup_leader(self.table.id(), &location.start_key)
                        .await?;
                    Ok(leader)
                }
            },
            ReplicaSelection::ClosestReplica => {
                // No locality information: every replica is equidistant, so
                // the tie-break is uniformly random.
                let eligible: Vec<&Replica> = location
                    .replicas
                    .iter()
                    .filter(|r| r.role != ReplicaRole::Learner)
                    .collect();
                if eligible.is_empty() {
                    return Err(Error::service_unavailable(format!(
                        "tablet {} has no readable replica",
                        location.tablet_id
                    )));
                }
                let index = rand::rng().random_range(0..eligible.len());
                Ok(eligible[index].clone())
            }
            ReplicaSelection::FirstReplica => location.replicas.first().cloned().ok_or_else(|| {
                Error::service_unavailable(format!(
                    "tablet {} has no replicas",
                    location.tablet_id
                ))
            }),
        }
    }

    /// Returns the next batch of rows, transparently advancing to the next
    /// tablet when the current one drains. An empty vector means the scan
    /// is complete.
    pub async fn next_batch(&mut self) -> Result<Vec<Row>> {
        match self.state {
            ScannerState::Fresh => {
                return Err(Error::illegal_state("scanner is not open"));
            }
            ScannerState::Closed => {
                return Err(Error::illegal_state("scanner is closed"));
            }
            ScannerState::Drained => return Ok(Vec::new()),
            ScannerState::Open => {}
        }

        if let Some(rows) = self.buffered.take() {
            if !rows.is_empty() {
                return Ok(rows);
            }
        }

        loop {
            if self.has_more_in_tablet {
                let rows = self.fetch_next_block().await?;
                if !rows.is_empty() {
                    return Ok(rows);
                }
                continue;
            }

            // current tablet exhausted
            let Some(current) = self.current_tablet.clone() else {
                self.state = ScannerState::Drained;
                return Ok(Vec::new());
            };
            self.release_server_scanner();
            if current.is_last() {
                self.state = ScannerState::Drained;
                return Ok(Vec::new());
            }
            self.open_tablet_at(current.end_key.clone()).await?;
            if self.state == ScannerState::Drained {
                return Ok(Vec::new());
            }
            if let Some(rows) = self.buffered.take() {
                if !rows.is_empty() {
                    return Ok(rows);
                }
            }
        }
    }

    async fn fetch_next_block(&mut self) -> Result<Vec<Row>> {
        let context = Arc::clone(self.table.context());
        let scanner_id = self
            .scanner_id
            .ok_or_else(|| Error::illegal_state("open scanner without a scanner id"))?;
        let server_id = self
            .current_server
            .ok_or_else(|| Error::illegal_state("open scanner without a server"))?;

        let connection = context.registry.connection(server_id).await?;
        let response = connection
            .request(
                ScanNextRequest {
                    scanner_id,
                    batch_size_bytes: self.batch_size_bytes,
                },
                context.admin_timeout(),
            )
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        self.has_more_in_tablet = response.has_more;
        match response.rows {
            Some(block) => RowBlock::decode(&self.projected_schema(), block.num_rows, block.data),
            None => Ok(Vec::new()),
        }
    }

    /// True iff the current tablet may have more rows or further tablets
    /// remain in the scan range.
    pub fn has_more_rows(&self) -> bool {
        if self.state != ScannerState::Open {
            return false;
        }
        if self.buffered.as_ref().is_some_and(|rows| !rows.is_empty()) {
            return true;
        }
        if self.has_more_in_tablet {
            return true;
        }
        self.current_tablet
            .as_ref()
            .is_some_and(|tablet| !tablet.is_last())
    }

    /// Fire-and-forget release of the server-side scanner, if any.
    fn release_server_scanner(&mut self) {
        let (Some(scanner_id), Some(server_id)) = (self.scanner_id.take(), self.current_server.take())
        else {
            return;
        };
        let context = Arc::clone(self.table.context());
        let timeout = context.admin_timeout();
        tokio::spawn(async move {
            if let Ok(connection) = context.registry.connection(server_id).await {
                // best effort; the server also expires idle scanners
                let _ = connection
                    .request(ScanCloseRequest { scanner_id }, timeout)
                    .await;
            }
        });
    }

    /// Closes the scanner. Never fails and never blocks; the server-side
    /// scanner is released in the background. The scanner resets to Fresh:
    /// projection, predicates and modes must be re-applied before reuse.
    pub fn close(&mut self) {
        self.release_server_scanner();
        self.state = ScannerState::Fresh;
        self.projection = None;
        self.predicates.clear();
        self.read_mode = ReadMode::ReadLatest;
        self.snapshot_ts = None;
        self.selection = ReplicaSelection::LeaderOnly;
        self.batch_size_bytes = self.table.context().config.scan_batch_size_bytes;
        self.current_tablet = None;
        self.has_more_in_tablet = false;
        self.buffered = None;
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.release_server_scanner();
    }
}
