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

//! The per-flush unit of work.
//!
//! A batcher accepts write operations while Open, resolves each to the
//! tablet and leader replica owning it, groups operations by destination
//! server, and on flush dispatches one Write RPC per server with per-tablet
//! grouping preserved. Retryable failures (leader moved, tablet moved,
//! network) are recovered internally until the write deadline; row-level
//! logical errors go straight to the session's error collector.
//!
//! State machine: Open -> Flushing -> Complete, or -> Aborted from either
//! live state. The completion callback fires exactly once.

use crate::client::ClientContext;
use crate::client::broadcast::BroadcastOnce;
use crate::client::session::{ErrorCollector, MutationBuffer, SessionError};
use crate::client::write_op::WriteOperation;
use crate::error::{Error, Result, ServerErrorCode};
use crate::proto::{PbTabletWriteBatch, WriteRequest};
use crate::row::OpBlockBuilder;
use crate::util::ExponentialBackoff;
use crate::{ServerId, TabletId};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub(crate) type FlushCallback = Box<dyn FnOnce(Result<()>) + Send>;
pub(crate) type OpCallback = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatcherStatus {
    Open,
    Flushing,
    Complete,
    Aborted,
}

struct QueuedOp {
    op: WriteOperation,
    key: Bytes,
    payload: Bytes,
    size: usize,
    /// True once the op was handed to a server; a later ambiguous failure
    /// is then reported as possibly successful.
    dispatched: bool,
    callback: Option<OpCallback>,
}

impl QueuedOp {
    fn terminate_ok(mut self, batcher: &Batcher) {
        batcher.release(self.size);
        if let Some(callback) = self.callback.take() {
            callback(Ok(()));
        }
    }

    fn terminate_err(mut self, batcher: &Batcher, error: Error, possibly_successful: bool) {
        batcher.release(self.size);
        batcher.errors_produced.fetch_add(1, Ordering::AcqRel);
        if let Some(callback) = self.callback.take() {
            callback(Err(error.clone()));
        }
        batcher
            .error_collector
            .add(SessionError::new(self.op, error, possibly_successful));
    }
}

struct BatcherState {
    status: BatcherStatus,
    /// Ops accepted while Open, waiting for flush.
    queued: Vec<QueuedOp>,
    /// Apply-time lookups still outstanding; flush dispatch waits for them.
    pending_lookups: usize,
    dispatch_started: bool,
}

pub(crate) struct Batcher {
    context: Arc<ClientContext>,
    error_collector: Arc<ErrorCollector>,
    buffer: Arc<MutationBuffer>,
    /// Whether op sizes were reserved in the mutation buffer and must be
    /// released as ops terminate. Sync-mode transient batchers skip the
    /// buffer entirely.
    accounted: bool,
    timeout: Duration,
    state: Mutex<BatcherState>,
    /// Ops currently buffered: accepted and not yet terminated or flushed.
    buffered_ops: AtomicUsize,
    buffered_bytes: AtomicUsize,
    errors_produced: AtomicUsize,
    callback: Mutex<Option<FlushCallback>>,
    completion: BroadcastOnce<Result<(), Error>>,
    completed: AtomicBool,
}

impl Batcher {
    pub(crate) fn new(
        context: Arc<ClientContext>,
        error_collector: Arc<ErrorCollector>,
        buffer: Arc<MutationBuffer>,
        accounted: bool,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Batcher {
            context,
            error_collector,
            buffer,
            accounted,
            timeout,
            state: Mutex::new(BatcherState {
                status: BatcherStatus::Open,
                queued: Vec::new(),
                pending_lookups: 0,
                dispatch_started: false,
            }),
            buffered_ops: AtomicUsize::new(0),
            buffered_bytes: AtomicUsize::new(0),
            errors_produced: AtomicUsize::new(0),
            callback: Mutex::new(None),
            completion: BroadcastOnce::default(),
            completed: AtomicBool::new(false),
        })
    }

    pub(crate) fn buffered_ops(&self) -> usize {
        self.buffered_ops.load(Ordering::Acquire)
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.queued.is_empty() && state.pending_lookups == 0
    }

    fn release(&self, size: usize) {
        self.buffered_bytes.fetch_sub(size, Ordering::AcqRel);
        self.buffered_ops.fetch_sub(1, Ordering::AcqRel);
        if self.accounted {
            self.buffer.release(size);
        }
    }

    /// Accepts one operation. Returns synchronously once the op is accepted;
    /// a cold location cache does not block the caller, the op is slotted in
    /// the background when its lookup completes. Malformed ops fail inline
    /// before acceptance.
    pub(crate) fn add(
        self: &Arc<Self>,
        op: WriteOperation,
        callback: Option<OpCallback>,
    ) -> Result<()> {
        let (key, payload) = match op.encode() {
            Ok(encoded) => encoded,
            Err(error) => {
                if let Some(callback) = callback {
                    callback(Err(error.clone()));
                }
                return Err(error);
            }
        };
        let size = op.byte_size();
        let table_id = op.table().id();

        let mut queued = QueuedOp {
            op,
            key,
            payload,
            size,
            dispatched: false,
            callback,
        };

        let mut state = self.state.lock();
        if state.status != BatcherStatus::Open {
            drop(state);
            let error =
                Error::illegal_state("cannot add operations to a batcher that is no longer open");
            if let Some(callback) = queued.callback.take() {
                callback(Err(error.clone()));
            }
            return Err(error);
        }
        self.buffered_ops.fetch_add(1, Ordering::AcqRel);
        self.buffered_bytes.fetch_add(size, Ordering::AcqRel);

        if self
            .context
            .meta_cache
            .cached_lookup(table_id, &queued.key)
            .is_some()
        {
            state.queued.push(queued);
            return Ok(());
        }

        // Cache miss: warm the cache in the background so flush-time
        // resolution is cheap, and so lookup failures surface before the
        // flush completes. Concurrent misses on one key coalesce inside the
        // meta cache.
        state.pending_lookups += 1;
        drop(state);
        let batcher = Arc::clone(self);
        let probe_key = Bytes::copy_from_slice(&queued.key);
        tokio::spawn(async move {
            let result = batcher.context.meta_cache.lookup(table_id, &probe_key).await;
            batcher.lookup_complete(queued, result.map(|_| ()));
        });
        Ok(())
    }

    fn lookup_complete(self: &Arc<Self>, queued: QueuedOp, result: Result<()>) {
        let mut state = self.state.lock();
        state.pending_lookups -= 1;
        let status = state.status;

        match status {
            BatcherStatus::Aborted => {
                drop(state);
                queued.terminate_err(
                    self,
                    Error::aborted("operation discarded by session close"),
                    false,
                );
                return;
            }
            BatcherStatus::Open | BatcherStatus::Flushing => match result {
                Ok(()) => state.queued.push(queued),
                Err(error) => {
                    drop(state);
                    queued.terminate_err(self, error, false);
                    // re-lock to evaluate the dispatch trigger below
                    state = self.state.lock();
                }
            },
            BatcherStatus::Complete => {
                // Dispatch cannot complete while lookups are pending; a late
                // lookup against a Complete batcher is a bug.
                unreachable!("lookup completed after batcher completion");
            }
        }

        if state.status == BatcherStatus::Flushing
            && state.pending_lookups == 0
            && !state.dispatch_started
        {
            state.dispatch_started = true;
            let ops = std::mem::take(&mut state.queued);
            drop(state);
            self.spawn_dispatch(ops);
        }
    }

    /// Transitions Open -> Flushing and starts dispatch once apply-time
    /// lookups settle. The callback fires exactly once when every op has
    /// terminated; for an already-empty batcher that is inline, on the
    /// calling thread.
    pub(crate) fn flush(self: &Arc<Self>, callback: Option<FlushCallback>) {
        {
            let mut state = self.state.lock();
            if state.status != BatcherStatus::Open {
                drop(state);
                if let Some(callback) = callback {
                    callback(Err(Error::illegal_state("batcher flushed twice")));
                }
                return;
            }
            state.status = BatcherStatus::Flushing;
            *self.callback.lock() = callback;

            if state.pending_lookups > 0 {
                // lookup_complete starts the dispatch once the last lookup
                // lands.
                return;
            }
            state.dispatch_started = true;
        }

        let ops = std::mem::take(&mut self.state.lock().queued);
        if ops.is_empty() {
            self.complete_once();
            return;
        }
        self.spawn_dispatch(ops);
    }

    /// Aborts the batcher: queued ops move to the error collector with
    /// `Aborted`, in-flight RPC responses are discarded on arrival.
    pub(crate) fn abort(self: &Arc<Self>) {
        let ops = {
            let mut state = self.state.lock();
            if matches!(state.status, BatcherStatus::Complete | BatcherStatus::Aborted) {
                return;
            }
            state.status = BatcherStatus::Aborted;
            std::mem::take(&mut state.queued)
        };
        for queued in ops {
            let possibly = queued.dispatched;
            queued.terminate_err(
                self,
                Error::aborted("operation discarded by session close"),
                possibly,
            );
        }
        self.complete_once();
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().status == BatcherStatus::Aborted
    }

    /// Waits for the batcher to reach Complete or Aborted and returns the
    /// flush summary.
    pub(crate) async fn wait(&self) -> Result<()> {
        match self.completion.receiver().receive().await {
            Ok(result) => result,
            Err(_) => Err(Error::aborted("batcher dropped before completion")),
        }
    }

    fn summary(&self) -> Result<()> {
        let aborted = self.is_aborted();
        if aborted {
            return Err(Error::aborted("batch aborted"));
        }
        match self.errors_produced.load(Ordering::Acquire) {
            0 => Ok(()),
            count => Err(Error::RowErrors { count }),
        }
    }

    fn complete_once(self: &Arc<Self>) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.status == BatcherStatus::Flushing {
                state.status = BatcherStatus::Complete;
            }
        }
        let summary = self.summary();
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(summary.clone());
        }
        self.completion.broadcast(summary);
    }

    fn spawn_dispatch(self: &Arc<Self>, ops: Vec<QueuedOp>) {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            batcher.run_dispatch(ops).await;
            batcher.complete_once();
        });
    }

    /// Dispatch loop: resolve each op to its leader, fan out one RPC per
    /// server, re-resolve and retry retryable failures with backoff until
    /// the write deadline.
    async fn run_dispatch(self: &Arc<Self>, mut pending: Vec<QueuedOp>) {
        let deadline = Instant::now() + self.timeout;
        let mut backoff = ExponentialBackoff::default();

        while !pending.is_empty() {
            if self.is_aborted() {
                for queued in pending {
                    let possibly = queued.dispatched;
                    queued.terminate_err(
                        self,
                        Error::aborted("operation discarded by session close"),
                        possibly,
                    );
                }
                return;
            }
            if Instant::now() >= deadline {
                self.fail_timed_out(pending);
                return;
            }

            // Resolution: bucket ops by (leader server, tablet).
            let mut groups: HashMap<(ServerId, TabletId), Vec<QueuedOp>> = HashMap::new();
            let mut next_round: Vec<QueuedOp> = Vec::new();
            for queued in pending {
                let table_id = queued.op.table().id();
                match self
                    .context
                    .meta_cache
                    .lookup_leader(table_id, &queued.key)
                    .await
                {
                    Ok((location, leader)) => {
                        groups
                            .entry((leader.server_id, location.tablet_id))
                            .or_default()
                            .push(queued);
                    }
                    Err(error) if error.is_retriable() || matches!(error, Error::TimedOut { .. }) => {
                        next_round.push(queued);
                    }
                    Err(error) => queued.terminate_err(self, error, false),
                }
            }

            // Coalesce per-tablet groups by destination server: one Write
            // RPC per server per round.
            let mut per_server: HashMap<ServerId, Vec<(TabletId, Vec<QueuedOp>)>> = HashMap::new();
            for ((server_id, tablet_id), ops) in groups {
                per_server.entry(server_id).or_default().push((tablet_id, ops));
            }

            let mut sends: FuturesUnordered<_> = per_server
                .into_iter()
                .map(|(server_id, batches)| self.send_to_server(server_id, batches, deadline))
                .collect();
            while let Some(retries) = sends.next().await {
                next_round.extend(retries);
            }
            drop(sends);

            if next_round.is_empty() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.fail_timed_out(next_round);
                return;
            }
            let delay = backoff.next_delay().min(remaining);
            debug!(
                "Retrying {} write op(s) in {delay:?} within the current batch",
                next_round.len()
            );
            tokio::time::sleep(delay).await;
            pending = next_round;
        }
    }

    fn fail_timed_out(self: &Arc<Self>, ops: Vec<QueuedOp>) {
        for queued in ops {
            let possibly = queued.dispatched;
            queued.terminate_err(
                self,
                Error::timed_out("write did not complete within the session timeout"),
                possibly,
            );
        }
    }

    /// Sends one Write RPC carrying every per-tablet group destined to
    /// `server_id`. Returns the ops that should be re-resolved and retried.
    async fn send_to_server(
        self: &Arc<Self>,
        server_id: ServerId,
        batches: Vec<(TabletId, Vec<QueuedOp>)>,
        deadline: Instant,
    ) -> Vec<QueuedOp> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.fail_timed_out(batches.into_iter().flat_map(|(_, ops)| ops).collect());
            return Vec::new();
        }

        let connection = match self.context.registry.connection(server_id).await {
            Ok(connection) => connection,
            Err(error) => {
                // The replica may have moved or died; demote it so the next
                // resolution refreshes from the master.
                warn!("Connection to tablet server {server_id} failed, will retry: {error}");
                let mut retry = Vec::new();
                for (tablet_id, ops) in batches {
                    if let Some(first) = ops.first() {
                        self.context.meta_cache.mark_follower(
                            first.op.table().id(),
                            tablet_id,
                            server_id,
                        );
                    }
                    retry.extend(ops);
                }
                return retry;
            }
        };

        let mut tablet_batches = Vec::with_capacity(batches.len());
        let mut ops_by_tablet: HashMap<TabletId, Vec<QueuedOp>> = HashMap::new();
        for (tablet_id, mut ops) in batches {
            let mut block = OpBlockBuilder::new();
            for queued in &mut ops {
                block.append(queued.op.kind().code(), &queued.key, &queued.payload);
                queued.dispatched = true;
            }
            tablet_batches.push(PbTabletWriteBatch {
                tablet_id,
                num_ops: block.num_ops(),
                ops_block: block.build(),
            });
            ops_by_tablet.insert(tablet_id, ops);
        }

        let request = WriteRequest {
            tablet_batches,
            timeout_ms: remaining.as_millis() as u64,
        };

        let response = match connection.request(request, remaining).await {
            Ok(response) => response,
            Err(Error::TimedOut { .. }) => {
                // Budget exhausted after dispatch: the server may still have
                // applied these rows.
                self.fail_timed_out(ops_by_tablet.into_values().flatten().collect());
                return Vec::new();
            }
            Err(error) => {
                warn!("Write RPC to tablet server {server_id} failed, will retry: {error}");
                self.context.registry.mark_unreachable(server_id);
                let mut retry = Vec::new();
                for (tablet_id, ops) in ops_by_tablet {
                    if let Some(first) = ops.first() {
                        self.context.meta_cache.mark_follower(
                            first.op.table().id(),
                            tablet_id,
                            server_id,
                        );
                    }
                    retry.extend(ops);
                }
                return retry;
            }
        };

        if self.is_aborted() {
            // Responses of an aborted batcher are discarded; the ops were
            // already reported when the abort ran.
            for queued in ops_by_tablet.into_values().flatten() {
                let possibly = queued.dispatched;
                queued.terminate_err(
                    self,
                    Error::aborted("operation discarded by session close"),
                    possibly,
                );
            }
            return Vec::new();
        }

        let mut retry = Vec::new();
        let mut results: HashMap<TabletId, _> = response
            .tablet_results
            .into_iter()
            .map(|r| (r.tablet_id, r))
            .collect();

        for (tablet_id, ops) in ops_by_tablet {
            let Some(result) = results.remove(&tablet_id) else {
                for queued in ops {
                    queued.terminate_err(
                        self,
                        Error::unexpected(format!(
                            "server {server_id} returned no result for tablet {tablet_id}"
                        )),
                        true,
                    );
                }
                continue;
            };

            if let Some(error) = result.error {
                let code = ServerErrorCode::for_code(error.code);
                let table_id = ops.first().map(|q| q.op.table().id()).unwrap_or_default();
                match code {
                    ServerErrorCode::NotLeader => {
                        debug!(
                            "Server {server_id} is not the leader of tablet {tablet_id}; refreshing"
                        );
                        self.context
                            .meta_cache
                            .mark_follower(table_id, tablet_id, server_id);
                        retry.extend(ops);
                    }
                    ServerErrorCode::TabletNotFound => {
                        debug!("Tablet {tablet_id} moved off server {server_id}; refreshing");
                        self.context.meta_cache.invalidate(table_id, tablet_id);
                        retry.extend(ops);
                    }
                    ServerErrorCode::ServiceUnavailable => {
                        retry.extend(ops);
                    }
                    other => {
                        for queued in ops {
                            queued.terminate_err(
                                self,
                                other.to_error(error.message.clone()),
                                false,
                            );
                        }
                    }
                }
                continue;
            }

            let mut row_errors: HashMap<u32, _> = result
                .row_errors
                .into_iter()
                .map(|e| (e.op_index, e))
                .collect();
            for (index, queued) in ops.into_iter().enumerate() {
                match row_errors.remove(&(index as u32)) {
                    Some(row_error) => {
                        let error =
                            ServerErrorCode::for_code(row_error.code).to_error(row_error.message);
                        // Row-level logical errors are deterministic rejects;
                        // they are never retried.
                        queued.terminate_err(self, error, false);
                    }
                    None => queued.terminate_ok(self),
                }
            }
        }

        retry
    }
}
