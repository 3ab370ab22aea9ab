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

//! Application-facing write context: a session groups operations into
//! batchers under one of three flush disciplines and collects per-operation
//! failures into a bounded error buffer.

use crate::client::ClientContext;
use crate::client::batcher::{Batcher, FlushCallback, OpCallback};
use crate::client::write_op::WriteOperation;
use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Maximum number of errors retained by a session's error collector.
const MAX_PENDING_ERRORS: usize = 1024;

/// Fraction of the mutation buffer that triggers an implicit background
/// flush, in percent.
const FLUSH_WATERMARK_PCT: usize = 50;

/// How a session dispatches applied operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Every apply dispatches and awaits its own single-op batch. The
    /// session buffer is never non-empty and `flush` is a no-op.
    Sync,
    /// Applies accumulate and are flushed by a byte watermark or a periodic
    /// trigger; a full buffer suspends the caller. Errors surface through
    /// the error collector.
    Background,
    /// Applies accumulate until an explicit `flush`. Exceeding the buffer
    /// fails the apply with `Incomplete`.
    Manual,
}

impl FlushMode {
    fn code(self) -> u8 {
        match self {
            FlushMode::Sync => 0,
            FlushMode::Background => 1,
            FlushMode::Manual => 2,
        }
    }

    fn for_code(code: u8) -> FlushMode {
        match code {
            1 => FlushMode::Background,
            2 => FlushMode::Manual,
            _ => FlushMode::Sync,
        }
    }
}

/// A failed operation paired with its status. The caller reclaims the
/// operation with [`SessionError::release_failed_op`].
#[derive(Debug)]
pub struct SessionError {
    op: WriteOperation,
    status: Error,
    was_possibly_successful: bool,
}

impl SessionError {
    pub(crate) fn new(op: WriteOperation, status: Error, was_possibly_successful: bool) -> Self {
        SessionError {
            op,
            status,
            was_possibly_successful,
        }
    }

    pub fn status(&self) -> &Error {
        &self.status
    }

    pub fn failed_op(&self) -> &WriteOperation {
        &self.op
    }

    /// True when the server may have applied the operation even though the
    /// client saw a failure (timeout, connection reset after send).
    pub fn was_possibly_successful(&self) -> bool {
        self.was_possibly_successful
    }

    /// Takes back ownership of the failed operation.
    pub fn release_failed_op(self) -> WriteOperation {
        self.op
    }
}

/// Bounded ring of session errors. On overflow the oldest error is evicted
/// and the overflow flag set until the next drain.
pub(crate) struct ErrorCollector {
    errors: Mutex<VecDeque<SessionError>>,
    overflowed: AtomicBool,
}

impl ErrorCollector {
    pub(crate) fn new() -> Self {
        ErrorCollector {
            errors: Mutex::new(VecDeque::new()),
            overflowed: AtomicBool::new(false),
        }
    }

    pub(crate) fn add(&self, error: SessionError) {
        let mut errors = self.errors.lock();
        if errors.len() >= MAX_PENDING_ERRORS {
            errors.pop_front();
            self.overflowed.store(true, Ordering::Release);
        }
        errors.push_back(error);
    }

    pub(crate) fn count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Atomically drains all errors and resets the overflow flag.
    pub(crate) fn drain(&self) -> (Vec<SessionError>, bool) {
        let mut errors = self.errors.lock();
        let drained = errors.drain(..).collect();
        let overflowed = self.overflowed.swap(false, Ordering::AcqRel);
        (drained, overflowed)
    }
}

/// Byte-counting gate over the session's outbound buffer. Background-mode
/// appliers wait for space; manual-mode appliers fail fast.
pub(crate) struct MutationBuffer {
    used: Mutex<usize>,
    capacity: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
}

impl MutationBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        MutationBuffer {
            used: Mutex::new(0),
            capacity: AtomicUsize::new(capacity),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn try_reserve(&self, size: usize) -> bool {
        let mut used = self.used.lock();
        if *used + size > self.capacity() {
            return false;
        }
        *used += size;
        true
    }

    /// Waits until `size` bytes fit. Fails with `Aborted` once closed, and
    /// with `InvalidArgument` for a request larger than the whole buffer.
    pub(crate) async fn reserve(&self, size: usize) -> Result<()> {
        if size > self.capacity() {
            return Err(Error::invalid_argument(format!(
                "operation of {size} bytes exceeds the mutation buffer of {} bytes",
                self.capacity()
            )));
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::aborted("session closed while awaiting buffer space"));
            }
            // Register for wakeups before re-checking, so a release between
            // the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_reserve(size) {
                return Ok(());
            }
            notified.await;
        }
    }

    pub(crate) fn release(&self, size: usize) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(size);
        drop(used);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> usize {
        *self.used.lock()
    }
}

pub(crate) struct SessionInner {
    context: Arc<ClientContext>,
    mode: AtomicU8,
    timeout_ms: AtomicU64,
    priority: AtomicI32,
    pub(crate) buffer: Arc<MutationBuffer>,
    pub(crate) errors: Arc<ErrorCollector>,
    current: Mutex<Option<Arc<Batcher>>>,
    /// Batchers flushed but not yet Complete or Aborted.
    flushed_incomplete: AtomicUsize,
    closed: AtomicBool,
    next_seq: AtomicU64,
}

impl SessionInner {
    fn mode(&self) -> FlushMode {
        FlushMode::for_code(self.mode.load(Ordering::Acquire))
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// Adds an op to the current batcher, installing a fresh one on demand.
    /// Runs under the `current` lock so a concurrent flush cannot close the
    /// batcher between installation and the add.
    fn add_to_current(
        self: &Arc<Self>,
        op: WriteOperation,
        callback: Option<OpCallback>,
    ) -> Result<Arc<Batcher>> {
        let mut current = self.current.lock();
        let batcher = match current.as_ref() {
            Some(batcher) => Arc::clone(batcher),
            None => {
                let batcher = Batcher::new(
                    Arc::clone(&self.context),
                    Arc::clone(&self.errors),
                    Arc::clone(&self.buffer),
                    true,
                    self.timeout(),
                );
                *current = Some(Arc::clone(&batcher));
                batcher
            }
        };
        batcher.add(op, callback)?;
        Ok(batcher)
    }

    /// Closes the current batcher (if any), associates the callback with it
    /// and leaves the session ready to install a fresh one. An absent or
    /// empty batcher completes immediately, firing the callback inline.
    fn flush_async_impl(self: &Arc<Self>, callback: Option<FlushCallback>) {
        let batcher = self.current.lock().take();
        match batcher {
            Some(batcher) => {
                self.flushed_incomplete.fetch_add(1, Ordering::AcqRel);
                let inner = Arc::clone(self);
                batcher.flush(Some(Box::new(move |result| {
                    inner.flushed_incomplete.fetch_sub(1, Ordering::AcqRel);
                    if let Some(callback) = callback {
                        callback(result);
                    }
                })));
            }
            None => {
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
            }
        }
    }

    fn watermark(&self) -> usize {
        self.buffer.capacity() * FLUSH_WATERMARK_PCT / 100
    }

    fn has_pending_operations(&self) -> bool {
        if self.flushed_incomplete.load(Ordering::Acquire) > 0 {
            return true;
        }
        self.current
            .lock()
            .as_ref()
            .is_some_and(|batcher| !batcher.is_empty())
    }

    /// Background-mode acceptance: waits for buffer space, adds to the
    /// current batcher, and flushes implicitly past the watermark.
    async fn background_accept(
        self: &Arc<Self>,
        op: WriteOperation,
        callback: Option<OpCallback>,
    ) -> Result<()> {
        let size = op.byte_size();
        self.buffer.reserve(size).await?;
        if self.closed.load(Ordering::Acquire) {
            self.buffer.release(size);
            let error = Error::illegal_state("session is closed");
            if let Some(callback) = callback {
                callback(Err(error.clone()));
            }
            return Err(error);
        }
        let batcher = match self.add_to_current(op, callback) {
            Ok(batcher) => batcher,
            Err(error) => {
                self.buffer.release(size);
                return Err(error);
            }
        };
        if batcher.buffered_bytes() >= self.watermark() {
            debug!("Mutation buffer passed its flush watermark; flushing in the background");
            self.flush_async_impl(None);
        }
        Ok(())
    }
}

/// A context for writing to the cluster. See [`FlushMode`] for the
/// dispatch disciplines.
///
/// `apply`, `flush_async`, `flush` and the error queries are safe for
/// concurrent callers; the `set_*` configuration methods take `&mut self`
/// and require the caller to serialize them externally.
pub struct Session {
    inner: Arc<SessionInner>,
    flusher: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(context: Arc<ClientContext>) -> Session {
        let buffer = Arc::new(MutationBuffer::new(context.config.mutation_buffer_bytes));
        let timeout_ms = context.config.write_timeout_ms;
        let flush_interval_ms = context.config.flush_interval_ms.max(1);
        let inner = Arc::new(SessionInner {
            context,
            mode: AtomicU8::new(FlushMode::Sync.code()),
            timeout_ms: AtomicU64::new(timeout_ms),
            priority: AtomicI32::new(0),
            buffer,
            errors: Arc::new(ErrorCollector::new()),
            current: Mutex::new(None),
            flushed_incomplete: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        // Periodic trigger for background mode. Holds a weak reference so an
        // abandoned session is not kept alive by its flusher.
        let weak = Arc::downgrade(&inner);
        let flusher = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(flush_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                if inner.mode() != FlushMode::Background {
                    continue;
                }
                let has_work = inner
                    .current
                    .lock()
                    .as_ref()
                    .is_some_and(|batcher| !batcher.is_empty());
                if has_work {
                    inner.flush_async_impl(None);
                }
            }
        });

        Session {
            inner,
            flusher: Some(flusher),
        }
    }

    /// Changes the flush mode. Requires no pending operations, buffered or
    /// in flight.
    pub fn set_flush_mode(&mut self, mode: FlushMode) -> Result<()> {
        if self.inner.has_pending_operations() {
            return Err(Error::invalid_argument(
                "cannot change the flush mode with pending operations",
            ));
        }
        self.inner.mode.store(mode.code(), Ordering::Release);
        Ok(())
    }

    /// Sets the buffer space used by this session for outbound writes.
    pub fn set_mutation_buffer_space(&mut self, bytes: usize) {
        self.inner.buffer.set_capacity(bytes);
    }

    /// Sets the timeout applied to each flushed batch, covering tablet
    /// resolution, dispatch and internal retries.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Accepted and stored; scheduling by priority is not implemented.
    pub fn set_priority(&mut self, priority: i32) {
        self.inner.priority.store(priority, Ordering::Release);
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.inner.mode()
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::illegal_state("session is closed"));
        }
        Ok(())
    }

    /// Applies one write operation under the current flush mode. Ownership
    /// of the op transfers to the session; on failure it is reclaimable
    /// from the error collector.
    pub async fn apply(&self, mut op: WriteOperation) -> Result<()> {
        self.check_open()?;
        op.assign_seq(self.inner.next_seq.fetch_add(1, Ordering::AcqRel));

        match self.inner.mode() {
            FlushMode::Sync => {
                let batcher = Batcher::new(
                    Arc::clone(&self.inner.context),
                    Arc::clone(&self.inner.errors),
                    Arc::clone(&self.inner.buffer),
                    false,
                    self.inner.timeout(),
                );
                batcher.add(op, None)?;
                self.inner.flushed_incomplete.fetch_add(1, Ordering::AcqRel);
                let inner = Arc::clone(&self.inner);
                batcher.flush(Some(Box::new(move |_| {
                    inner.flushed_incomplete.fetch_sub(1, Ordering::AcqRel);
                })));
                batcher.wait().await
            }
            FlushMode::Manual => {
                let size = op.byte_size();
                if !self.inner.buffer.try_reserve(size) {
                    let error = Error::Incomplete {
                        message: "mutation buffer space is exhausted".to_string(),
                    };
                    self.inner
                        .errors
                        .add(SessionError::new(op, error.clone(), false));
                    return Err(error);
                }
                if let Err(error) = self.inner.add_to_current(op, None) {
                    self.inner.buffer.release(size);
                    return Err(error);
                }
                Ok(())
            }
            FlushMode::Background => self.inner.background_accept(op, None).await,
        }
    }

    /// Like [`Session::apply`] but never suspends the caller. The callback
    /// fires exactly once with the operation's terminal status; it may fire
    /// inline on this thread.
    pub fn apply_async(
        &self,
        mut op: WriteOperation,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        if self.check_open().is_err() {
            callback(Err(Error::illegal_state("session is closed")));
            return;
        }
        op.assign_seq(self.inner.next_seq.fetch_add(1, Ordering::AcqRel));
        let callback: OpCallback = Box::new(callback);

        match self.inner.mode() {
            FlushMode::Sync => {
                let batcher = Batcher::new(
                    Arc::clone(&self.inner.context),
                    Arc::clone(&self.inner.errors),
                    Arc::clone(&self.inner.buffer),
                    false,
                    self.inner.timeout(),
                );
                if batcher.add(op, Some(callback)).is_err() {
                    // the callback already fired with the add error
                    return;
                }
                self.inner.flushed_incomplete.fetch_add(1, Ordering::AcqRel);
                let inner = Arc::clone(&self.inner);
                batcher.flush(Some(Box::new(move |_| {
                    inner.flushed_incomplete.fetch_sub(1, Ordering::AcqRel);
                })));
            }
            FlushMode::Manual => {
                let size = op.byte_size();
                if !self.inner.buffer.try_reserve(size) {
                    let error = Error::Incomplete {
                        message: "mutation buffer space is exhausted".to_string(),
                    };
                    callback(Err(error.clone()));
                    self.inner.errors.add(SessionError::new(op, error, false));
                    return;
                }
                if self.inner.add_to_current(op, Some(callback)).is_err() {
                    // the callback already fired with the add error
                    self.inner.buffer.release(size);
                }
            }
            FlushMode::Background => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    // Errors reach the callback and the collector inside.
                    let _ = inner.background_accept(op, Some(callback)).await;
                });
            }
        }
    }

    /// Closes the current batcher and flushes it in the background. The
    /// callback is tied to that batcher only: a later `flush_async` gets an
    /// independent callback, and the two may fire in either order.
    pub fn flush_async(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.inner.flush_async_impl(Some(Box::new(callback)));
    }

    /// Flushes the current batcher and waits for it to complete. Returns a
    /// summary error if any op failed; details via
    /// [`Session::get_pending_errors`].
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.flush_async_impl(Some(Box::new(move |result| {
            tx.send(result).ok();
        })));
        rx.await
            .unwrap_or_else(|_| Err(Error::aborted("flush abandoned")))
    }

    /// Fails with `IllegalState` if operations are buffered or in flight.
    pub fn close(&mut self) -> Result<()> {
        if self.inner.has_pending_operations() {
            return Err(Error::illegal_state(
                "cannot close a session with pending operations",
            ));
        }
        self.inner.closed.store(true, Ordering::Release);
        self.inner.buffer.close();
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        Ok(())
    }

    /// True while operations are buffered or flushed-but-unresolved.
    pub fn has_pending_operations(&self) -> bool {
        self.inner.has_pending_operations()
    }

    /// Number of applied operations not yet flushed. Only manual mode can
    /// observe a non-zero value across calls.
    pub fn count_buffered_operations(&self) -> usize {
        self.inner
            .current
            .lock()
            .as_ref()
            .map(|batcher| batcher.buffered_ops())
            .unwrap_or(0)
    }

    pub fn count_pending_errors(&self) -> usize {
        self.inner.errors.count()
    }

    /// Drains the pending errors. The second value reports whether errors
    /// were evicted because the collector overflowed since the last drain.
    pub fn get_pending_errors(&self) -> (Vec<SessionError>, bool) {
        self.inner.errors.drain()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.buffer.close();
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        // Unflushed work is abandoned: ops land in the collector as Aborted
        // and any in-flight responses are discarded.
        if let Some(batcher) = self.inner.current.lock().take() {
            batcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::write_op::WriteOperation;
    use crate::error::Error;
    use crate::test_utils::MockCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn insert(table: &crate::client::Table, key: i32, val: &str) -> WriteOperation {
        let mut op = table.new_insert();
        op.row_mut().set_i32(0, key).unwrap();
        op.row_mut().set_string(1, val).unwrap();
        op
    }

    // Sync insert: returns OK with nothing buffered, pending or errored.
    #[tokio::test]
    async fn sync_insert() {
        let cluster = MockCluster::start(1).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let session = client.new_session();
        session.apply(insert(&table, 1, "one")).await.unwrap();

        assert_eq!(session.count_buffered_operations(), 0);
        assert!(!session.has_pending_operations());
        assert_eq!(session.count_pending_errors(), 0);
        assert!(cluster.has_row(table_id, 1));
    }

    // Manual overflow: the apply that would exceed the buffer fails with
    // Incomplete and the rejected op lands in the collector.
    #[tokio::test]
    async fn manual_mode_overflow() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();
        session.set_mutation_buffer_space(1024);

        let payload = "x".repeat(64);
        let mut rejected_at = None;
        for i in 0..64 {
            match session.apply(insert(&table, i, &payload)).await {
                Ok(()) => {}
                Err(Error::Incomplete { .. }) => {
                    rejected_at = Some(i);
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let rejected_at = rejected_at.expect("buffer should overflow");
        assert!(rejected_at >= 1);

        let (errors, overflowed) = session.get_pending_errors();
        assert!(!overflowed);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].status(), Error::Incomplete { .. }));
        assert!(!errors[0].was_possibly_successful());
        let op = errors.into_iter().next().unwrap().release_failed_op();
        assert_eq!(op.row().get(0), Some(&crate::row::Datum::Int32(rejected_at)));

        // accepted ops are still buffered and flushable
        assert_eq!(session.count_buffered_operations(), rejected_at as usize);
        session.flush().await.unwrap();
        assert_eq!(session.count_buffered_operations(), 0);
        let table_id = cluster.table_id("t");
        assert_eq!(cluster.row_count(table_id), rejected_at as usize);
    }

    // Two flush_async calls get independent callbacks; each batcher's fires
    // exactly once after its own ops terminate.
    #[tokio::test]
    async fn background_double_flush_callbacks() {
        let cluster = MockCluster::start(1).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Background).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));

        session.apply(insert(&table, 1, "a")).await.unwrap();
        let (tx1, rx1) = tokio::sync::oneshot::channel();
        let fired1 = Arc::clone(&fired);
        session.flush_async(move |result| {
            fired1.fetch_add(1, Ordering::AcqRel);
            tx1.send(result).ok();
        });

        session.apply(insert(&table, 2, "b")).await.unwrap();
        let (tx2, rx2) = tokio::sync::oneshot::channel();
        let fired2 = Arc::clone(&fired);
        session.flush_async(move |result| {
            fired2.fetch_add(1, Ordering::AcqRel);
            tx2.send(result).ok();
        });

        rx1.await.unwrap().unwrap();
        rx2.await.unwrap().unwrap();
        assert_eq!(fired.load(Ordering::Acquire), 2);
        assert!(cluster.has_row(table_id, 1));
        assert!(cluster.has_row(table_id, 2));
        assert!(!session.has_pending_operations());
    }

    // A flush_async with no intervening apply completes immediately.
    #[tokio::test]
    async fn empty_flush_fires_immediately() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        session.flush_async(move |result| {
            assert!(result.is_ok());
            fired2.store(true, Ordering::Release);
        });
        assert!(fired.load(Ordering::Acquire));

        // flush on an empty session is a no-op returning OK in any mode
        session.flush().await.unwrap();
        session.set_flush_mode(FlushMode::Sync).unwrap();
        session.flush().await.unwrap();
    }

    // Timeout ambiguity: the server receives the write but never answers;
    // the error reports possibly-successful.
    #[tokio::test]
    async fn timeout_is_possibly_successful() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();
        let server = cluster.server_ids()[0];

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();
        session.set_timeout(Duration::from_millis(300));

        session.apply(insert(&table, 1, "lost")).await.unwrap();
        // warm the location cache before partitioning writes
        cluster.partition_server(server);

        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, Error::RowErrors { count: 1 }));

        let (errors, _) = session.get_pending_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].status(), Error::TimedOut { .. }));
        assert!(errors[0].was_possibly_successful());
    }

    // Leader failover: first write returns NotLeader, the cache refreshes
    // and the retry against the new leader succeeds within the same apply.
    #[tokio::test]
    async fn sync_write_survives_leader_change() {
        let cluster = MockCluster::start(2).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let tablet = cluster.tablet_ids(table_id)[0];
        let old_leader = cluster.leader_of(tablet);
        let new_leader = cluster
            .server_ids()
            .into_iter()
            .find(|id| *id != old_leader)
            .unwrap();

        let session = client.new_session();
        // seed the cache with the old leader, then move leadership
        session.apply(insert(&table, 1, "seed")).await.unwrap();
        cluster.set_leader(tablet, new_leader);

        session.apply(insert(&table, 2, "after")).await.unwrap();
        assert!(cluster.has_row(table_id, 2));
        assert_eq!(session.count_pending_errors(), 0);
    }

    // Duplicate key: a row-level logical error is not retried and surfaces
    // through the collector with possibly-successful false.
    #[tokio::test]
    async fn duplicate_key_not_retried() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let session = client.new_session();
        session.apply(insert(&table, 7, "first")).await.unwrap();
        let err = session.apply(insert(&table, 7, "dup")).await.unwrap_err();
        assert!(matches!(err, Error::RowErrors { count: 1 }));

        let (errors, _) = session.get_pending_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].status(), Error::AlreadyPresent { .. }));
        assert!(!errors[0].was_possibly_successful());
    }

    #[tokio::test]
    async fn mode_change_requires_no_pending_work() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();
        session.apply(insert(&table, 1, "a")).await.unwrap();

        let err = session.set_flush_mode(FlushMode::Sync).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        session.flush().await.unwrap();
        session.set_flush_mode(FlushMode::Sync).unwrap();
    }

    #[tokio::test]
    async fn close_with_pending_work_fails() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();
        session.apply(insert(&table, 1, "a")).await.unwrap();

        let err = session.close().unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));

        session.flush().await.unwrap();
        session.close().unwrap();

        // apply on a closed session is refused
        let err = session.apply(insert(&table, 2, "b")).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));
    }

    // Background mode reports errors through the collector, not from apply.
    #[tokio::test]
    async fn background_errors_reach_collector() {
        let cluster = MockCluster::start(1).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Background).unwrap();

        session.apply(insert(&table, 5, "first")).await.unwrap();
        session.apply(insert(&table, 5, "dup")).await.unwrap();
        session.flush().await.unwrap_err();

        let (errors, _) = session.get_pending_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].status(), Error::AlreadyPresent { .. }));
        assert!(cluster.has_row(table_id, 5));
    }

    #[tokio::test]
    async fn apply_async_callback_fires_once() {
        let cluster = MockCluster::start(1).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Manual).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        session.apply_async(insert(&table, 9, "v"), move |result| {
            fired2.fetch_add(1, Ordering::AcqRel);
            tx.take().unwrap().send(result).ok();
        });
        assert_eq!(fired.load(Ordering::Acquire), 0);

        session.flush().await.unwrap();
        rx.await.unwrap().unwrap();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(cluster.has_row(table_id, 9));
    }

    // Writes from two sessions of one client are never coalesced into a
    // single RPC.
    #[tokio::test]
    async fn sessions_do_not_share_rpcs() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();
        let server = cluster.server_ids()[0];

        let mut first = client.new_session();
        let mut second = client.new_session();
        first.set_flush_mode(FlushMode::Manual).unwrap();
        second.set_flush_mode(FlushMode::Manual).unwrap();

        first.apply(insert(&table, 1, "a")).await.unwrap();
        second.apply(insert(&table, 2, "b")).await.unwrap();

        let before = cluster.write_request_count(server);
        first.flush().await.unwrap();
        second.flush().await.unwrap();
        let after = cluster.write_request_count(server);
        assert_eq!(after - before, 2);
    }

    #[tokio::test]
    async fn collector_overflow_sets_flag() {
        let cluster = MockCluster::start(1).await;
        cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let session = client.new_session();
        for i in 0..(MAX_PENDING_ERRORS + 5) {
            let mut op = table.new_update();
            op.row_mut().set_i32(0, i as i32).unwrap();
            // update of a missing row is a logical NotFound error
            op.row_mut().set_string(1, "v").unwrap();
            session.apply(op).await.unwrap_err();
        }
        assert_eq!(session.count_pending_errors(), MAX_PENDING_ERRORS);
        let (errors, overflowed) = session.get_pending_errors();
        assert_eq!(errors.len(), MAX_PENDING_ERRORS);
        assert!(overflowed);
        // drain resets the flag
        let (errors, overflowed) = session.get_pending_errors();
        assert!(errors.is_empty());
        assert!(!overflowed);
    }

    // Background apply suspends when the buffer is full and resumes once
    // the in-flight flush drains.
    #[tokio::test]
    async fn background_apply_suspends_on_full_buffer() {
        let cluster = MockCluster::start(1).await;
        let table_id = cluster.create_int_table("t", &[]).await;
        let client = cluster.client().await;
        let table = client.open_table("t").await.unwrap();

        let mut session = client.new_session();
        session.set_flush_mode(FlushMode::Background).unwrap();
        // room for roughly one op
        session.set_mutation_buffer_space(120);

        let payload = "y".repeat(64);
        session.apply(insert(&table, 0, &payload)).await.unwrap();
        // the second apply must wait for the implicit flush to free space,
        // then complete
        tokio::time::timeout(
            Duration::from_secs(5),
            session.apply(insert(&table, 1, &payload)),
        )
        .await
        .expect("apply should unblock once the buffer drains")
        .unwrap();

        session.flush().await.unwrap();
        assert!(cluster.has_row(table_id, 0));
        assert!(cluster.has_row(table_id, 1));
    }
}
