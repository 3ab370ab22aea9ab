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

//! One-shot broadcast: one producer, many waiters, value delivered at most
//! once to each waiter. Used to coalesce concurrent location lookups and to
//! let multiple callers await one batcher's completion.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Error observed by receivers when the sender is dropped without
/// broadcasting a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    Dropped,
}

enum State<T> {
    Pending(Vec<oneshot::Sender<Result<T, RecvError>>>),
    Done(T),
    Dropped,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// The sending half. Dropping it without calling `broadcast` fails all
/// current and future receivers with [`RecvError::Dropped`].
pub struct BroadcastOnce<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for BroadcastOnce<T> {
    fn default() -> Self {
        BroadcastOnce {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
            }),
        }
    }
}

impl<T: Clone> BroadcastOnce<T> {
    pub fn receiver(&self) -> BroadcastOnceReceiver<T> {
        BroadcastOnceReceiver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Delivers `value` to every current and future receiver. Subsequent
    /// calls are ignored.
    pub fn broadcast(&self, value: T) {
        let mut state = self.shared.state.lock();
        if let State::Pending(waiters) = &mut *state {
            let waiters = std::mem::take(waiters);
            for waiter in waiters {
                waiter.send(Ok(value.clone())).ok();
            }
            *state = State::Done(value);
        }
    }
}

impl<T> Drop for BroadcastOnce<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let State::Pending(waiters) = &mut *state {
            for waiter in std::mem::take(waiters) {
                waiter.send(Err(RecvError::Dropped)).ok();
            }
            *state = State::Dropped;
        }
    }
}

#[derive(Clone)]
pub struct BroadcastOnceReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> BroadcastOnceReceiver<T> {
    pub async fn receive(&self) -> Result<T, RecvError> {
        let rx = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Done(value) => return Ok(value.clone()),
                State::Dropped => return Err(RecvError::Dropped),
                State::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(RecvError::Dropped))
    }

    /// Returns the value without waiting, if already broadcast.
    pub fn peek(&self) -> Option<T> {
        match &*self.shared.state.lock() {
            State::Done(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T> std::fmt::Debug for BroadcastOnceReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastOnceReceiver").finish_non_exhaustive()
    }
}
