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

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with multiplicative growth and proportional jitter.
/// 100ms initial, 2x multiplier, 5000ms cap, 0.2 jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    next_ms: f64,
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(100.0, 5000.0)
    }
}

impl ExponentialBackoff {
    pub fn new(initial_ms: f64, max_ms: f64) -> Self {
        ExponentialBackoff {
            next_ms: initial_ms,
            initial_ms,
            max_ms,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Returns the next delay and advances the backoff state.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_ms.min(self.max_ms);
        self.next_ms = (self.next_ms * self.multiplier).min(self.max_ms);
        let spread = base * self.jitter;
        let jittered = base + rand::rng().random_range(-spread..=spread);
        Duration::from_millis(jittered.max(1.0) as u64)
    }

    pub fn reset(&mut self) {
        self.next_ms = self.initial_ms;
    }
}
