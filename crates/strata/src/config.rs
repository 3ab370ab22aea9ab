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

use serde::{Deserialize, Serialize};

/// Client configuration. All tuning is programmatic; there are no
/// environment variables or config files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// RPC address of the catalog master. Required.
    pub master_addr: String,

    /// Timeout for administrative operations (create/alter/delete table,
    /// schema and location lookups against the master).
    /// Default: 5000
    pub admin_timeout_ms: u64,

    /// Timeout for establishing a connection to a server.
    /// Default: 3000
    pub connect_timeout_ms: u64,

    /// Default per-session write timeout, covering tablet resolution,
    /// dispatch and internal retries of one batch.
    /// Default: 10000
    pub write_timeout_ms: u64,

    /// Default per-session mutation buffer space in bytes.
    /// Default: 7 MiB
    pub mutation_buffer_bytes: usize,

    /// Interval of the periodic background-mode flush trigger.
    /// Default: 1000
    pub flush_interval_ms: u64,

    /// Default hint for the byte size of scan batches.
    /// Default: 1 MiB
    pub scan_batch_size_bytes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            master_addr: String::new(),
            admin_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            write_timeout_ms: 10_000,
            mutation_buffer_bytes: 7 * 1024 * 1024,
            flush_interval_ms: 1_000,
            scan_batch_size_bytes: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Checks the required fields. Returns the problem as a plain message so
    /// the caller can decide which error to wrap it in.
    pub fn validate(&self) -> Result<(), String> {
        if self.master_addr.is_empty() {
            return Err("master address is required".to_string());
        }
        if self.mutation_buffer_bytes == 0 {
            return Err("mutation buffer space must be non-zero".to_string());
        }
        Ok(())
    }
}
