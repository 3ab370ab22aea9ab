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

//! Rust client for Strata, a distributed tablet-sharded columnar store.
//!
//! The entry point is [`client::StrataClient`], built through
//! [`client::ClientBuilder`]. A client owns the location cache and the
//! tablet-server registry shared by all of its [`client::Session`]s,
//! [`client::Table`]s and [`client::Scanner`]s.

pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod proto;
pub mod row;
pub mod rpc;
pub(crate) mod util;

#[cfg(test)]
pub(crate) mod test_utils;

/// Identifier the master assigns to a table.
pub type TableId = i64;
/// Identifier the master assigns to a tablet.
pub type TabletId = i64;
/// Identifier the master assigns to a tablet server.
pub type ServerId = i32;
