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

//! Non-blocking point-to-point RPC plumbing: framed transport, per-server
//! connections with correlation-id multiplexing, and a proxy factory keyed
//! by server address.

pub mod api_key;
pub mod api_version;
mod error;
pub mod frame;
pub mod message;
mod server_connection;
mod transport;

pub use api_key::ApiKey;
pub use api_version::ApiVersion;
pub use error::RpcError;
pub use message::RequestBody;
pub use server_connection::{RpcClient, ServerConnection, ServerConnectionInner};
pub use transport::Transport;
