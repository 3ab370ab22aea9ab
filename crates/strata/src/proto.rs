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

//! Wire messages of the master and tablet-server protocols, kept in sync
//! with `strata.proto` by hand.

use prost::bytes::Bytes;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbReplica {
    #[prost(int32, tag = "1")]
    pub server_id: i32,
    #[prost(string, tag = "2")]
    pub host: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub port: u32,
    /// 0 = leader, 1 = follower, 2 = learner.
    #[prost(int32, tag = "4")]
    pub role: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbTabletLocation {
    #[prost(int64, tag = "1")]
    pub tablet_id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub start_key: Bytes,
    /// Empty means unbounded.
    #[prost(bytes = "bytes", tag = "3")]
    pub end_key: Bytes,
    #[prost(message, repeated, tag = "4")]
    pub replicas: ::prost::alloc::vec::Vec<PbReplica>,
    #[prost(uint64, tag = "5")]
    pub epoch: u64,
}

// ---- master protocol ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTableSchemaRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTableSchemaResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(int64, tag = "2")]
    pub table_id: i64,
    #[prost(bytes = "bytes", tag = "3")]
    pub schema_json: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTableLocationsRequest {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    /// Start of the probed range in encoded-key space.
    #[prost(bytes = "bytes", tag = "2")]
    pub start_key: Bytes,
    #[prost(uint32, tag = "3")]
    pub max_tablets: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTableLocationsResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(message, repeated, tag = "2")]
    pub tablets: ::prost::alloc::vec::Vec<PbTabletLocation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateTableRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "2")]
    pub schema_json: Bytes,
    #[prost(int32, tag = "3")]
    pub num_replicas: i32,
    /// Encoded-key split points; n split keys produce n + 1 tablets.
    #[prost(bytes = "bytes", repeated, tag = "4")]
    pub split_keys: ::prost::alloc::vec::Vec<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateTableResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(int64, tag = "2")]
    pub table_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsCreateTableDoneRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsCreateTableDoneResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(bool, tag = "2")]
    pub done: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlterTableRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "2")]
    pub new_table_name: ::core::option::Option<::prost::alloc::string::String>,
    /// JSON-encoded list of alteration steps.
    #[prost(bytes = "bytes", tag = "3")]
    pub steps_json: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlterTableResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsAlterTableDoneRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsAlterTableDoneResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(bool, tag = "2")]
    pub done: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteTableRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteTableResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListTablesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListTablesResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(string, repeated, tag = "2")]
    pub table_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableExistsRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableExistsResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(bool, tag = "2")]
    pub exists: bool,
}

// ---- tablet-server protocol ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbTabletWriteBatch {
    #[prost(int64, tag = "1")]
    pub tablet_id: i64,
    #[prost(uint32, tag = "2")]
    pub num_ops: u32,
    /// Op block as produced by `row::OpBlockBuilder`.
    #[prost(bytes = "bytes", tag = "3")]
    pub ops_block: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub tablet_batches: ::prost::alloc::vec::Vec<PbTabletWriteBatch>,
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbRowError {
    /// Index of the op within its tablet batch.
    #[prost(uint32, tag = "1")]
    pub op_index: u32,
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbTabletWriteResult {
    #[prost(int64, tag = "1")]
    pub tablet_id: i64,
    /// Tablet-level error (e.g. NotLeader); when set, no row was applied.
    #[prost(message, optional, tag = "2")]
    pub error: ::core::option::Option<PbError>,
    #[prost(message, repeated, tag = "3")]
    pub row_errors: ::prost::alloc::vec::Vec<PbRowError>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteResponse {
    #[prost(message, repeated, tag = "1")]
    pub tablet_results: ::prost::alloc::vec::Vec<PbTabletWriteResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbColumnPredicate {
    #[prost(uint32, tag = "1")]
    pub column_index: u32,
    /// Inclusive encoded cell bound.
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub lower: ::core::option::Option<Bytes>,
    /// Inclusive encoded cell bound.
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub upper: ::core::option::Option<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbRowBlock {
    #[prost(uint32, tag = "1")]
    pub num_rows: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanOpenRequest {
    #[prost(int64, tag = "1")]
    pub tablet_id: i64,
    #[prost(uint32, repeated, tag = "2")]
    pub projection: ::prost::alloc::vec::Vec<u32>,
    #[prost(message, repeated, tag = "3")]
    pub predicates: ::prost::alloc::vec::Vec<PbColumnPredicate>,
    /// 0 = read latest, 1 = read at snapshot.
    #[prost(int32, tag = "4")]
    pub read_mode: i32,
    #[prost(uint64, optional, tag = "5")]
    pub snapshot_ts_micros: ::core::option::Option<u64>,
    #[prost(uint32, tag = "6")]
    pub batch_size_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanOpenResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(uint64, tag = "2")]
    pub scanner_id: u64,
    #[prost(message, optional, tag = "3")]
    pub rows: ::core::option::Option<PbRowBlock>,
    /// More data remains in this tablet.
    #[prost(bool, tag = "4")]
    pub has_more: bool,
    /// Set in snapshot mode when the server chose the timestamp.
    #[prost(uint64, optional, tag = "5")]
    pub snapshot_ts_micros: ::core::option::Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanNextRequest {
    #[prost(uint64, tag = "1")]
    pub scanner_id: u64,
    #[prost(uint32, tag = "2")]
    pub batch_size_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanNextResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
    #[prost(message, optional, tag = "2")]
    pub rows: ::core::option::Option<PbRowBlock>,
    #[prost(bool, tag = "3")]
    pub has_more: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanCloseRequest {
    #[prost(uint64, tag = "1")]
    pub scanner_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanCloseResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<PbError>,
}

// ---- framing ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    #[prost(int32, tag = "1")]
    pub api_key: i32,
    #[prost(int32, tag = "2")]
    pub api_version: i32,
    #[prost(int32, tag = "3")]
    pub correlation_id: i32,
    #[prost(string, tag = "4")]
    pub client_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(int32, tag = "1")]
    pub correlation_id: i32,
    /// Request-level failure; when set the body is absent.
    #[prost(message, optional, tag = "2")]
    pub error: ::core::option::Option<PbError>,
}
