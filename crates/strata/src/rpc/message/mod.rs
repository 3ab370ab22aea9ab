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

//! Typed request/response pairing for the framed protocol.

use crate::proto;
use crate::rpc::api_key::ApiKey;
use crate::rpc::api_version::ApiVersion;

/// A request message paired with its response type and method id.
pub trait RequestBody: prost::Message + Sized {
    type ResponseBody: prost::Message + Default;

    const API_KEY: ApiKey;
    const API_VERSION: ApiVersion = ApiVersion(0);
}

macro_rules! impl_request_body {
    ($request:ty, $response:ty, $api_key:expr) => {
        impl RequestBody for $request {
            type ResponseBody = $response;
            const API_KEY: ApiKey = $api_key;
        }
    };
}

impl_request_body!(
    proto::GetTableSchemaRequest,
    proto::GetTableSchemaResponse,
    ApiKey::GetTableSchema
);
impl_request_body!(
    proto::GetTableLocationsRequest,
    proto::GetTableLocationsResponse,
    ApiKey::GetTableLocations
);
impl_request_body!(
    proto::CreateTableRequest,
    proto::CreateTableResponse,
    ApiKey::CreateTable
);
impl_request_body!(
    proto::IsCreateTableDoneRequest,
    proto::IsCreateTableDoneResponse,
    ApiKey::IsCreateTableDone
);
impl_request_body!(
    proto::AlterTableRequest,
    proto::AlterTableResponse,
    ApiKey::AlterTable
);
impl_request_body!(
    proto::IsAlterTableDoneRequest,
    proto::IsAlterTableDoneResponse,
    ApiKey::IsAlterTableDone
);
impl_request_body!(
    proto::DeleteTableRequest,
    proto::DeleteTableResponse,
    ApiKey::DeleteTable
);
impl_request_body!(
    proto::ListTablesRequest,
    proto::ListTablesResponse,
    ApiKey::ListTables
);
impl_request_body!(
    proto::TableExistsRequest,
    proto::TableExistsResponse,
    ApiKey::TableExists
);
impl_request_body!(proto::WriteRequest, proto::WriteResponse, ApiKey::Write);
impl_request_body!(
    proto::ScanOpenRequest,
    proto::ScanOpenResponse,
    ApiKey::ScanOpen
);
impl_request_body!(
    proto::ScanNextRequest,
    proto::ScanNextResponse,
    ApiKey::ScanNext
);
impl_request_body!(
    proto::ScanCloseRequest,
    proto::ScanCloseResponse,
    ApiKey::ScanClose
);
