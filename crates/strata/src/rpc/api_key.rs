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

/// Identifies the RPC method inside a request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    GetTableSchema,
    GetTableLocations,
    CreateTable,
    IsCreateTableDone,
    AlterTable,
    IsAlterTableDone,
    DeleteTable,
    ListTables,
    TableExists,
    Write,
    ScanOpen,
    ScanNext,
    ScanClose,
    Unknown(i32),
}

impl From<ApiKey> for i32 {
    fn from(key: ApiKey) -> i32 {
        match key {
            ApiKey::GetTableSchema => 1,
            ApiKey::GetTableLocations => 2,
            ApiKey::CreateTable => 3,
            ApiKey::IsCreateTableDone => 4,
            ApiKey::AlterTable => 5,
            ApiKey::IsAlterTableDone => 6,
            ApiKey::DeleteTable => 7,
            ApiKey::ListTables => 8,
            ApiKey::TableExists => 9,
            ApiKey::Write => 20,
            ApiKey::ScanOpen => 21,
            ApiKey::ScanNext => 22,
            ApiKey::ScanClose => 23,
            ApiKey::Unknown(code) => code,
        }
    }
}

impl From<i32> for ApiKey {
    fn from(code: i32) -> ApiKey {
        match code {
            1 => ApiKey::GetTableSchema,
            2 => ApiKey::GetTableLocations,
            3 => ApiKey::CreateTable,
            4 => ApiKey::IsCreateTableDone,
            5 => ApiKey::AlterTable,
            6 => ApiKey::IsAlterTableDone,
            7 => ApiKey::DeleteTable,
            8 => ApiKey::ListTables,
            9 => ApiKey::TableExists,
            20 => ApiKey::Write,
            21 => ApiKey::ScanOpen,
            22 => ApiKey::ScanNext,
            23 => ApiKey::ScanClose,
            other => ApiKey::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_round_trip() {
        for key in [
            ApiKey::GetTableSchema,
            ApiKey::GetTableLocations,
            ApiKey::CreateTable,
            ApiKey::IsCreateTableDone,
            ApiKey::AlterTable,
            ApiKey::IsAlterTableDone,
            ApiKey::DeleteTable,
            ApiKey::ListTables,
            ApiKey::TableExists,
            ApiKey::Write,
            ApiKey::ScanOpen,
            ApiKey::ScanNext,
            ApiKey::ScanClose,
        ] {
            assert_eq!(ApiKey::from(i32::from(key)), key);
        }
        assert_eq!(ApiKey::from(999), ApiKey::Unknown(999));
    }
}
