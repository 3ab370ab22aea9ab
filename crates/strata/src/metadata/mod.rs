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

//! Table metadata: schemas, table descriptors, tablet placement records.

use crate::error::{Error, Result};
use crate::{ServerId, TabletId};
use bytes::Bytes;
use parse_display::Display;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Column value types supported by the store.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Binary,
}

impl ColumnType {
    /// Size of the encoded value for fixed-width types, None for var-width.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Bool | ColumnType::Int8 => Some(1),
            ColumnType::Int16 => Some(2),
            ColumnType::Int32 | ColumnType::Float32 => Some(4),
            ColumnType::Int64 | ColumnType::Float64 => Some(8),
            ColumnType::String | ColumnType::Binary => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub is_key: bool,
}

/// An immutable table schema snapshot. Key columns come first, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn column(&self, index: usize) -> Result<&ColumnSchema> {
        self.columns.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "column index {index} out of range (schema has {} columns)",
                self.columns.len()
            ))
        })
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::invalid_argument(format!("unknown column '{name}'")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::JsonSerde {
            message: format!("failed to serialize schema: {e}"),
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Schema> {
        serde_json::from_slice(bytes).map_err(|e| Error::JsonSerde {
            message: format!("failed to deserialize schema: {e}"),
        })
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    key_columns: Vec<ColumnSchema>,
    value_columns: Vec<ColumnSchema>,
}

impl SchemaBuilder {
    /// Adds a primary-key column. Key columns are implicitly non-nullable and
    /// ordered before all value columns.
    pub fn key_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.key_columns.push(ColumnSchema {
            name: name.into(),
            column_type,
            nullable: false,
            is_key: true,
        });
        self
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.value_columns.push(ColumnSchema {
            name: name.into(),
            column_type,
            nullable: false,
            is_key: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.value_columns.push(ColumnSchema {
            name: name.into(),
            column_type,
            nullable: true,
            is_key: false,
        });
        self
    }

    pub fn build(self) -> Result<Schema> {
        if self.key_columns.is_empty() {
            return Err(Error::invalid_argument(
                "a schema requires at least one key column",
            ));
        }
        let num_key_columns = self.key_columns.len();
        let mut columns = self.key_columns;
        columns.extend(self.value_columns);

        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }

        Ok(Schema {
            columns,
            num_key_columns,
        })
    }
}

/// A named table plus its schema as fetched at open time.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table_id: crate::TableId,
    pub name: String,
    pub schema: Schema,
}

/// Role of a replica within its tablet's configuration.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Learner,
}

impl ReplicaRole {
    pub fn code(&self) -> i32 {
        match self {
            ReplicaRole::Leader => 0,
            ReplicaRole::Follower => 1,
            ReplicaRole::Learner => 2,
        }
    }

    pub fn for_code(code: i32) -> ReplicaRole {
        match code {
            0 => ReplicaRole::Leader,
            2 => ReplicaRole::Learner,
            _ => ReplicaRole::Follower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub server_id: ServerId,
    pub role: ReplicaRole,
}

/// A cached placement record for one tablet: the closed-open key range it
/// owns and the replicas hosting it.
#[derive(Debug, Clone)]
pub struct TabletLocation {
    pub tablet_id: TabletId,
    /// Inclusive.
    pub start_key: Bytes,
    /// Exclusive; empty means unbounded.
    pub end_key: Bytes,
    pub replicas: Vec<Replica>,
    /// Strictly increases each time the record is refreshed from the master.
    pub epoch: u64,
    pub populated_at: Instant,
}

impl TabletLocation {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_ref() && (self.end_key.is_empty() || key < self.end_key.as_ref())
    }

    pub fn leader(&self) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.role == ReplicaRole::Leader)
    }

    pub fn leader_index(&self) -> Option<usize> {
        self.replicas.iter().position(|r| r.role == ReplicaRole::Leader)
    }

    /// True once the end of the table's key space is reached.
    pub fn is_last(&self) -> bool {
        self.end_key.is_empty()
    }
}
