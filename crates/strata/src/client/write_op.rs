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

use crate::client::table::Table;
use crate::error::Result;
use crate::row::PartialRow;
use bytes::Bytes;
use parse_display::Display;

/// Kind of a row-level write.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn code(&self) -> u8 {
        match self {
            OperationKind::Insert => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    pub fn for_code(code: u8) -> Option<OperationKind> {
        match code {
            0 => Some(OperationKind::Insert),
            1 => Some(OperationKind::Update),
            2 => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// One row-level write against a table. Created through
/// [`Table::new_insert`], [`Table::new_update`] or [`Table::new_delete`];
/// ownership moves to the session at apply time and comes back through
/// [`crate::client::SessionError::release_failed_op`] on failure.
#[derive(Debug)]
pub struct WriteOperation {
    table: Table,
    kind: OperationKind,
    row: PartialRow,
    /// Assigned by the session when the operation is applied.
    seq: Option<u64>,
}

impl WriteOperation {
    pub(crate) fn new(table: Table, kind: OperationKind) -> Self {
        let row = PartialRow::new(table.schema_arc());
        WriteOperation {
            table,
            kind,
            row,
            seq: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn row(&self) -> &PartialRow {
        &self.row
    }

    pub fn row_mut(&mut self) -> &mut PartialRow {
        &mut self.row
    }

    /// The sequence number assigned on apply, if the op was applied.
    pub fn sequence_number(&self) -> Option<u64> {
        self.seq
    }

    pub(crate) fn assign_seq(&mut self, seq: u64) {
        self.seq = Some(seq);
    }

    /// Validates the row for this op kind and produces the encoded primary
    /// key and row payload. Inserts require all non-nullable columns;
    /// updates and deletes require the key columns.
    pub(crate) fn encode(&self) -> Result<(Bytes, Bytes)> {
        match self.kind {
            OperationKind::Insert => self.row.check_all_required_set()?,
            OperationKind::Update | OperationKind::Delete => self.row.check_key_set()?,
        }
        let key = self.row.encode_key()?;
        let payload = self.row.encode()?;
        Ok((key, payload))
    }

    /// Buffered size charged against the session's mutation buffer.
    pub(crate) fn byte_size(&self) -> usize {
        // Fixed overhead approximates the op kind, key prefix and bookkeeping.
        const PER_OP_OVERHEAD: usize = 16;
        self.row.byte_size_hint() + PER_OP_OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            assert_eq!(OperationKind::for_code(kind.code()), Some(kind));
        }
        assert_eq!(OperationKind::for_code(99), None);
    }
}
