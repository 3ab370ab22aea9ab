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

//! Binary blocks of row operations and row results.
//!
//! An op block carries the write operations of one tablet inside a Write RPC:
//! - Magic => u8 (currently 1)
//! - NumOps => u32
//! - Crc32 => u32, crc32c over the Ops section
//! - Ops => repeated: Kind u8, KeyLength u32, Key, RowLength u32, Row
//!
//! A row block carries scan results:
//! - rows => repeated: RowLength u32, Row

use crate::error::{Error, Result};
use crate::metadata::Schema;
use crate::row::{Datum, decode_row};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

const OP_BLOCK_MAGIC: u8 = 1;
const OP_BLOCK_HEADER_LEN: usize = 1 + 4 + 4;

/// Builds the op block for one tablet of one Write RPC.
pub struct OpBlockBuilder {
    ops: BytesMut,
    num_ops: u32,
}

impl Default for OpBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpBlockBuilder {
    pub fn new() -> Self {
        OpBlockBuilder {
            ops: BytesMut::new(),
            num_ops: 0,
        }
    }

    pub fn append(&mut self, kind: u8, key: &[u8], row: &[u8]) {
        self.ops.put_u8(kind);
        self.ops.put_u32_le(key.len() as u32);
        self.ops.put_slice(key);
        self.ops.put_u32_le(row.len() as u32);
        self.ops.put_slice(row);
        self.num_ops += 1;
    }

    pub fn num_ops(&self) -> u32 {
        self.num_ops
    }

    pub fn size_in_bytes(&self) -> usize {
        OP_BLOCK_HEADER_LEN + self.ops.len()
    }

    pub fn build(self) -> Bytes {
        let crc = crc32c::crc32c(&self.ops);
        let mut buf = BytesMut::with_capacity(OP_BLOCK_HEADER_LEN + self.ops.len());
        buf.put_u8(OP_BLOCK_MAGIC);
        buf.put_u32_le(self.num_ops);
        buf.put_u32_le(crc);
        buf.put_slice(&self.ops);
        buf.freeze()
    }
}

/// Decodes an op block, verifying the checksum. Returns
/// `(kind, key, row)` tuples in append order.
pub fn decode_op_block(mut data: Bytes) -> Result<Vec<(u8, Bytes, Bytes)>> {
    if data.len() < OP_BLOCK_HEADER_LEN {
        return Err(Error::unexpected("op block shorter than its header"));
    }
    let magic = data.get_u8();
    if magic != OP_BLOCK_MAGIC {
        return Err(Error::unexpected(format!("bad op block magic {magic}")));
    }
    let num_ops = data.get_u32_le();
    let crc = data.get_u32_le();
    if crc32c::crc32c(&data) != crc {
        return Err(Error::unexpected("op block checksum mismatch"));
    }

    let mut ops = Vec::with_capacity(num_ops as usize);
    for _ in 0..num_ops {
        if data.remaining() < 5 {
            return Err(Error::unexpected("truncated op block"));
        }
        let kind = data.get_u8();
        let key_len = data.get_u32_le() as usize;
        if data.remaining() < key_len + 4 {
            return Err(Error::unexpected("truncated op block"));
        }
        let key = data.copy_to_bytes(key_len);
        let row_len = data.get_u32_le() as usize;
        if data.remaining() < row_len {
            return Err(Error::unexpected("truncated op block"));
        }
        let row = data.copy_to_bytes(row_len);
        ops.push((kind, key, row));
    }
    Ok(ops)
}

/// One decoded row of a scan result.
#[derive(Debug, Clone)]
pub struct Row {
    schema: Arc<Schema>,
    cells: Vec<Option<Datum>>,
}

impl Row {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get(&self, index: usize) -> Option<&Datum> {
        self.cells.get(index).and_then(|c| c.as_ref())
    }

    pub fn get_i32(&self, index: usize) -> Result<i32> {
        match self.get(index) {
            Some(Datum::Int32(v)) => Ok(*v),
            other => Err(Error::invalid_argument(format!(
                "column {index} is not a set Int32 (got {other:?})"
            ))),
        }
    }

    pub fn get_i64(&self, index: usize) -> Result<i64> {
        match self.get(index) {
            Some(Datum::Int64(v)) => Ok(*v),
            other => Err(Error::invalid_argument(format!(
                "column {index} is not a set Int64 (got {other:?})"
            ))),
        }
    }

    pub fn get_string(&self, index: usize) -> Result<&str> {
        match self.get(index) {
            Some(Datum::String(v)) => Ok(v),
            other => Err(Error::invalid_argument(format!(
                "column {index} is not a set String (got {other:?})"
            ))),
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.cells.get(index), Some(None))
    }
}

/// Encodes and decodes the row payload of scan responses.
pub struct RowBlock;

impl RowBlock {
    pub fn encode(rows: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();
        for row in rows {
            buf.put_u32_le(row.len() as u32);
            buf.put_slice(row);
        }
        buf.freeze()
    }

    pub fn decode(schema: &Arc<Schema>, num_rows: u32, mut data: Bytes) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(num_rows as usize);
        for _ in 0..num_rows {
            if data.remaining() < 4 {
                return Err(Error::unexpected("truncated row block"));
            }
            let len = data.get_u32_le() as usize;
            if data.remaining() < len {
                return Err(Error::unexpected("truncated row block"));
            }
            let payload = data.copy_to_bytes(len);
            let cells = decode_row(schema, &payload)?;
            rows.push(Row {
                schema: Arc::clone(schema),
                cells,
            });
        }
        if data.has_remaining() {
            return Err(Error::unexpected("trailing bytes after row block"));
        }
        Ok(rows)
    }
}
