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

//! Row representation and binary encoding.
//!
//! A [`PartialRow`] accumulates typed cell values against a schema. Its wire
//! form is:
//! - PresenceBitmap => ceil(n/8) bytes, bit i set when column i carries a value
//! - NullBitmap => ceil(n/8) bytes, bit i set when column i is explicitly NULL
//! - Cells => present, non-null cells in column order; fixed-width values
//!   little-endian, var-width values as u32 length + bytes
//!
//! Primary keys use a separate order-preserving encoding (big-endian with the
//! sign bit flipped for integers, `0x00 0x00`-terminated with `0x00 0x01`
//! escaping for non-terminal var-width columns) so that byte-wise comparison
//! of encoded keys matches row ordering. Tablet key ranges are expressed in
//! this encoding.

mod row_block;

pub use row_block::{OpBlockBuilder, Row, RowBlock, decode_op_block};

use crate::error::{Error, Result};
use crate::metadata::{ColumnType, Schema};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Binary(Bytes),
}

impl Datum {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Datum::Bool(_) => ColumnType::Bool,
            Datum::Int8(_) => ColumnType::Int8,
            Datum::Int16(_) => ColumnType::Int16,
            Datum::Int32(_) => ColumnType::Int32,
            Datum::Int64(_) => ColumnType::Int64,
            Datum::Float32(_) => ColumnType::Float32,
            Datum::Float64(_) => ColumnType::Float64,
            Datum::String(_) => ColumnType::String,
            Datum::Binary(_) => ColumnType::Binary,
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            Datum::String(s) => 4 + s.len(),
            Datum::Binary(b) => 4 + b.len(),
            other => other
                .column_type()
                .fixed_size()
                .expect("fixed-width datum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Unset,
    Null,
    Value(Datum),
}

/// A partially-filled row bound to a schema.
#[derive(Debug, Clone)]
pub struct PartialRow {
    schema: Arc<Schema>,
    cells: Vec<Cell>,
}

impl PartialRow {
    pub fn new(schema: Arc<Schema>) -> Self {
        let cells = vec![Cell::Unset; schema.num_columns()];
        PartialRow { schema, cells }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn set_bool(&mut self, index: usize, value: bool) -> Result<()> {
        self.set(index, Datum::Bool(value))
    }

    pub fn set_i8(&mut self, index: usize, value: i8) -> Result<()> {
        self.set(index, Datum::Int8(value))
    }

    pub fn set_i16(&mut self, index: usize, value: i16) -> Result<()> {
        self.set(index, Datum::Int16(value))
    }

    pub fn set_i32(&mut self, index: usize, value: i32) -> Result<()> {
        self.set(index, Datum::Int32(value))
    }

    pub fn set_i64(&mut self, index: usize, value: i64) -> Result<()> {
        self.set(index, Datum::Int64(value))
    }

    pub fn set_f32(&mut self, index: usize, value: f32) -> Result<()> {
        self.set(index, Datum::Float32(value))
    }

    pub fn set_f64(&mut self, index: usize, value: f64) -> Result<()> {
        self.set(index, Datum::Float64(value))
    }

    pub fn set_string(&mut self, index: usize, value: impl Into<String>) -> Result<()> {
        self.set(index, Datum::String(value.into()))
    }

    pub fn set_binary(&mut self, index: usize, value: impl Into<Bytes>) -> Result<()> {
        self.set(index, Datum::Binary(value.into()))
    }

    pub fn set_by_name(&mut self, name: &str, datum: Datum) -> Result<()> {
        let index = self.schema.column_index(name)?;
        self.set(index, datum)
    }

    pub fn set(&mut self, index: usize, datum: Datum) -> Result<()> {
        let column = self.schema.column(index)?;
        if column.column_type != datum.column_type() {
            return Err(Error::invalid_argument(format!(
                "column '{}' is {}, got {}",
                column.name,
                column.column_type,
                datum.column_type()
            )));
        }
        self.cells[index] = Cell::Value(datum);
        Ok(())
    }

    pub fn set_null(&mut self, index: usize) -> Result<()> {
        let column = self.schema.column(index)?;
        if !column.nullable {
            return Err(Error::invalid_argument(format!(
                "column '{}' is not nullable",
                column.name
            )));
        }
        self.cells[index] = Cell::Null;
        Ok(())
    }

    pub fn is_set(&self, index: usize) -> bool {
        !matches!(self.cells.get(index), Some(Cell::Unset) | None)
    }

    pub fn get(&self, index: usize) -> Option<&Datum> {
        match self.cells.get(index) {
            Some(Cell::Value(datum)) => Some(datum),
            _ => None,
        }
    }

    fn check_key_columns_set(&self) -> Result<()> {
        for (index, column) in self.schema.key_columns().iter().enumerate() {
            if !matches!(self.cells[index], Cell::Value(_)) {
                return Err(Error::invalid_argument(format!(
                    "key column '{}' is not set",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// Requires every key column and every non-nullable column to be set.
    /// Used for inserts.
    pub fn check_all_required_set(&self) -> Result<()> {
        self.check_key_columns_set()?;
        for (index, column) in self.schema.columns().iter().enumerate() {
            if !column.nullable && matches!(self.cells[index], Cell::Unset) {
                return Err(Error::invalid_argument(format!(
                    "non-nullable column '{}' is not set",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// Requires key columns only. Used for updates and deletes, where the
    /// presence bitmap names the touched columns.
    pub fn check_key_set(&self) -> Result<()> {
        self.check_key_columns_set()
    }

    /// Order-preserving encoding of the primary key columns.
    pub fn encode_key(&self) -> Result<Bytes> {
        self.check_key_columns_set()?;
        let num_keys = self.schema.num_key_columns();
        let mut buf = BytesMut::new();
        for index in 0..num_keys {
            let Cell::Value(datum) = &self.cells[index] else {
                unreachable!("checked above");
            };
            let is_last = index == num_keys - 1;
            encode_key_datum(&mut buf, datum, is_last);
        }
        Ok(buf.freeze())
    }

    /// Encodes the full row payload: presence bitmap, null bitmap, cells.
    pub fn encode(&self) -> Result<Bytes> {
        let n = self.schema.num_columns();
        let bitmap_len = n.div_ceil(8);
        let cell_bytes: usize = self
            .cells
            .iter()
            .map(|c| match c {
                Cell::Value(d) => d.encoded_size(),
                _ => 0,
            })
            .sum();

        let mut buf = BytesMut::with_capacity(2 * bitmap_len + cell_bytes);
        buf.resize(2 * bitmap_len, 0);
        for (index, cell) in self.cells.iter().enumerate() {
            match cell {
                Cell::Unset => {}
                Cell::Null => {
                    buf[index >> 3] |= 1 << (index & 7);
                    buf[bitmap_len + (index >> 3)] |= 1 << (index & 7);
                }
                Cell::Value(_) => {
                    buf[index >> 3] |= 1 << (index & 7);
                }
            }
        }
        for cell in &self.cells {
            if let Cell::Value(datum) = cell {
                encode_datum(&mut buf, datum);
            }
        }
        Ok(buf.freeze())
    }

    /// Approximate buffered size of this row, used for mutation buffer
    /// accounting before the row is encoded.
    pub fn byte_size_hint(&self) -> usize {
        let bitmap_len = self.schema.num_columns().div_ceil(8);
        2 * bitmap_len
            + self
                .cells
                .iter()
                .map(|c| match c {
                    Cell::Value(d) => d.encoded_size(),
                    _ => 0,
                })
                .sum::<usize>()
    }
}

fn encode_datum(buf: &mut BytesMut, datum: &Datum) {
    match datum {
        Datum::Bool(v) => buf.put_u8(*v as u8),
        Datum::Int8(v) => buf.put_i8(*v),
        Datum::Int16(v) => buf.put_i16_le(*v),
        Datum::Int32(v) => buf.put_i32_le(*v),
        Datum::Int64(v) => buf.put_i64_le(*v),
        Datum::Float32(v) => buf.put_f32_le(*v),
        Datum::Float64(v) => buf.put_f64_le(*v),
        Datum::String(v) => {
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        Datum::Binary(v) => {
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
    }
}

/// Decodes one row encoded by [`PartialRow::encode`] into datums, given the
/// schema it was produced against. Columns absent from the presence bitmap
/// decode to None.
pub fn decode_row(schema: &Schema, mut data: &[u8]) -> Result<Vec<Option<Datum>>> {
    let n = schema.num_columns();
    let bitmap_len = n.div_ceil(8);
    if data.len() < 2 * bitmap_len {
        return Err(Error::unexpected("row payload shorter than its bitmaps"));
    }
    let presence = data[..bitmap_len].to_vec();
    let nulls = data[bitmap_len..2 * bitmap_len].to_vec();
    data.advance(2 * bitmap_len);

    let mut cells = Vec::with_capacity(n);
    for index in 0..n {
        let present = presence[index >> 3] & (1 << (index & 7)) != 0;
        let null = nulls[index >> 3] & (1 << (index & 7)) != 0;
        if !present || null {
            cells.push(None);
            continue;
        }
        let column = schema.column(index)?;
        let datum = decode_datum(&mut data, column.column_type)?;
        cells.push(Some(datum));
    }
    Ok(cells)
}

fn decode_datum(data: &mut &[u8], column_type: ColumnType) -> Result<Datum> {
    let need = |data: &&[u8], n: usize| -> Result<()> {
        if data.len() < n {
            Err(Error::unexpected("truncated row payload"))
        } else {
            Ok(())
        }
    };
    Ok(match column_type {
        ColumnType::Bool => {
            need(data, 1)?;
            Datum::Bool(data.get_u8() != 0)
        }
        ColumnType::Int8 => {
            need(data, 1)?;
            Datum::Int8(data.get_i8())
        }
        ColumnType::Int16 => {
            need(data, 2)?;
            Datum::Int16(data.get_i16_le())
        }
        ColumnType::Int32 => {
            need(data, 4)?;
            Datum::Int32(data.get_i32_le())
        }
        ColumnType::Int64 => {
            need(data, 8)?;
            Datum::Int64(data.get_i64_le())
        }
        ColumnType::Float32 => {
            need(data, 4)?;
            Datum::Float32(data.get_f32_le())
        }
        ColumnType::Float64 => {
            need(data, 8)?;
            Datum::Float64(data.get_f64_le())
        }
        ColumnType::String => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            let bytes = data.copy_to_bytes(len);
            Datum::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::unexpected(format!("invalid utf-8 in row: {e}")))?,
            )
        }
        ColumnType::Binary => {
            need(data, 4)?;
            let len = data.get_u32_le() as usize;
            need(data, len)?;
            Datum::Binary(data.copy_to_bytes(len))
        }
    })
}

/// Order-preserving encoding of a single cell value, as used for predicate
/// bounds. Byte-wise comparison of two encoded cells of the same column
/// matches value ordering.
pub fn encode_sortable_datum(datum: &Datum) -> Bytes {
    let mut buf = BytesMut::new();
    encode_key_datum(&mut buf, datum, true);
    buf.freeze()
}

fn encode_key_datum(buf: &mut BytesMut, datum: &Datum, is_last: bool) {
    match datum {
        Datum::Bool(v) => buf.put_u8(*v as u8),
        Datum::Int8(v) => buf.put_u8((*v as u8) ^ 0x80),
        Datum::Int16(v) => buf.put_u16((*v as u16) ^ (1 << 15)),
        Datum::Int32(v) => buf.put_u32((*v as u32) ^ (1 << 31)),
        Datum::Int64(v) => buf.put_u64((*v as u64) ^ (1 << 63)),
        Datum::Float32(v) => buf.put_u32(order_preserving_f32(*v)),
        Datum::Float64(v) => buf.put_u64(order_preserving_f64(*v)),
        Datum::String(v) => encode_key_bytes(buf, v.as_bytes(), is_last),
        Datum::Binary(v) => encode_key_bytes(buf, v, is_last),
    }
}

fn encode_key_bytes(buf: &mut BytesMut, value: &[u8], is_last: bool) {
    if is_last {
        buf.put_slice(value);
        return;
    }
    for &b in value {
        if b == 0 {
            buf.put_slice(&[0x00, 0x01]);
        } else {
            buf.put_u8(b);
        }
    }
    buf.put_slice(&[0x00, 0x00]);
}

fn order_preserving_f32(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & (1 << 31) != 0 { !bits } else { bits ^ (1 << 31) }
}

fn order_preserving_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) != 0 { !bits } else { bits ^ (1 << 63) }
}
