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

use crate::TableId;
use crate::client::ClientContext;
use crate::client::scanner::Scanner;
use crate::client::write_op::{OperationKind, WriteOperation};
use crate::metadata::Schema;
use std::sync::Arc;

/// A reference to a named table plus the schema snapshot fetched when the
/// table was opened. The schema does not change for the lifetime of this
/// handle; a concurrent ALTER surfaces as a failure on a later operation,
/// after which the table must be re-opened.
#[derive(Clone)]
pub struct Table {
    context: Arc<ClientContext>,
    table_id: TableId,
    name: Arc<str>,
    schema: Arc<Schema>,
}

impl Table {
    pub(crate) fn new(
        context: Arc<ClientContext>,
        table_id: TableId,
        name: &str,
        schema: Arc<Schema>,
    ) -> Self {
        Table {
            context,
            table_id,
            name: Arc::from(name),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn schema_arc(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub(crate) fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn new_insert(&self) -> WriteOperation {
        WriteOperation::new(self.clone(), OperationKind::Insert)
    }

    pub fn new_update(&self) -> WriteOperation {
        WriteOperation::new(self.clone(), OperationKind::Update)
    }

    pub fn new_delete(&self) -> WriteOperation {
        WriteOperation::new(self.clone(), OperationKind::Delete)
    }

    pub fn new_scanner(&self) -> Scanner {
        Scanner::new(self.clone())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("table_id", &self.table_id)
            .finish_non_exhaustive()
    }
}
