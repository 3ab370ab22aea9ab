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

//! Administrative DDL: create and alter tables, with completion polling
//! against the master.

use crate::client::ClientContext;
use crate::error::{Error, Result};
use crate::metadata::{ColumnType, Schema};
use crate::proto::{AlterTableRequest, CreateTableRequest, IsAlterTableDoneRequest, IsCreateTableDoneRequest};
use crate::row::PartialRow;
use crate::util::ExponentialBackoff;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// One step of a table alteration, applied in order by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AlterStep {
    AddColumn {
        name: String,
        column_type: ColumnType,
        nullable: bool,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        from: String,
        to: String,
    },
}

/// Creates a new table. Obtained from
/// [`crate::client::StrataClient::new_table_creator`].
pub struct TableCreator {
    context: Arc<ClientContext>,
    name: Option<String>,
    schema: Option<Schema>,
    num_replicas: i32,
    split_rows: Vec<PartialRow>,
    wait_for_completion: bool,
}

impl TableCreator {
    pub(crate) fn new(context: Arc<ClientContext>) -> Self {
        TableCreator {
            context,
            name: None,
            schema: None,
            num_replicas: 0,
            split_rows: Vec::new(),
            wait_for_completion: true,
        }
    }

    /// Name of the table to create. Required.
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Schema of the table. Required.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Replication factor per tablet; zero or negative falls back to the
    /// server-side default.
    pub fn num_replicas(mut self, num_replicas: i32) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    /// Adds a pre-split point. The row must have the key columns set; `n`
    /// split rows produce `n + 1` tablets.
    pub fn split_row(mut self, row: PartialRow) -> Self {
        self.split_rows.push(row);
        self
    }

    /// Whether to wait until every tablet is assigned before returning.
    /// Defaults to true.
    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    /// Submits the create and, unless disabled, polls until the master
    /// reports completion or the admin timeout elapses.
    pub async fn create(self) -> Result<()> {
        let name = self
            .name
            .ok_or_else(|| Error::invalid_argument("table creator requires a table name"))?;
        let schema = self
            .schema
            .ok_or_else(|| Error::invalid_argument("table creator requires a schema"))?;

        let mut split_keys: Vec<Bytes> = Vec::with_capacity(self.split_rows.len());
        for row in &self.split_rows {
            split_keys.push(row.encode_key()?);
        }

        let request = CreateTableRequest {
            table_name: name.clone(),
            schema_json: Bytes::from(schema.to_json()?),
            num_replicas: self.num_replicas,
            split_keys,
        };
        self.context.master_request(request).await?;

        if self.wait_for_completion {
            poll_until_done(&self.context, || IsCreateTableDoneRequest {
                table_name: name.clone(),
            })
            .await?;
        }
        Ok(())
    }
}

/// Alters an existing table. Obtained from
/// [`crate::client::StrataClient::new_table_alterer`].
pub struct TableAlterer {
    context: Arc<ClientContext>,
    name: String,
    new_name: Option<String>,
    steps: Vec<AlterStep>,
    wait_for_completion: bool,
}

impl TableAlterer {
    pub(crate) fn new(context: Arc<ClientContext>, name: &str) -> Self {
        TableAlterer {
            context,
            name: name.to_string(),
            new_name: None,
            steps: Vec::new(),
            wait_for_completion: true,
        }
    }

    pub fn rename_table(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }

    pub fn add_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.steps.push(AlterStep::AddColumn {
            name: name.into(),
            column_type,
            nullable: false,
        });
        self
    }

    pub fn add_nullable_column(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
    ) -> Self {
        self.steps.push(AlterStep::AddColumn {
            name: name.into(),
            column_type,
            nullable: true,
        });
        self
    }

    pub fn drop_column(mut self, name: impl Into<String>) -> Self {
        self.steps.push(AlterStep::DropColumn { name: name.into() });
        self
    }

    pub fn rename_column(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.steps.push(AlterStep::RenameColumn {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Whether to poll the alteration to completion. Defaults to true.
    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    pub async fn alter(self) -> Result<()> {
        if self.steps.is_empty() && self.new_name.is_none() {
            return Err(Error::invalid_argument(
                "table alterer requires at least one alteration step",
            ));
        }
        let steps_json = serde_json::to_vec(&self.steps).map_err(|e| Error::JsonSerde {
            message: format!("failed to serialize alter steps: {e}"),
        })?;
        let request = AlterTableRequest {
            table_name: self.name.clone(),
            new_table_name: self.new_name.clone(),
            steps_json: Bytes::from(steps_json),
        };
        self.context.master_request(request).await?;

        if self.wait_for_completion {
            let name = self.new_name.unwrap_or(self.name);
            poll_until_done(&self.context, move || IsAlterTableDoneRequest {
                table_name: name.clone(),
            })
            .await?;
        }
        Ok(())
    }
}

trait DoneResponse {
    fn done(&self) -> bool;
}

impl DoneResponse for crate::proto::IsCreateTableDoneResponse {
    fn done(&self) -> bool {
        self.done
    }
}

impl DoneResponse for crate::proto::IsAlterTableDoneResponse {
    fn done(&self) -> bool {
        self.done
    }
}

/// Polls an Is*Done request with exponential backoff until it reports done
/// or the admin timeout elapses.
async fn poll_until_done<R, F>(context: &Arc<ClientContext>, make_request: F) -> Result<()>
where
    R: crate::rpc::RequestBody + Clone + Send,
    R::ResponseBody: DoneResponse + Send,
    F: Fn() -> R,
{
    let deadline = Instant::now() + context.admin_timeout();
    let mut backoff = ExponentialBackoff::new(10.0, 1000.0);
    loop {
        let response = context.master_request(make_request()).await?;
        if response.done() {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::timed_out(
                "administrative operation did not complete within the admin timeout",
            ));
        }
        tokio::time::sleep(backoff.next_delay().min(remaining)).await;
    }
}
