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

//! The client root and the handles hanging off it.

pub mod admin;
mod batcher;
pub(crate) mod broadcast;
mod meta_cache;
mod registry;
mod scanner;
mod session;
mod table;
mod write_op;

pub use admin::{AlterStep, TableAlterer, TableCreator};
pub use scanner::{ColumnRangePredicate, ReadMode, ReplicaSelection, Scanner};
pub use session::{FlushMode, Session, SessionError};
pub use table::Table;
pub use write_op::{OperationKind, WriteOperation};

use crate::config::ClientConfig;
use crate::error::{Error, Result, ServerErrorCode};
use crate::metadata::{Schema, TableInfo};
use crate::proto::{DeleteTableRequest, GetTableSchemaRequest, IsAlterTableDoneRequest, IsCreateTableDoneRequest, ListTablesRequest, TableExistsRequest};
use crate::rpc::{RequestBody, RpcClient};
use crate::util::ExponentialBackoff;
use dashmap::DashMap;
use log::debug;
use meta_cache::MetaCache;
use registry::TabletServerRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by a client and everything created from it. Sessions,
/// tables and scanners hold their own `Arc`, so they stay valid no matter
/// the order handles are released in.
#[derive(Debug)]
pub(crate) struct ClientContext {
    pub(crate) config: ClientConfig,
    pub(crate) rpc: Arc<RpcClient>,
    pub(crate) meta_cache: Arc<MetaCache>,
    pub(crate) registry: Arc<TabletServerRegistry>,
    /// Schema snapshots by table name, filled by `open_table`.
    tables: DashMap<String, Arc<TableInfo>>,
}

impl ClientContext {
    pub(crate) fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.config.admin_timeout_ms)
    }

    /// Issues one master RPC, retrying transient failures with exponential
    /// backoff until the admin timeout.
    pub(crate) async fn master_request<R>(&self, request: R) -> Result<R::ResponseBody>
    where
        R: RequestBody + Clone + Send,
        R::ResponseBody: Send,
    {
        let deadline = Instant::now() + self.admin_timeout();
        let mut backoff = ExponentialBackoff::default();
        let mut last_error: Option<Error> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(match last_error {
                    Some(Error::Connection { message } | Error::ServiceUnavailable { message }) => {
                        Error::service_unavailable(message)
                    }
                    _ => Error::timed_out("master request exhausted the admin timeout"),
                });
            }

            let attempt = async {
                let conn = self.rpc.get_connection(&self.config.master_addr).await?;
                conn.request(request.clone(), remaining).await
            }
            .await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(
                    e @ (Error::Connection { .. }
                    | Error::TimedOut { .. }
                    | Error::ServiceUnavailable { .. }),
                ) => {
                    debug!("Master request failed, retrying: {e}");
                    last_error = Some(e);
                }
                Err(other) => return Err(other),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            tokio::time::sleep(backoff.next_delay().min(remaining)).await;
        }
    }
}

/// Builds a [`StrataClient`]. The master address is required; everything
/// else has defaults.
pub struct ClientBuilder {
    config: ClientConfig,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder {
            config: ClientConfig::default(),
        }
    }

    /// RPC address of the catalog master.
    pub fn master_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.master_addr = addr.into();
        self
    }

    /// Timeout for administrative operations. Defaults to 5 seconds.
    pub fn admin_timeout(mut self, timeout: Duration) -> Self {
        self.config.admin_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Full configuration escape hatch.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<StrataClient> {
        StrataClient::new(self.config)
    }
}

/// Shared root handle to one cluster. Cheap to clone; all clones share the
/// location cache, server registry and RPC proxies. No state is shared
/// between different `StrataClient` instances.
#[derive(Clone, Debug)]
pub struct StrataClient {
    context: Arc<ClientContext>,
}

impl StrataClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new(config: ClientConfig) -> Result<StrataClient> {
        config
            .validate()
            .map_err(|message| Error::InvalidArgument { message })?;

        let rpc = Arc::new(
            RpcClient::new()
                .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms)),
        );
        let registry = Arc::new(TabletServerRegistry::new(Arc::clone(&rpc)));
        let meta_cache = Arc::new(MetaCache::new(
            Arc::clone(&rpc),
            config.master_addr.clone(),
            Duration::from_millis(config.admin_timeout_ms),
            Arc::clone(&registry),
        ));

        Ok(StrataClient {
            context: Arc::new(ClientContext {
                config,
                rpc,
                meta_cache,
                registry,
                tables: DashMap::new(),
            }),
        })
    }

    pub fn master_addr(&self) -> &str {
        &self.context.config.master_addr
    }

    pub fn default_admin_timeout(&self) -> Duration {
        self.context.admin_timeout()
    }

    /// Opens a table, fetching and caching its schema on first use.
    pub async fn open_table(&self, name: &str) -> Result<Table> {
        if let Some(info) = self.context.tables.get(name) {
            let info = Arc::clone(&info);
            return Ok(Table::new(
                Arc::clone(&self.context),
                info.table_id,
                name,
                Arc::new(info.schema.clone()),
            ));
        }

        let info = Arc::new(self.fetch_table_info(name).await?);
        self.context.tables.insert(name.to_string(), Arc::clone(&info));
        Ok(Table::new(
            Arc::clone(&self.context),
            info.table_id,
            name,
            Arc::new(info.schema.clone()),
        ))
    }

    async fn fetch_table_info(&self, name: &str) -> Result<TableInfo> {
        let response = self
            .context
            .master_request(GetTableSchemaRequest {
                table_name: name.to_string(),
            })
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        Ok(TableInfo {
            table_id: response.table_id,
            name: name.to_string(),
            schema: Schema::from_json(&response.schema_json)?,
        })
    }

    /// Fetches the current schema of a table straight from the master,
    /// bypassing the open-table cache.
    pub async fn get_table_schema(&self, name: &str) -> Result<Schema> {
        Ok(self.fetch_table_info(name).await?.schema)
    }

    pub async fn delete_table(&self, name: &str) -> Result<()> {
        let response = self
            .context
            .master_request(DeleteTableRequest {
                table_name: name.to_string(),
            })
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        if let Some((_, info)) = self.context.tables.remove(name) {
            self.context.meta_cache.invalidate_table(info.table_id);
        }
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .context
            .master_request(TableExistsRequest {
                table_name: name.to_string(),
            })
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        Ok(response.exists)
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let response = self.context.master_request(ListTablesRequest {}).await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        Ok(response.table_names)
    }

    pub async fn is_create_table_in_progress(&self, name: &str) -> Result<bool> {
        let response = self
            .context
            .master_request(IsCreateTableDoneRequest {
                table_name: name.to_string(),
            })
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        Ok(!response.done)
    }

    pub async fn is_alter_table_in_progress(&self, name: &str) -> Result<bool> {
        let response = self
            .context
            .master_request(IsAlterTableDoneRequest {
                table_name: name.to_string(),
            })
            .await?;
        if let Some(error) = response.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }
        Ok(!response.done)
    }

    pub fn new_table_creator(&self) -> TableCreator {
        TableCreator::new(Arc::clone(&self.context))
    }

    pub fn new_table_alterer(&self, name: &str) -> TableAlterer {
        TableAlterer::new(Arc::clone(&self.context), name)
    }

    /// Creates a session. Fully local: no RPCs, no blocking.
    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_master_addr() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn builder_defaults() {
        let client = ClientBuilder::new()
            .master_addr("127.0.0.1:7051")
            .build()
            .unwrap();
        assert_eq!(client.master_addr(), "127.0.0.1:7051");
        assert_eq!(client.default_admin_timeout(), Duration::from_secs(5));
    }
}
