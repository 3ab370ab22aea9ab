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

//! In-process mock cluster: a master and N tablet servers speaking the real
//! framed protocol over loopback TCP, with fault injection for leader
//! moves, partitions and slow lookups.

use crate::client::admin::AlterStep;
use crate::client::{ClientBuilder, StrataClient};
use crate::error::ServerErrorCode;
use crate::metadata::{ColumnSchema, ColumnType, Schema};
use crate::proto;
use crate::proto::{PbError, RequestHeader, ResponseHeader};
use crate::row::{RowBlock, decode_op_block, decode_row, encode_sortable_datum};
use crate::rpc::ApiKey;
use crate::rpc::frame::{read_frame, write_frame};
use crate::{ServerId, TableId, TabletId};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Order-preserving single-column Int32 key, as produced by
/// `PartialRow::encode_key` for an int key column.
pub(crate) fn encoded_i32(value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32((value as u32) ^ (1 << 31));
    buf.freeze()
}

struct MockTable {
    table_id: TableId,
    schema: Schema,
    tablet_ids: Vec<TabletId>,
}

struct MockTablet {
    table_id: TableId,
    start_key: Bytes,
    end_key: Bytes,
    epoch: u64,
    leader: ServerId,
    replicas: Vec<ServerId>,
    rows: BTreeMap<Bytes, Bytes>,
}

struct MockScanner {
    payloads: Vec<Bytes>,
    index: usize,
}

struct ClusterState {
    next_table_id: TableId,
    next_tablet_id: TabletId,
    next_scanner_id: u64,
    server_ids: Vec<ServerId>,
    server_addrs: HashMap<ServerId, String>,
    tables: HashMap<String, MockTable>,
    table_names_by_id: HashMap<TableId, String>,
    tablets: BTreeMap<TabletId, MockTablet>,
    scanners: HashMap<u64, MockScanner>,
    partitioned: HashSet<ServerId>,
    ddl_polls: u32,
    pending_polls: HashMap<String, u32>,
    location_lookups: usize,
    location_delay: Option<Duration>,
    write_counts: HashMap<ServerId, usize>,
}

impl ClusterState {
    fn tablet_containing(&self, table_id: TableId, key: &[u8]) -> Option<&MockTablet> {
        self.tablets
            .values()
            .find(|t| t.table_id == table_id && in_range(key, &t.start_key, &t.end_key))
    }

    fn sorted_tablets_of(&self, table_id: TableId) -> Vec<(TabletId, &MockTablet)> {
        let mut tablets: Vec<(TabletId, &MockTablet)> = self
            .tablets
            .iter()
            .filter(|(_, t)| t.table_id == table_id)
            .map(|(id, t)| (*id, t))
            .collect();
        tablets.sort_by(|a, b| a.1.start_key.cmp(&b.1.start_key));
        tablets
    }

    fn create_table(&mut self, name: &str, schema: Schema, split_keys: &[Bytes]) -> TableId {
        let table_id = self.next_table_id;
        self.next_table_id += 1;

        let mut bounds: Vec<Bytes> = vec![Bytes::new()];
        let mut sorted: Vec<Bytes> = split_keys.to_vec();
        sorted.sort();
        bounds.extend(sorted);
        bounds.push(Bytes::new());

        let mut tablet_ids = Vec::new();
        for (index, window) in bounds.windows(2).enumerate() {
            let tablet_id = self.next_tablet_id;
            self.next_tablet_id += 1;
            let leader = self.server_ids[index % self.server_ids.len()];
            self.tablets.insert(
                tablet_id,
                MockTablet {
                    table_id,
                    start_key: window[0].clone(),
                    end_key: window[1].clone(),
                    epoch: 1,
                    leader,
                    replicas: self.server_ids.clone(),
                    rows: BTreeMap::new(),
                },
            );
            tablet_ids.push(tablet_id);
        }

        self.tables.insert(
            name.to_string(),
            MockTable {
                table_id,
                schema,
                tablet_ids,
            },
        );
        self.table_names_by_id.insert(table_id, name.to_string());
        if self.ddl_polls > 0 {
            self.pending_polls.insert(name.to_string(), self.ddl_polls);
        }
        table_id
    }
}

fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    key >= start && (end.is_empty() || key < end)
}

fn pb_error(code: ServerErrorCode, message: &str) -> PbError {
    PbError {
        code: code.code(),
        message: message.to_string(),
    }
}

pub(crate) struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    master_addr: String,
    handles: Vec<JoinHandle<()>>,
}

impl MockCluster {
    pub(crate) async fn start(num_tablet_servers: usize) -> MockCluster {
        assert!(num_tablet_servers > 0);
        let server_ids: Vec<ServerId> = (1..=num_tablet_servers as ServerId).collect();

        let state = Arc::new(Mutex::new(ClusterState {
            next_table_id: 1,
            next_tablet_id: 1,
            next_scanner_id: 1,
            server_ids: server_ids.clone(),
            server_addrs: HashMap::new(),
            tables: HashMap::new(),
            table_names_by_id: HashMap::new(),
            tablets: BTreeMap::new(),
            scanners: HashMap::new(),
            partitioned: HashSet::new(),
            ddl_polls: 0,
            pending_polls: HashMap::new(),
            location_lookups: 0,
            location_delay: None,
            write_counts: HashMap::new(),
        }));

        let mut handles = Vec::new();
        let (master_addr, handle) = spawn_node(Arc::clone(&state), None).await;
        handles.push(handle);

        for server_id in server_ids {
            let (addr, handle) = spawn_node(Arc::clone(&state), Some(server_id)).await;
            state.lock().server_addrs.insert(server_id, addr);
            handles.push(handle);
        }

        MockCluster {
            state,
            master_addr,
            handles,
        }
    }

    pub(crate) fn master_addr(&self) -> String {
        self.master_addr.clone()
    }

    pub(crate) async fn client(&self) -> StrataClient {
        ClientBuilder::new()
            .master_addr(self.master_addr())
            .admin_timeout(Duration::from_secs(3))
            .build()
            .unwrap()
    }

    /// Creates a table with schema (key Int32, val String) directly in the
    /// mock catalog, split at the given key values.
    pub(crate) async fn create_int_table(&self, name: &str, splits: &[i32]) -> TableId {
        let schema = Schema::builder()
            .key_column("key", ColumnType::Int32)
            .column("val", ColumnType::String)
            .build()
            .unwrap();
        let split_keys: Vec<Bytes> = splits.iter().map(|v| encoded_i32(*v)).collect();
        self.state.lock().create_table(name, schema, &split_keys)
    }

    pub(crate) fn server_ids(&self) -> Vec<ServerId> {
        self.state.lock().server_ids.clone()
    }

    pub(crate) fn table_id(&self, name: &str) -> TableId {
        self.state.lock().tables[name].table_id
    }

    pub(crate) fn tablet_ids(&self, table_id: TableId) -> Vec<TabletId> {
        let state = self.state.lock();
        let name = state.table_names_by_id[&table_id].clone();
        state.tables[&name].tablet_ids.clone()
    }

    pub(crate) fn leader_of(&self, tablet_id: TabletId) -> ServerId {
        self.state.lock().tablets[&tablet_id].leader
    }

    /// Moves leadership of one tablet, bumping its epoch. The old leader
    /// starts answering writes with NotLeader.
    pub(crate) fn set_leader(&self, tablet_id: TabletId, server_id: ServerId) {
        let mut state = self.state.lock();
        let tablet = state.tablets.get_mut(&tablet_id).unwrap();
        tablet.leader = server_id;
        tablet.epoch += 1;
    }

    /// The named server receives write RPCs but never answers them.
    pub(crate) fn partition_server(&self, server_id: ServerId) {
        self.state.lock().partitioned.insert(server_id);
    }

    /// Number of pending Is*Done polls before DDL operations report done.
    pub(crate) fn set_ddl_polls(&self, polls: u32) {
        self.state.lock().ddl_polls = polls;
    }

    pub(crate) fn location_lookup_count(&self) -> usize {
        self.state.lock().location_lookups
    }

    pub(crate) fn set_location_delay(&self, delay: Duration) {
        self.state.lock().location_delay = Some(delay);
    }

    pub(crate) fn write_request_count(&self, server_id: ServerId) -> usize {
        self.state
            .lock()
            .write_counts
            .get(&server_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn has_row(&self, table_id: TableId, key: i32) -> bool {
        let encoded = encoded_i32(key);
        let state = self.state.lock();
        state
            .tablet_containing(table_id, &encoded)
            .is_some_and(|tablet| tablet.rows.contains_key(&encoded))
    }

    pub(crate) fn row_count(&self, table_id: TableId) -> usize {
        let state = self.state.lock();
        state
            .tablets
            .values()
            .filter(|t| t.table_id == table_id)
            .map(|t| t.rows.len())
            .sum()
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn spawn_node(
    state: Arc<Mutex<ClusterState>>,
    server_id: Option<ServerId>,
) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                loop {
                    let Ok(payload) = read_frame(&mut reader, usize::MAX).await else {
                        return;
                    };
                    let mut buf = payload.as_slice();
                    let Ok(header) = RequestHeader::decode_length_delimited(&mut buf) else {
                        return;
                    };
                    let api_key = ApiKey::from(header.api_key);
                    let Some((error, body)) =
                        dispatch(&state, server_id, api_key, buf.to_vec()).await
                    else {
                        // injected partition: swallow the request
                        continue;
                    };
                    let response_header = ResponseHeader {
                        correlation_id: header.correlation_id,
                        error,
                    };
                    let mut out = Vec::new();
                    response_header
                        .encode_length_delimited(&mut out)
                        .expect("encode response header");
                    out.extend_from_slice(&body);
                    if write_frame(&mut writer, &out).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, handle)
}

async fn dispatch(
    state: &Arc<Mutex<ClusterState>>,
    server_id: Option<ServerId>,
    api_key: ApiKey,
    body: Vec<u8>,
) -> Option<(Option<PbError>, Vec<u8>)> {
    match server_id {
        None => dispatch_master(state, api_key, body).await,
        Some(server_id) => dispatch_tablet_server(state, server_id, api_key, body),
    }
}

async fn dispatch_master(
    state: &Arc<Mutex<ClusterState>>,
    api_key: ApiKey,
    body: Vec<u8>,
) -> Option<(Option<PbError>, Vec<u8>)> {
    match api_key {
        ApiKey::GetTableSchema => {
            let request = proto::GetTableSchemaRequest::decode(body.as_slice()).unwrap();
            let state = state.lock();
            let response = match state.tables.get(&request.table_name) {
                Some(table) => proto::GetTableSchemaResponse {
                    error: None,
                    table_id: table.table_id,
                    schema_json: Bytes::from(table.schema.to_json().unwrap()),
                },
                None => proto::GetTableSchemaResponse {
                    error: Some(pb_error(
                        ServerErrorCode::NotFound,
                        &format!("table '{}' does not exist", request.table_name),
                    )),
                    ..Default::default()
                },
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::GetTableLocations => {
            let request = proto::GetTableLocationsRequest::decode(body.as_slice()).unwrap();
            let delay = state.lock().location_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = state.lock();
            state.location_lookups += 1;

            if !state.table_names_by_id.contains_key(&request.table_id) {
                let response = proto::GetTableLocationsResponse {
                    error: Some(pb_error(
                        ServerErrorCode::NotFound,
                        &format!("table {} does not exist", request.table_id),
                    )),
                    tablets: vec![],
                };
                return Some((None, response.encode_to_vec()));
            }

            let tablets = state.sorted_tablets_of(request.table_id);
            let start_index = tablets
                .iter()
                .position(|(_, t)| in_range(&request.start_key, &t.start_key, &t.end_key))
                .unwrap_or(0);

            let mut out = Vec::new();
            for (tablet_id, tablet) in tablets
                .into_iter()
                .skip(start_index)
                .take(request.max_tablets as usize)
            {
                out.push(proto::PbTabletLocation {
                    tablet_id,
                    start_key: tablet.start_key.clone(),
                    end_key: tablet.end_key.clone(),
                    replicas: tablet
                        .replicas
                        .iter()
                        .map(|sid| proto::PbReplica {
                            server_id: *sid,
                            host: "127.0.0.1".to_string(),
                            port: state.server_addrs[sid]
                                .rsplit(':')
                                .next()
                                .unwrap()
                                .parse()
                                .unwrap(),
                            role: if *sid == tablet.leader { 0 } else { 1 },
                        })
                        .collect(),
                    epoch: tablet.epoch,
                });
            }
            let response = proto::GetTableLocationsResponse {
                error: None,
                tablets: out,
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::CreateTable => {
            let request = proto::CreateTableRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            if state.tables.contains_key(&request.table_name) {
                let response = proto::CreateTableResponse {
                    error: Some(pb_error(
                        ServerErrorCode::AlreadyPresent,
                        &format!("table '{}' already exists", request.table_name),
                    )),
                    ..Default::default()
                };
                return Some((None, response.encode_to_vec()));
            }
            let schema = Schema::from_json(&request.schema_json).unwrap();
            let table_id = state.create_table(&request.table_name, schema, &request.split_keys);
            let response = proto::CreateTableResponse {
                error: None,
                table_id,
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::IsCreateTableDone | ApiKey::IsAlterTableDone => {
            let table_name = match api_key {
                ApiKey::IsCreateTableDone => {
                    proto::IsCreateTableDoneRequest::decode(body.as_slice())
                        .unwrap()
                        .table_name
                }
                _ => proto::IsAlterTableDoneRequest::decode(body.as_slice())
                    .unwrap()
                    .table_name,
            };
            let mut state = state.lock();
            let done = match state.pending_polls.get_mut(&table_name) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    false
                }
                _ => {
                    state.pending_polls.remove(&table_name);
                    true
                }
            };
            let body = match api_key {
                ApiKey::IsCreateTableDone => {
                    proto::IsCreateTableDoneResponse { error: None, done }.encode_to_vec()
                }
                _ => proto::IsAlterTableDoneResponse { error: None, done }.encode_to_vec(),
            };
            Some((None, body))
        }
        ApiKey::AlterTable => {
            let request = proto::AlterTableRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            if !state.tables.contains_key(&request.table_name) {
                let response = proto::AlterTableResponse {
                    error: Some(pb_error(ServerErrorCode::NotFound, "no such table")),
                };
                return Some((None, response.encode_to_vec()));
            }
            let steps: Vec<AlterStep> = serde_json::from_slice(&request.steps_json).unwrap();
            let ddl_polls = state.ddl_polls;
            let table = state.tables.get_mut(&request.table_name).unwrap();
            let mut columns: Vec<ColumnSchema> = table.schema.columns().to_vec();
            for step in steps {
                match step {
                    AlterStep::AddColumn {
                        name,
                        column_type,
                        nullable,
                    } => columns.push(ColumnSchema {
                        name,
                        column_type,
                        nullable,
                        is_key: false,
                    }),
                    AlterStep::DropColumn { name } => {
                        columns.retain(|c| c.name != name);
                    }
                    AlterStep::RenameColumn { from, to } => {
                        for column in &mut columns {
                            if column.name == from {
                                column.name = to.clone();
                            }
                        }
                    }
                }
            }
            table.schema = rebuild_schema(&columns);
            if let Some(new_name) = request.new_table_name {
                let table = state.tables.remove(&request.table_name).unwrap();
                let table_id = table.table_id;
                state.tables.insert(new_name.clone(), table);
                state.table_names_by_id.insert(table_id, new_name.clone());
                if ddl_polls > 0 {
                    state.pending_polls.insert(new_name, ddl_polls);
                }
            } else if ddl_polls > 0 {
                state
                    .pending_polls
                    .insert(request.table_name.clone(), ddl_polls);
            }
            let response = proto::AlterTableResponse { error: None };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::DeleteTable => {
            let request = proto::DeleteTableRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            let response = match state.tables.remove(&request.table_name) {
                Some(table) => {
                    state.table_names_by_id.remove(&table.table_id);
                    for tablet_id in table.tablet_ids {
                        state.tablets.remove(&tablet_id);
                    }
                    proto::DeleteTableResponse { error: None }
                }
                None => proto::DeleteTableResponse {
                    error: Some(pb_error(ServerErrorCode::NotFound, "no such table")),
                },
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::ListTables => {
            let state = state.lock();
            let mut table_names: Vec<String> = state.tables.keys().cloned().collect();
            table_names.sort();
            let response = proto::ListTablesResponse {
                error: None,
                table_names,
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::TableExists => {
            let request = proto::TableExistsRequest::decode(body.as_slice()).unwrap();
            let state = state.lock();
            let response = proto::TableExistsResponse {
                error: None,
                exists: state.tables.contains_key(&request.table_name),
            };
            Some((None, response.encode_to_vec()))
        }
        other => Some((
            Some(pb_error(
                ServerErrorCode::InvalidArgument,
                &format!("master does not serve {other:?}"),
            )),
            Vec::new(),
        )),
    }
}

fn dispatch_tablet_server(
    state: &Arc<Mutex<ClusterState>>,
    server_id: ServerId,
    api_key: ApiKey,
    body: Vec<u8>,
) -> Option<(Option<PbError>, Vec<u8>)> {
    match api_key {
        ApiKey::Write => {
            let request = proto::WriteRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            *state.write_counts.entry(server_id).or_insert(0) += 1;
            if state.partitioned.contains(&server_id) {
                return None;
            }

            let mut tablet_results = Vec::new();
            for batch in request.tablet_batches {
                let ops = decode_op_block(batch.ops_block.clone()).unwrap();
                let Some(tablet) = state.tablets.get_mut(&batch.tablet_id) else {
                    tablet_results.push(proto::PbTabletWriteResult {
                        tablet_id: batch.tablet_id,
                        error: Some(pb_error(ServerErrorCode::TabletNotFound, "tablet not here")),
                        row_errors: vec![],
                    });
                    continue;
                };
                if tablet.leader != server_id {
                    tablet_results.push(proto::PbTabletWriteResult {
                        tablet_id: batch.tablet_id,
                        error: Some(pb_error(
                            ServerErrorCode::NotLeader,
                            &format!("server {server_id} is not the leader"),
                        )),
                        row_errors: vec![],
                    });
                    continue;
                }

                let mut row_errors = Vec::new();
                for (index, (kind, key, payload)) in ops.into_iter().enumerate() {
                    match kind {
                        0 => {
                            if tablet.rows.contains_key(&key) {
                                row_errors.push(proto::PbRowError {
                                    op_index: index as u32,
                                    code: ServerErrorCode::AlreadyPresent.code(),
                                    message: "key already present".to_string(),
                                });
                            } else {
                                tablet.rows.insert(key, payload);
                            }
                        }
                        1 => {
                            if tablet.rows.contains_key(&key) {
                                tablet.rows.insert(key, payload);
                            } else {
                                row_errors.push(proto::PbRowError {
                                    op_index: index as u32,
                                    code: ServerErrorCode::NotFound.code(),
                                    message: "key not found".to_string(),
                                });
                            }
                        }
                        2 => {
                            if tablet.rows.remove(&key).is_none() {
                                row_errors.push(proto::PbRowError {
                                    op_index: index as u32,
                                    code: ServerErrorCode::NotFound.code(),
                                    message: "key not found".to_string(),
                                });
                            }
                        }
                        other => row_errors.push(proto::PbRowError {
                            op_index: index as u32,
                            code: ServerErrorCode::InvalidArgument.code(),
                            message: format!("unknown op kind {other}"),
                        }),
                    }
                }
                tablet_results.push(proto::PbTabletWriteResult {
                    tablet_id: batch.tablet_id,
                    error: None,
                    row_errors,
                });
            }
            let response = proto::WriteResponse { tablet_results };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::ScanOpen => {
            let request = proto::ScanOpenRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            let Some(tablet) = state.tablets.get(&request.tablet_id) else {
                let response = proto::ScanOpenResponse {
                    error: Some(pb_error(ServerErrorCode::TabletNotFound, "tablet not here")),
                    ..Default::default()
                };
                return Some((None, response.encode_to_vec()));
            };
            let table_name = state.table_names_by_id[&tablet.table_id].clone();
            let schema = state.tables[&table_name].schema.clone();

            let mut payloads = Vec::new();
            'rows: for payload in tablet.rows.values() {
                let cells = decode_row(&schema, payload).unwrap();
                for predicate in &request.predicates {
                    let index = predicate.column_index as usize;
                    let Some(Some(cell)) = cells.get(index) else {
                        continue 'rows;
                    };
                    let encoded = encode_sortable_datum(cell);
                    if let Some(lower) = &predicate.lower {
                        if encoded < *lower {
                            continue 'rows;
                        }
                    }
                    if let Some(upper) = &predicate.upper {
                        if encoded > *upper {
                            continue 'rows;
                        }
                    }
                }
                payloads.push(payload.clone());
            }

            let scanner_id = state.next_scanner_id;
            state.next_scanner_id += 1;
            let mut scanner = MockScanner { payloads, index: 0 };

            let (rows, has_more) = if request.batch_size_bytes == 0 {
                (None, !scanner.payloads.is_empty())
            } else {
                let batch = take_batch(&mut scanner, request.batch_size_bytes);
                let has_more = scanner.index < scanner.payloads.len();
                (Some(batch), has_more)
            };
            state.scanners.insert(scanner_id, scanner);

            let snapshot_ts_micros = if request.read_mode == 1 {
                Some(request.snapshot_ts_micros.unwrap_or_else(now_micros))
            } else {
                None
            };

            let response = proto::ScanOpenResponse {
                error: None,
                scanner_id,
                rows,
                has_more,
                snapshot_ts_micros,
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::ScanNext => {
            let request = proto::ScanNextRequest::decode(body.as_slice()).unwrap();
            let mut state = state.lock();
            let Some(scanner) = state.scanners.get_mut(&request.scanner_id) else {
                let response = proto::ScanNextResponse {
                    error: Some(pb_error(ServerErrorCode::ScannerExpired, "unknown scanner")),
                    ..Default::default()
                };
                return Some((None, response.encode_to_vec()));
            };
            let batch = take_batch(scanner, request.batch_size_bytes.max(1));
            let has_more = scanner.index < scanner.payloads.len();
            let response = proto::ScanNextResponse {
                error: None,
                rows: Some(batch),
                has_more,
            };
            Some((None, response.encode_to_vec()))
        }
        ApiKey::ScanClose => {
            let request = proto::ScanCloseRequest::decode(body.as_slice()).unwrap();
            state.lock().scanners.remove(&request.scanner_id);
            let response = proto::ScanCloseResponse { error: None };
            Some((None, response.encode_to_vec()))
        }
        other => Some((
            Some(pb_error(
                ServerErrorCode::InvalidArgument,
                &format!("tablet server does not serve {other:?}"),
            )),
            Vec::new(),
        )),
    }
}

fn take_batch(scanner: &mut MockScanner, batch_size_bytes: u32) -> proto::PbRowBlock {
    let mut rows = Vec::new();
    let mut bytes = 0usize;
    while scanner.index < scanner.payloads.len() {
        let payload = scanner.payloads[scanner.index].clone();
        bytes += payload.len();
        rows.push(payload);
        scanner.index += 1;
        if bytes >= batch_size_bytes as usize {
            break;
        }
    }
    proto::PbRowBlock {
        num_rows: rows.len() as u32,
        data: RowBlock::encode(&rows),
    }
}

fn rebuild_schema(columns: &[ColumnSchema]) -> Schema {
    let mut builder = Schema::builder();
    for column in columns {
        builder = if column.is_key {
            builder.key_column(column.name.as_str(), column.column_type)
        } else if column.nullable {
            builder.nullable_column(column.name.as_str(), column.column_type)
        } else {
            builder.column(column.name.as_str(), column.column_type)
        };
    }
    builder.build().expect("mock schema rebuild")
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Spawns a bare frame server for transport-level tests: the handler maps
/// `(api_key, body)` to `(header error, response body)`.
pub(crate) async fn spawn_frame_server<F>(handler: F) -> String
where
    F: FnMut(ApiKey, Vec<u8>) -> (Option<PbError>, Vec<u8>) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(Mutex::new(handler));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                loop {
                    let Ok(payload) = read_frame(&mut reader, usize::MAX).await else {
                        return;
                    };
                    let mut buf = payload.as_slice();
                    let Ok(header) = RequestHeader::decode_length_delimited(&mut buf) else {
                        return;
                    };
                    let (error, body) = {
                        let mut guard = handler.lock();
                        (&mut *guard)(ApiKey::from(header.api_key), buf.to_vec())
                    };
                    let response_header = ResponseHeader {
                        correlation_id: header.correlation_id,
                        error,
                    };
                    let mut out = Vec::new();
                    response_header
                        .encode_length_delimited(&mut out)
                        .expect("encode response header");
                    out.extend_from_slice(&body);
                    if write_frame(&mut writer, &out).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}
