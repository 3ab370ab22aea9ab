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

use crate::error::{Error, ServerErrorCode};
use crate::proto::{RequestHeader, ResponseHeader};
use crate::rpc::api_version::ApiVersion;
use crate::rpc::error::RpcError;
use crate::rpc::frame::{read_frame, write_frame};
use crate::rpc::message::RequestBody;
use crate::rpc::transport::Transport;
use log::warn;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::HashMap;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufStream, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot::{Sender, channel};
use tokio::task::JoinHandle;

pub type ServerConnection = Arc<ServerConnectionInner<BufStream<Transport>>>;

#[derive(Debug)]
struct ActiveRequest {
    channel: Sender<Result<Response, RpcError>>,
}

#[derive(Debug)]
struct Response {
    header: ResponseHeader,
    body: Vec<u8>,
}

#[derive(Debug)]
enum ConnectionState {
    /// In-flight requests by correlation id.
    RequestMap(HashMap<i32, ActiveRequest>),

    /// One of the streams died; no more requests can be processed.
    Poison(Arc<RpcError>),
}

impl ConnectionState {
    fn poison(&mut self, err: RpcError) -> Arc<RpcError> {
        match self {
            ConnectionState::RequestMap(map) => {
                let err = Arc::new(err);
                for (_correlation_id, active_request) in map.drain() {
                    // it's OK if the other side is gone
                    active_request
                        .channel
                        .send(Err(RpcError::Poisoned(Arc::clone(&err))))
                        .ok();
                }
                *self = ConnectionState::Poison(Arc::clone(&err));
                err
            }
            ConnectionState::Poison(e) => Arc::clone(e),
        }
    }
}

/// Removes a registered request from the in-flight map when the request
/// future is dropped before its response arrives.
struct CleanupRequestOnDrop {
    state: Arc<Mutex<ConnectionState>>,
    correlation_id: Option<i32>,
}

impl CleanupRequestOnDrop {
    fn disarm(mut self) {
        self.correlation_id = None;
    }
}

impl Drop for CleanupRequestOnDrop {
    fn drop(&mut self) {
        if let Some(correlation_id) = self.correlation_id {
            if let ConnectionState::RequestMap(map) = self.state.lock().deref_mut() {
                map.remove(&correlation_id);
            }
        }
    }
}

#[derive(Debug)]
pub struct ServerConnectionInner<RW> {
    /// Half of the stream used to send data to the server, serialized across
    /// concurrent callers.
    stream_write: Arc<AsyncMutex<WriteHalf<RW>>>,

    client_id: Arc<str>,

    correlation_id: AtomicI32,

    state: Arc<Mutex<ConnectionState>>,

    join_handle: JoinHandle<()>,
}

impl<RW> ServerConnectionInner<RW>
where
    RW: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: RW, max_message_size: usize, client_id: Arc<str>) -> Self {
        let (stream_read, stream_write) = tokio::io::split(stream);
        let state = Arc::new(Mutex::new(ConnectionState::RequestMap(HashMap::default())));
        let state_captured = Arc::clone(&state);

        let join_handle = tokio::spawn(async move {
            let mut stream_read = stream_read;
            loop {
                match read_frame(&mut stream_read, max_message_size).await {
                    Ok(payload) => {
                        let mut buf = payload.as_slice();
                        let header = match ResponseHeader::decode_length_delimited(&mut buf) {
                            Ok(header) => header,
                            Err(err) => {
                                warn!("Cannot read response header, ignoring message: {err}");
                                continue;
                            }
                        };

                        let active_request = match state_captured.lock().deref_mut() {
                            ConnectionState::RequestMap(map) => {
                                match map.remove(&header.correlation_id) {
                                    Some(active_request) => active_request,
                                    None => {
                                        warn!(
                                            "Got response for unknown correlation id {}",
                                            header.correlation_id
                                        );
                                        continue;
                                    }
                                }
                            }
                            ConnectionState::Poison(_) => return,
                        };

                        // we don't care if the other side is gone
                        active_request
                            .channel
                            .send(Ok(Response {
                                header,
                                body: buf.to_vec(),
                            }))
                            .ok();
                    }
                    Err(e) => {
                        state_captured.lock().poison(e);
                        return;
                    }
                }
            }
        });

        Self {
            stream_write: Arc::new(AsyncMutex::new(stream_write)),
            client_id,
            correlation_id: AtomicI32::new(0),
            state,
            join_handle,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Poison(_))
    }

    /// Sends one request and awaits its response, bounded by `timeout`.
    pub async fn request<R>(&self, msg: R, timeout: Duration) -> Result<R::ResponseBody, Error>
    where
        R: RequestBody + Send,
    {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) & 0x7FFFFFFF;
        let header = RequestHeader {
            api_key: R::API_KEY.into(),
            api_version: R::API_VERSION.0,
            correlation_id,
            client_id: String::from(self.client_id.as_ref()),
        };

        let mut buf = Vec::with_capacity(header.encoded_len() + msg.encoded_len() + 8);
        header
            .encode_length_delimited(&mut buf)
            .map_err(|e| RpcError::WriteMessageError(e.to_string()))?;
        msg.encode(&mut buf)
            .map_err(|e| RpcError::WriteMessageError(e.to_string()))?;

        let (tx, rx) = channel();

        let cleanup_on_drop = CleanupRequestOnDrop {
            state: Arc::clone(&self.state),
            correlation_id: Some(correlation_id),
        };

        match self.state.lock().deref_mut() {
            ConnectionState::RequestMap(map) => {
                map.insert(correlation_id, ActiveRequest { channel: tx });
            }
            ConnectionState::Poison(e) => {
                cleanup_on_drop.disarm();
                return Err(RpcError::Poisoned(Arc::clone(e)).into());
            }
        }

        {
            let mut write_guard = self.stream_write.lock().await;
            if let Err(e) = write_frame(write_guard.deref_mut(), &buf).await {
                let err = self.state.lock().poison(e);
                cleanup_on_drop.disarm();
                return Err(RpcError::Poisoned(err).into());
            }
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            // Receiver error means the reader task dropped the sender while
            // poisoning; surface the poison error.
            Ok(result) => result.map_err(|_| {
                Error::from(RpcError::ConnectionError(
                    "connection closed before response".to_string(),
                ))
            })?,
            Err(_) => {
                // Timed out: CleanupRequestOnDrop removes the stale entry.
                return Err(RpcError::Timeout.into());
            }
        }?;
        cleanup_on_drop.disarm();

        if let Some(error) = response.header.error {
            return Err(ServerErrorCode::for_code(error.code).to_error(error.message));
        }

        R::ResponseBody::decode(response.body.as_slice())
            .map_err(|e| Error::from(RpcError::ReadMessageError(e.to_string())))
    }
}

impl<RW> Drop for ServerConnectionInner<RW> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

/// Proxy factory: caches one connection per server address.
#[derive(Debug)]
pub struct RpcClient {
    connections: RwLock<HashMap<String, ServerConnection>>,
    client_id: Arc<str>,
    connect_timeout: Option<Duration>,
    max_message_size: usize,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        RpcClient {
            connections: Default::default(),
            client_id: Arc::from(""),
            connect_timeout: None,
            max_message_size: 64 * 1024 * 1024,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Arc::from(client_id);
        self
    }

    pub async fn get_connection(&self, addr: &str) -> Result<ServerConnection, Error> {
        {
            let connections = self.connections.read();
            if let Some(conn) = connections.get(addr).cloned() {
                if !conn.is_poisoned() {
                    return Ok(conn);
                }
            }
        }
        let new_connection = self.connect(addr).await?;
        {
            let mut connections = self.connections.write();
            if let Some(race_conn) = connections.get(addr) {
                if !race_conn.is_poisoned() {
                    return Ok(race_conn.clone());
                }
            }
            connections.insert(addr.to_owned(), new_connection.clone());
        }
        Ok(new_connection)
    }

    async fn connect(&self, addr: &str) -> Result<ServerConnection, Error> {
        let transport = Transport::connect(addr, self.connect_timeout).await?;
        let inner = ServerConnectionInner::new(
            BufStream::new(transport),
            self.max_message_size,
            Arc::clone(&self.client_id),
        );
        Ok(Arc::new(inner))
    }
}
