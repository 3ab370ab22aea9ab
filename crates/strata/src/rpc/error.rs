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

use crate::error::Error;
use std::fmt;
use std::sync::Arc;

/// Transport-layer failures, below the client error taxonomy.
#[derive(Debug, Clone)]
pub enum RpcError {
    ConnectionError(String),
    ReadMessageError(String),
    WriteMessageError(String),
    MessageTooLarge { size: usize, limit: usize },
    /// The connection's read stream died; all in-flight and future requests
    /// on it fail with the original error.
    Poisoned(Arc<RpcError>),
    Timeout,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::ConnectionError(message) => write!(f, "connection error: {message}"),
            RpcError::ReadMessageError(message) => write!(f, "read error: {message}"),
            RpcError::WriteMessageError(message) => write!(f, "write error: {message}"),
            RpcError::MessageTooLarge { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit}")
            }
            RpcError::Poisoned(err) => write!(f, "connection poisoned: {err}"),
            RpcError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Error {
        match err {
            RpcError::Timeout => Error::timed_out("RPC timed out awaiting response"),
            other => Error::connection(other.to_string()),
        }
    }
}
