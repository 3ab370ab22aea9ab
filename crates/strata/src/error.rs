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

use parse_display::Display;
use std::fmt;
use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Client-facing error taxonomy.
///
/// Location and RPC failures that are retryable are recovered inside the
/// batcher; what surfaces here is either a per-call misuse error returned
/// inline or a per-operation error routed to the session error collector.
#[derive(Debug, Clone)]
pub enum Error {
    /// Misused builder, malformed operation, mode change with pending work.
    InvalidArgument { message: String },
    /// Table missing or key range unowned.
    NotFound { message: String },
    /// Duplicate primary key on insert.
    AlreadyPresent { message: String },
    /// The contacted replica is no longer the tablet leader.
    NotLeader { message: String },
    /// The tablet is no longer hosted where the cache said it was.
    TabletMoved { message: String },
    /// Operation budget exhausted.
    TimedOut { message: String },
    /// No replica reachable.
    ServiceUnavailable { message: String },
    /// Close with pending work, apply on a closed session.
    IllegalState { message: String },
    /// Session closure discarded the operation.
    Aborted { message: String },
    /// Manual-mode mutation buffer exceeded.
    Incomplete { message: String },
    /// Transport-level failure (connect, send, receive).
    Connection { message: String },
    JsonSerde { message: String },
    /// A flush finished but some rows failed; details are in the session
    /// error collector.
    RowErrors { count: usize },
    Unexpected {
        message: String,
        source: Option<SharedError>,
    },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Error::TimedOut {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Error::Aborted {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Error::Unexpected {
            message: message.into(),
            source: None,
        }
    }

    /// True for failures that the batcher recovers from internally by
    /// invalidating the location cache and re-resolving the tablet.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::TabletMoved { .. }
                | Error::ServiceUnavailable { .. }
                | Error::Connection { .. }
        )
    }

    /// The wire code this error maps to, if any.
    pub fn server_code(&self) -> Option<ServerErrorCode> {
        match self {
            Error::InvalidArgument { .. } => Some(ServerErrorCode::InvalidArgument),
            Error::NotFound { .. } => Some(ServerErrorCode::NotFound),
            Error::AlreadyPresent { .. } => Some(ServerErrorCode::AlreadyPresent),
            Error::NotLeader { .. } => Some(ServerErrorCode::NotLeader),
            Error::TabletMoved { .. } => Some(ServerErrorCode::TabletNotFound),
            Error::TimedOut { .. } => Some(ServerErrorCode::TimedOut),
            Error::ServiceUnavailable { .. } => Some(ServerErrorCode::ServiceUnavailable),
            Error::IllegalState { .. } => Some(ServerErrorCode::IllegalState),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument { message } => write!(f, "Invalid argument: {message}"),
            Error::NotFound { message } => write!(f, "Not found: {message}"),
            Error::AlreadyPresent { message } => write!(f, "Already present: {message}"),
            Error::NotLeader { message } => write!(f, "Not the leader: {message}"),
            Error::TabletMoved { message } => write!(f, "Tablet moved: {message}"),
            Error::TimedOut { message } => write!(f, "Timed out: {message}"),
            Error::ServiceUnavailable { message } => write!(f, "Service unavailable: {message}"),
            Error::IllegalState { message } => write!(f, "Illegal state: {message}"),
            Error::Aborted { message } => write!(f, "Aborted: {message}"),
            Error::Incomplete { message } => write!(f, "Incomplete: {message}"),
            Error::Connection { message } => write!(f, "Connection error: {message}"),
            Error::JsonSerde { message } => write!(f, "JSON serde error: {message}"),
            Error::RowErrors { count } => {
                write!(f, "Flush produced {count} row error(s); see get_pending_errors")
            }
            Error::Unexpected { message, .. } => write!(f, "Unexpected error: {message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Unexpected {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Error codes carried on the wire by master and tablet-server responses,
/// both at response level and per row.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    None,
    UnknownServer,
    InvalidArgument,
    NotFound,
    AlreadyPresent,
    NotLeader,
    TabletNotFound,
    TimedOut,
    ServiceUnavailable,
    IllegalState,
    ScannerExpired,
}

impl ServerErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ServerErrorCode::None => 0,
            ServerErrorCode::UnknownServer => 1,
            ServerErrorCode::InvalidArgument => 2,
            ServerErrorCode::NotFound => 3,
            ServerErrorCode::AlreadyPresent => 4,
            ServerErrorCode::NotLeader => 5,
            ServerErrorCode::TabletNotFound => 6,
            ServerErrorCode::TimedOut => 7,
            ServerErrorCode::ServiceUnavailable => 8,
            ServerErrorCode::IllegalState => 9,
            ServerErrorCode::ScannerExpired => 10,
        }
    }

    pub fn for_code(code: i32) -> ServerErrorCode {
        match code {
            0 => ServerErrorCode::None,
            2 => ServerErrorCode::InvalidArgument,
            3 => ServerErrorCode::NotFound,
            4 => ServerErrorCode::AlreadyPresent,
            5 => ServerErrorCode::NotLeader,
            6 => ServerErrorCode::TabletNotFound,
            7 => ServerErrorCode::TimedOut,
            8 => ServerErrorCode::ServiceUnavailable,
            9 => ServerErrorCode::IllegalState,
            10 => ServerErrorCode::ScannerExpired,
            _ => ServerErrorCode::UnknownServer,
        }
    }

    /// Retriable codes trigger cache invalidation and an internal retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServerErrorCode::NotLeader
                | ServerErrorCode::TabletNotFound
                | ServerErrorCode::ServiceUnavailable
        )
    }

    pub fn to_error(self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self {
            ServerErrorCode::InvalidArgument => Error::InvalidArgument { message },
            ServerErrorCode::NotFound => Error::NotFound { message },
            ServerErrorCode::AlreadyPresent => Error::AlreadyPresent { message },
            ServerErrorCode::NotLeader => Error::NotLeader { message },
            ServerErrorCode::TabletNotFound => Error::TabletMoved { message },
            ServerErrorCode::TimedOut => Error::TimedOut { message },
            ServerErrorCode::ServiceUnavailable => Error::ServiceUnavailable { message },
            ServerErrorCode::IllegalState => Error::IllegalState { message },
            _ => Error::Unexpected {
                message,
                source: None,
            },
        }
    }
}
