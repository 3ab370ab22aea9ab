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

//! Length-prefixed message framing.
//!
//! Every message is `Size => u32 (big-endian)` followed by `Size` payload
//! bytes. The payload is a length-delimited prost header (request or
//! response) followed by the raw body message.

use crate::rpc::error::RpcError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn read_frame<R>(stream: &mut R, max_message_size: usize) -> Result<Vec<u8>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RpcError::ReadMessageError(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Err(RpcError::MessageTooLarge {
            size: len,
            limit: max_message_size,
        });
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| RpcError::ReadMessageError(e.to_string()))?;
    Ok(payload)
}

pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RpcError::WriteMessageError(e.to_string()))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| RpcError::WriteMessageError(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| RpcError::WriteMessageError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello frame").await.unwrap();
        let payload = read_frame(&mut b, 1024).await.unwrap();
        assert_eq!(payload, b"hello frame");
    }

    #[tokio::test]
    async fn frame_respects_size_limit() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[0u8; 32]).await.unwrap();
        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 32, limit: 16 }));
    }
}
