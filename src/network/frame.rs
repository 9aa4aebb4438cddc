// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire framing.
//!
//! Request:
//!
//! ```text
//! +----------------+-------------+--------------------+-----------------+
//! | sync (20)      | length (4)  | ack id (8, opt.)   | payload         |
//! +----------------+-------------+--------------------+-----------------+
//!                                 \______________ length ______________/
//! ```
//!
//! Response: `length (4) | payload`, split into fragments of at most the
//! configured fragment size. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Heartbeat/liveness block preceding every request, discarded by the server.
pub const SYNC_HEADER_LEN: usize = 20;
pub const LENGTH_HEADER_LEN: usize = 4;
pub const ACK_ID_LEN: usize = 8;
/// Upper bound of a single body read.
pub const BODY_CHUNK_SIZE: usize = 80 * 1024;

/// Validates a request length header and returns the body size.
///
/// Framing corruption is never recoverable: the caller disposes the session.
pub fn decode_body_length(
    header: &[u8],
    max_package_size: usize,
    ack_supported: bool,
) -> AppResult<usize> {
    let bytes: [u8; LENGTH_HEADER_LEN] = header.try_into().map_err(|_| {
        AppError::ProtocolFraming(format!("length header of {} bytes", header.len()))
    })?;
    let body_size = i32::from_be_bytes(bytes);
    if body_size < 0 {
        return Err(AppError::ProtocolFraming(format!(
            "frame size {} less than 0",
            body_size
        )));
    }
    if body_size == 0 {
        return Err(AppError::ProtocolFraming("empty frame".into()));
    }
    let body_size = body_size as usize;
    if body_size > max_package_size {
        return Err(AppError::ProtocolFraming(format!(
            "Frame of length {} is too large.",
            body_size
        )));
    }
    if ack_supported && body_size <= ACK_ID_LEN {
        return Err(AppError::ProtocolFraming(format!(
            "frame of length {} cannot hold an acknowledgement id",
            body_size
        )));
    }
    Ok(body_size)
}

/// Length header value for a body or response of `len` bytes.
pub fn frame_length(len: usize) -> AppResult<i32> {
    i32::try_from(len).map_err(|_| {
        AppError::InvalidValue(format!("frame of {} bytes exceeds the length header", len))
    })
}

/// A fully received request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub ack_id: Option<i64>,
    pub payload: Bytes,
    /// bytes on the wire, headers included
    pub frame_size: usize,
}

impl RequestFrame {
    pub fn from_body(mut body: BytesMut, ack_supported: bool) -> AppResult<RequestFrame> {
        let frame_size = SYNC_HEADER_LEN + LENGTH_HEADER_LEN + body.len();
        let ack_id = if ack_supported {
            if body.remaining() < ACK_ID_LEN {
                return Err(AppError::ProtocolFraming(
                    "body shorter than acknowledgement id".into(),
                ));
            }
            Some(body.get_i64())
        } else {
            None
        };
        Ok(RequestFrame {
            ack_id,
            payload: body.freeze(),
            frame_size,
        })
    }

    /// Client side encoding of one request.
    pub fn encode(payload: &[u8], ack_id: Option<i64>) -> BytesMut {
        let ack_len = if ack_id.is_some() { ACK_ID_LEN } else { 0 };
        let body_len = ack_len + payload.len();
        debug_assert!(body_len <= i32::MAX as usize, "request body of {} bytes", body_len);
        let mut buf = BytesMut::with_capacity(SYNC_HEADER_LEN + LENGTH_HEADER_LEN + body_len);
        buf.put_bytes(0, SYNC_HEADER_LEN);
        buf.put_i32(body_len as i32);
        if let Some(ack_id) = ack_id {
            buf.put_i64(ack_id);
        }
        buf.put_slice(payload);
        buf
    }
}

pub struct ResponseFrame;

impl ResponseFrame {
    /// Splits a response into segments carrying at most `fragment_size`
    /// payload bytes each; the length header rides in the first one.
    pub fn encode(payload: Bytes, fragment_size: usize) -> AppResult<Vec<Bytes>> {
        let fragment_size = fragment_size.max(1);
        let total = payload.len();
        let length = frame_length(total)?;
        let mut segments = Vec::with_capacity(total.div_ceil(fragment_size).max(1));

        let first_len = total.min(fragment_size);
        let mut first = BytesMut::with_capacity(LENGTH_HEADER_LEN + first_len);
        first.put_i32(length);
        first.put_slice(&payload[..first_len]);
        segments.push(first.freeze());

        let mut offset = first_len;
        while offset < total {
            let end = (offset + fragment_size).min(total);
            segments.push(payload.slice(offset..end));
            offset = end;
        }
        Ok(segments)
    }

    /// Client side reassembly: pops one complete response off `buffer`.
    pub fn parse(buffer: &mut BytesMut) -> AppResult<Option<Bytes>> {
        if buffer.remaining() < LENGTH_HEADER_LEN {
            return Ok(None);
        }
        let size = i32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if size < 0 {
            return Err(AppError::ProtocolFraming(format!(
                "response size {} less than 0",
                size
            )));
        }
        let size = size as usize;
        if buffer.remaining() < LENGTH_HEADER_LEN + size {
            buffer.reserve(LENGTH_HEADER_LEN + size - buffer.remaining());
            return Ok(None);
        }
        buffer.advance(LENGTH_HEADER_LEN);
        Ok(Some(buffer.split_to(size).freeze()))
    }
}
