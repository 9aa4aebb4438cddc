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

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::network::Session;
use crate::service::ExecutionError;
use crate::AppResult;

use super::{CommandCodec, CommandExecutor, RequestContext};

/// Payloads pass through untouched in both directions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl CommandCodec for RawCodec {
    type Command = Bytes;
    type Response = Bytes;

    fn decode(&self, payload: Bytes) -> AppResult<Bytes> {
        Ok(payload)
    }

    fn encode(&self, response: &Bytes) -> Bytes {
        response.clone()
    }
}

/// Echoes every command back, prefixed with its acknowledgement id when the
/// session negotiated one. Used by the standalone binary to exercise the
/// wire path without a cache engine.
#[derive(Debug, Default)]
pub struct LoopbackExecutor {
    codec: RawCodec,
}

impl CommandExecutor for LoopbackExecutor {
    type Codec = RawCodec;

    fn codec(&self) -> &RawCodec {
        &self.codec
    }

    async fn execute(
        &self,
        context: &RequestContext<Bytes>,
        command: Bytes,
    ) -> Result<Option<Bytes>, ExecutionError> {
        match context.ack_id {
            Some(ack_id) => {
                let mut response = BytesMut::with_capacity(8 + command.len());
                response.put_i64(ack_id);
                response.put_slice(&command);
                Ok(Some(response.freeze()))
            }
            None => Ok(Some(command)),
        }
    }

    fn error_response(
        &self,
        _context: &RequestContext<Bytes>,
        error: &ExecutionError,
    ) -> Option<Bytes> {
        Some(Bytes::from(error.to_string()))
    }

    fn on_client_disconnected(&self, session: &Session) {
        debug!(
            "loopback client {} disconnected after {} requests",
            session,
            session.requests()
        );
    }
}
