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

use std::fmt::Debug;
use std::future::Future;

use bytes::Bytes;

use crate::network::Session;
use crate::service::ExecutionError;
use crate::AppResult;

use super::{ClientLoggingInfo, RequestContext};

/// Turns payloads into commands and responses into payloads.
///
/// The connection manager never looks inside a payload; everything it needs
/// to know about a command is asked through this trait.
pub trait CommandCodec: Send + Sync + 'static {
    type Command: Send + Debug + 'static;
    type Response: Send + Sync + Debug + 'static;

    /// A decode failure is fatal to the session.
    fn decode(&self, payload: Bytes) -> AppResult<Self::Command>;

    fn encode(&self, response: &Self::Response) -> Bytes;

    /// Non-queueable commands run on the receiving task, ahead of the pool.
    fn is_queueable(&self, _command: &Self::Command) -> bool {
        true
    }

    /// For service-client sessions only: whether the receive loop goes on
    /// after this command. The executor takes over the socket otherwise.
    fn keeps_receiving(&self, _command: &Self::Command) -> bool {
        true
    }
}

pub type CommandOf<X> = <<X as CommandExecutor>::Codec as CommandCodec>::Command;
pub type ResponseOf<X> = <<X as CommandExecutor>::Codec as CommandCodec>::Response;

/// The cache engine behind the connection manager.
pub trait CommandExecutor: Send + Sync + 'static {
    type Codec: CommandCodec;

    fn codec(&self) -> &Self::Codec;

    /// Runs one command. `Ok(None)` sends nothing back.
    fn execute(
        &self,
        context: &RequestContext<ResponseOf<Self>>,
        command: CommandOf<Self>,
    ) -> impl Future<Output = Result<Option<ResponseOf<Self>>, ExecutionError>> + Send;

    /// Maps an execution failure to the response the client sees.
    fn error_response(
        &self,
        context: &RequestContext<ResponseOf<Self>>,
        error: &ExecutionError,
    ) -> Option<ResponseOf<Self>>;

    /// The session is gone, for whatever reason.
    fn on_client_disconnected(&self, _session: &Session) {}

    /// The idle monitor is about to evict the session.
    fn on_client_forcefully_disconnected(&self, _session: &Session) {}

    /// Folds the events buffered for one session into the responses the bulk
    /// pump sends. Each event goes out on its own unless overridden.
    fn bundle_events(
        &self,
        _session: &Session,
        events: Vec<ResponseOf<Self>>,
    ) -> Vec<ResponseOf<Self>> {
        events
    }

    /// The client logging switches changed; push them to this client.
    fn on_logging_info_modified(&self, _session: &Session, _info: ClientLoggingInfo) {}
}
