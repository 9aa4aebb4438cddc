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

//! Network Module Implementation
//!
//! Everything between the socket and the command executor: per-client
//! sessions, the request framing, the receive state machine, the send
//! pipeline, the idle client monitor and out-of-band event delivery.
//!
//! # Components
//!
//! - `Session`: per-client state shared by every task touching the client
//! - `SessionRegistry`: the live sessions of one connection manager
//! - `Connection`: the receive loop of one session
//! - `ResponseSender`: serialized, fragmented writes of responses
//! - `IdleClientMonitor`: evicts clients stuck mid-operation
//! - `EventQueue`: bounded queue of events pushed to clients

pub use bulk_events::{BulkEventPump, EventBuffer};
pub use connection::{Connection, ReceiveOutcome};
pub use event_queue::{
    EventDelivery, EventQueue, EventTarget, QueuedEvent, OUT_OF_BAND_MIN_VERSION,
};
pub use frame::{RequestFrame, ResponseFrame};
pub use monitor::IdleClientMonitor;
pub use registry::SessionRegistry;
pub use sender::ResponseSender;
pub use session::{
    DisconnectReason, Priority, QueuedResponse, ReceiveState, SendClaim, Session, SessionId,
    SessionKind,
};
pub use stats::{ServerStats, UsageStats};

mod bulk_events;
mod connection;
mod event_queue;
pub mod frame;
mod monitor;
mod registry;
mod sender;
mod session;
mod stats;
#[cfg(test)]
pub(crate) mod test_util;

#[cfg(any(target_os = "linux", target_os = "android"))]
const ENOBUFS: i32 = 105;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const ENOBUFS: i32 = 55;
#[cfg(windows)]
const ENOBUFS: i32 = 10055;
#[cfg(not(any(unix, windows)))]
const ENOBUFS: i32 = -1;

/// Transient buffer exhaustion in the kernel: the operation is retried.
pub(crate) fn is_no_buffer_space(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(ENOBUFS)
}
