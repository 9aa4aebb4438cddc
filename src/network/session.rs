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

//! Client session state.
//!
//! A session is created by the acceptor for each inbound connection and is
//! shared (`Arc<Session>`) between the receive loop, the dispatch workers,
//! the send pipeline, the idle monitor and the event delivery loop. Its
//! lifecycle is owned by the [`SessionRegistry`]: `dispose` is the only way
//! out and it is idempotent.
//!
//! Locking: every mutex here is session local and never held across I/O.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::stats::ServerStats;

pub type SessionId = u64;

/// Which kind of clients the connection manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    HostClient,
    Management,
    /// keeps receiving only after handshake/mapping commands
    ServiceClient,
}

/// Pending responses drain Normal first, FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitingSync,
    AwaitingLength,
    AwaitingBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LeftGracefully,
    ProtocolError,
    TransportError,
    SlowClient,
    ServerShutdown,
    Requested,
}

impl DisconnectReason {
    /// Abortive close: RST instead of FIN.
    fn is_abortive(&self) -> bool {
        matches!(self, DisconnectReason::SlowClient)
    }
}

/// A serialized response ready for the socket.
#[derive(Debug, Clone)]
pub struct QueuedResponse {
    pub segments: Vec<Bytes>,
}

impl QueuedResponse {
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of handing a response to the session's write path.
#[derive(Debug)]
pub enum SendClaim {
    /// the caller owns the write path and must write this response
    Write(QueuedResponse),
    /// a send is in flight, the response waits in the pending queue
    Queued,
    /// the pending queue would exceed its ceiling
    Overflow,
    Closed,
}

#[derive(Debug, Default)]
struct SendState {
    in_progress: bool,
    normal: VecDeque<QueuedResponse>,
    low: VecDeque<QueuedResponse>,
    pending_bytes: usize,
}

impl SendState {
    fn push(&mut self, response: QueuedResponse, priority: Priority) {
        self.pending_bytes += response.len();
        match priority {
            Priority::Normal => self.normal.push_back(response),
            Priority::Low => self.low.push_back(response),
        }
    }

    fn pop(&mut self) -> Option<QueuedResponse> {
        let response = self.normal.pop_front().or_else(|| self.low.pop_front())?;
        self.pending_bytes -= response.len();
        Some(response)
    }

    fn pending(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    fn clear(&mut self) {
        self.normal.clear();
        self.low.clear();
        self.pending_bytes = 0;
    }
}

/// Start instants of the operations the idle monitor watches.
#[derive(Debug)]
struct OperationClock {
    last_activity: Instant,
    receive_started: Option<Instant>,
    send_started: Option<Instant>,
    executions: usize,
    execution_started: Option<Instant>,
}

pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    kind: SessionKind,
    stream: Mutex<Option<Arc<TcpStream>>>,
    closed: CancellationToken,
    disposed: AtomicBool,
    registry: Weak<SessionRegistry>,
    server_stats: Arc<ServerStats>,

    protocol_version: AtomicU32,
    ack_supported: AtomicBool,
    client_id: Mutex<Option<String>>,

    receive_state: Mutex<ReceiveState>,
    next_sequence: AtomicU32,
    send: Mutex<SendState>,
    max_pending_bytes: usize,
    clock: Mutex<OperationClock>,

    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    requests: AtomicU64,
}

impl Session {
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        kind: SessionKind,
        registry: &Arc<SessionRegistry>,
        server_stats: Arc<ServerStats>,
        max_pending_bytes: usize,
    ) -> std::io::Result<Arc<Session>> {
        let peer_addr = stream.peer_addr()?;
        let now = Instant::now();
        Ok(Arc::new(Session {
            id,
            peer_addr,
            kind,
            stream: Mutex::new(Some(Arc::new(stream))),
            closed: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            registry: Arc::downgrade(registry),
            server_stats,
            protocol_version: AtomicU32::new(0),
            ack_supported: AtomicBool::new(false),
            client_id: Mutex::new(None),
            receive_state: Mutex::new(ReceiveState::AwaitingSync),
            next_sequence: AtomicU32::new(1),
            send: Mutex::new(SendState::default()),
            max_pending_bytes,
            // the handshake counts as an outstanding receive until the first command lands
            clock: Mutex::new(OperationClock {
                last_activity: now,
                receive_started: Some(now),
                send_started: None,
                executions: 0,
                execution_started: None,
            }),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// The socket, until the session is disposed.
    pub fn stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }

    /// Fires once, when the session is disposed.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn server_stats(&self) -> &Arc<ServerStats> {
        &self.server_stats
    }

    // ---- negotiated properties, set by the executor during handshake ----

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub fn set_protocol_version(&self, version: u32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    pub fn ack_supported(&self) -> bool {
        self.ack_supported.load(Ordering::Acquire)
    }

    pub fn set_acknowledgement_support(&self, supported: bool) {
        self.ack_supported.store(supported, Ordering::Release);
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.client_id.lock() = Some(client_id.into());
    }

    // ---- receive side ----

    pub fn mark_activity(&self) {
        self.clock.lock().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.clock.lock().last_activity
    }

    pub fn receive_state(&self) -> ReceiveState {
        *self.receive_state.lock()
    }

    pub fn set_receive_state(&self, state: ReceiveState) {
        *self.receive_state.lock() = state;
    }

    /// A new frame started arriving.
    pub fn begin_receive(&self) {
        let mut clock = self.clock.lock();
        let now = Instant::now();
        clock.last_activity = now;
        clock.receive_started.get_or_insert(now);
    }

    /// `n` bytes of the current frame arrived.
    pub fn complete_receive(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.server_stats.bytes_received(n);
        self.clock.lock().last_activity = Instant::now();
    }

    /// The current frame was assembled into a command.
    pub fn finish_receive(&self) -> u32 {
        self.clock.lock().receive_started = None;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.server_stats.request_received();
        self.next_sequence()
    }

    /// Per-session arrival sequence, wraps back to 1.
    fn next_sequence(&self) -> u32 {
        let mut current = self.next_sequence.load(Ordering::Relaxed);
        loop {
            let next = if current == u32::MAX { 1 } else { current + 1 };
            match self.next_sequence.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    // ---- execution ----

    pub fn start_execution(&self) {
        let mut clock = self.clock.lock();
        if clock.executions == 0 {
            clock.execution_started = Some(Instant::now());
        }
        clock.executions += 1;
    }

    pub fn stop_execution(&self) {
        let mut clock = self.clock.lock();
        clock.executions = clock.executions.saturating_sub(1);
        if clock.executions == 0 {
            clock.execution_started = None;
        }
    }

    // ---- send side ----

    /// Claims the write path if no send is in flight.
    pub fn try_begin_send(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut send = self.send.lock();
        if send.in_progress {
            return false;
        }
        send.in_progress = true;
        self.clock.lock().send_started = Some(Instant::now());
        true
    }

    /// Appends to the pending queue. Returns false if the session is gone or
    /// the ceiling would be exceeded.
    pub fn enqueue(&self, response: QueuedResponse, priority: Priority) -> bool {
        let mut send = self.send.lock();
        self.enqueue_locked(&mut send, response, priority)
    }

    fn enqueue_locked(
        &self,
        send: &mut SendState,
        response: QueuedResponse,
        priority: Priority,
    ) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.max_pending_bytes > 0
            && send.pending_bytes + response.len() > self.max_pending_bytes
        {
            return false;
        }
        send.push(response, priority);
        self.server_stats.response_queued();
        true
    }

    /// Check-and-set of the send flag and the fallback enqueue under a single
    /// lock acquisition, so a finishing writer cannot strand the response.
    pub fn begin_send_or_enqueue(&self, response: QueuedResponse, priority: Priority) -> SendClaim {
        if self.is_disposed() {
            return SendClaim::Closed;
        }
        let mut send = self.send.lock();
        if !send.in_progress {
            send.in_progress = true;
            self.clock.lock().send_started = Some(Instant::now());
            return SendClaim::Write(response);
        }
        if self.enqueue_locked(&mut send, response, priority) {
            SendClaim::Queued
        } else if self.is_disposed() {
            SendClaim::Closed
        } else {
            SendClaim::Overflow
        }
    }

    /// Called by the writer once a response is fully flushed: hands over the
    /// next pending response, or releases the write path.
    pub fn next_pending_or_finish(&self) -> Option<QueuedResponse> {
        let mut send = self.send.lock();
        match send.pop() {
            Some(response) => {
                self.clock.lock().send_started = Some(Instant::now());
                Some(response)
            }
            None => {
                send.in_progress = false;
                self.clock.lock().send_started = None;
                None
            }
        }
    }

    pub fn is_sending(&self) -> bool {
        self.send.lock().in_progress
    }

    pub fn pending_responses(&self) -> usize {
        self.send.lock().pending()
    }

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.server_stats.bytes_sent(n);
        self.clock.lock().send_started = Some(Instant::now());
    }

    // ---- monitoring ----

    pub fn operation_in_progress(&self) -> bool {
        let clock = self.clock.lock();
        clock.receive_started.is_some()
            || clock.send_started.is_some()
            || clock.execution_started.is_some()
    }

    /// Age of the oldest outstanding operation.
    pub fn stalled_for(&self, now: Instant) -> Option<Duration> {
        let clock = self.clock.lock();
        [
            clock.receive_started,
            clock.send_started,
            clock.execution_started,
        ]
        .into_iter()
        .flatten()
        .map(|started| now.saturating_duration_since(started))
        .max()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    // ---- teardown ----

    /// Tears the session down. Only the first caller does the work and gets
    /// `true`; every later or concurrent call is a no-op.
    pub fn dispose(&self, reason: DisconnectReason) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // stop the receive loop and any writer parked on the socket
        self.closed.cancel();

        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            if reason.is_abortive() {
                if let Err(e) = SockRef::from(&*stream).set_linger(Some(Duration::ZERO)) {
                    warn!("session {} failed to set linger: {}", self.id, e);
                }
            }
            // the fd closes once the loops holding a clone observe the cancellation
            drop(stream);
        }

        {
            let mut send = self.send.lock();
            let discarded = send.pending();
            send.clear();
            send.in_progress = false;
            if discarded > 0 {
                debug!("session {} discarded {} pending responses", self.id, discarded);
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.server_stats.session_disposed();

        match reason {
            DisconnectReason::LeftGracefully => {
                info!(counter.active_sessions = -1i64, "{} left gracefully", self)
            }
            _ => info!(
                counter.active_sessions = -1i64,
                "connection lost with client {} ({:?})", self, reason
            ),
        }
        true
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id.lock().as_deref() {
            Some(client_id) => write!(f, "{}[{}]@{}", self.id, client_id, self.peer_addr),
            None => write!(f, "{}@{}", self.id, self.peer_addr),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("kind", &self.kind)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("session {} dropped", self.id);
    }
}
