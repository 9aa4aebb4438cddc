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

use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use crate::request::{
    CommandCodec, CommandExecutor, CommandOf, CommandProcessor, PendingCommand,
};
use crate::utils::MultipleChannelWorkerPool;
use crate::{AppError, AppResult};

use super::frame::{
    decode_body_length, RequestFrame, BODY_CHUNK_SIZE, LENGTH_HEADER_LEN, SYNC_HEADER_LEN,
};
use super::is_no_buffer_space;
use super::session::{DisconnectReason, ReceiveState, Session, SessionKind};
use super::stats::UsageStats;

/// How a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Disconnect(DisconnectReason),
    /// a service client stopped receiving; the executor owns the session now
    HandedOff,
}

/// Receive loop of one session.
///
/// Frames are assembled by an explicit state machine (sync header, length
/// header, body). A partial read leaves the state untouched and the next
/// read resumes at the current offset. Bodies arrive in chunks of at most
/// [`BODY_CHUNK_SIZE`].
pub struct Connection<X: CommandExecutor> {
    session: Arc<Session>,
    stream: Arc<TcpStream>,
    buffer: BytesMut,
    processor: CommandProcessor<X>,
    pool: Arc<MultipleChannelWorkerPool<PendingCommand<CommandOf<X>>>>,
    max_package_size: usize,
}

impl<X: CommandExecutor> Connection<X> {
    pub fn new(
        session: Arc<Session>,
        stream: Arc<TcpStream>,
        processor: CommandProcessor<X>,
        pool: Arc<MultipleChannelWorkerPool<PendingCommand<CommandOf<X>>>>,
        max_package_size: usize,
    ) -> Self {
        Connection {
            session,
            stream,
            buffer: BytesMut::with_capacity(SYNC_HEADER_LEN),
            processor,
            pool,
            max_package_size,
        }
    }

    /// Receives and dispatches commands until the session ends.
    pub async fn run(mut self) -> ReceiveOutcome {
        loop {
            let frame = match self.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return ReceiveOutcome::Disconnect(DisconnectReason::LeftGracefully),
                Err(AppError::ProtocolFraming(msg)) => {
                    warn!("session {} sent a corrupt frame: {}", self.session, msg);
                    return ReceiveOutcome::Disconnect(DisconnectReason::ProtocolError);
                }
                Err(AppError::ConnectionClosed) => {
                    trace!("session {} receive loop cancelled", self.session.id());
                    return ReceiveOutcome::Disconnect(DisconnectReason::Requested);
                }
                Err(e) => {
                    debug!("session {} receive failed: {}", self.session.id(), e);
                    return ReceiveOutcome::Disconnect(DisconnectReason::TransportError);
                }
            };

            let stats = UsageStats::begin_sample(frame.frame_size);
            debug!(
                monotonic_counter.requests_received = 1u64,
                monotonic_counter.bytes_received = frame.frame_size as u64,
                "session {} received a frame of {} bytes",
                self.session.id(),
                frame.frame_size
            );
            let codec = self.processor.executor().codec();
            let command = match codec.decode(frame.payload) {
                Ok(command) => command,
                Err(e) => {
                    error!("session {} sent an undecodable command: {}", self.session, e);
                    return ReceiveOutcome::Disconnect(DisconnectReason::ProtocolError);
                }
            };
            let sequence = self.session.finish_receive();
            let keeps_receiving =
                self.session.kind() != SessionKind::ServiceClient || codec.keeps_receiving(&command);
            let queueable = codec.is_queueable(&command);

            let pending = PendingCommand {
                session: self.session.clone(),
                command,
                ack_id: frame.ack_id,
                sequence,
                stats,
            };
            if queueable {
                tokio::select! {
                    sent = self.pool.send(pending, self.session.id()) => {
                        if let Err(e) = sent {
                            error!("dispatch pool closed, dropping command of {}: {}", self.session, e);
                            return ReceiveOutcome::Disconnect(DisconnectReason::ServerShutdown);
                        }
                    }
                    _ = self.session.closed().cancelled() => {
                        return ReceiveOutcome::Disconnect(DisconnectReason::Requested);
                    }
                }
            } else {
                self.processor.process(pending).await;
            }

            if !keeps_receiving {
                debug!("session {} handed off after command {}", self.session.id(), sequence);
                return ReceiveOutcome::HandedOff;
            }
        }
    }

    /// Assembles one request frame.
    ///
    /// Returns `Ok(None)` when the peer closes between frames; a close in
    /// the middle of a frame is a connection reset.
    pub async fn read_frame(&mut self) -> AppResult<Option<RequestFrame>> {
        let mut state = ReceiveState::AwaitingSync;
        let mut target = SYNC_HEADER_LEN;
        self.buffer.clear();
        self.session.set_receive_state(state);

        loop {
            let want = (target - self.buffer.len()).min(BODY_CHUNK_SIZE);
            let n = self.read_some(want).await?;
            if n == 0 {
                return if state == ReceiveState::AwaitingSync && self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer").into())
                };
            }
            if state == ReceiveState::AwaitingSync && self.buffer.len() == n {
                self.session.begin_receive();
            }
            self.session.complete_receive(n);

            if self.buffer.len() < target {
                continue;
            }

            match state {
                ReceiveState::AwaitingSync => {
                    self.buffer.clear();
                    state = ReceiveState::AwaitingLength;
                    target = LENGTH_HEADER_LEN;
                }
                ReceiveState::AwaitingLength => {
                    target = decode_body_length(
                        &self.buffer[..],
                        self.max_package_size,
                        self.session.ack_supported(),
                    )?;
                    self.buffer.clear();
                    state = ReceiveState::AwaitingBody;
                }
                ReceiveState::AwaitingBody => {
                    let body = self.buffer.split();
                    self.session.set_receive_state(ReceiveState::AwaitingSync);
                    return RequestFrame::from_body(body, self.session.ack_supported()).map(Some);
                }
            }
            self.session.set_receive_state(state);
        }
    }

    /// One read of at most `want` bytes into the buffer.
    async fn read_some(&mut self, want: usize) -> AppResult<usize> {
        self.buffer.reserve(want);
        loop {
            tokio::select! {
                biased;
                _ = self.session.closed().cancelled() => return Err(AppError::ConnectionClosed),
                ready = self.stream.readable() => ready?,
            }
            let mut limited = (&mut self.buffer).limit(want);
            match self.stream.try_read_buf(&mut limited) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    continue
                }
                Err(e) if is_no_buffer_space(&e) => {
                    trace!("session {} receive hit ENOBUFS, retrying", self.session.id());
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<X: CommandExecutor> Drop for Connection<X> {
    fn drop(&mut self) {
        trace!("receive loop of session {} dropped", self.session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::SessionRegistry;
    use crate::network::test_util::loopback_session;
    use crate::network::{EventBuffer, EventQueue, ResponseSender, ServerStats};
    use crate::request::LoopbackExecutor;
    use crate::utils::WorkerPoolConfig;
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::{broadcast, mpsc};

    struct Harness {
        connection: Connection<LoopbackExecutor>,
        session: Arc<Session>,
        client: TcpStream,
        _notify_shutdown: broadcast::Sender<()>,
    }

    async fn harness(max_package_size: usize) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let (session, client) = loopback_session(&registry, 0).await;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let stats = Arc::new(ServerStats::new());
        let (events, _rx) = EventQueue::bounded(16, stats.clone());
        let processor = CommandProcessor::new(
            Arc::new(LoopbackExecutor::default()),
            ResponseSender::new(80 * 1024),
            events,
            Arc::new(EventBuffer::new(16, stats)),
        );
        let pool = Arc::new(MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx,
            processor.clone(),
            WorkerPoolConfig {
                num_channels: 1,
                ..Default::default()
            },
        ));
        let stream = session.stream().unwrap();
        let connection = Connection::new(session.clone(), stream, processor, pool, max_package_size);
        Harness {
            connection,
            session,
            client,
            _notify_shutdown: notify_shutdown,
        }
    }

    #[tokio::test]
    async fn assembles_frame_from_single_bytes() {
        let mut h = harness(1024).await;
        let wire = RequestFrame::encode(b"split across many reads", None);

        let writer = tokio::spawn(async move {
            for byte in wire.iter() {
                h.client.write_all(&[*byte]).await.unwrap();
                h.client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            h.client
        });

        let frame = h.connection.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"split across many reads");
        assert_eq!(frame.ack_id, None);
        assert_eq!(h.session.receive_state(), ReceiveState::AwaitingSync);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn two_frames_in_one_write() {
        let mut h = harness(1024).await;
        let mut wire = RequestFrame::encode(b"first", None);
        wire.unsplit(RequestFrame::encode(b"second", None));
        h.client.write_all(&wire).await.unwrap();

        let first = h.connection.read_frame().await.unwrap().unwrap();
        let second = h.connection.read_frame().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(&second.payload[..], b"second");
    }

    #[tokio::test]
    async fn body_larger_than_one_chunk() {
        let mut h = harness(1024 * 1024).await;
        let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 253) as u8).collect();
        let wire = RequestFrame::encode(&payload, Some(7));
        h.session.set_acknowledgement_support(true);

        let writer = tokio::spawn(async move {
            h.client.write_all(&wire).await.unwrap();
            h.client
        });
        let frame = h.connection.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.ack_id, Some(7));
        assert_eq!(&frame.payload[..], &payload[..]);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn zero_length_header_is_framing_error() {
        let mut h = harness(1024).await;
        let mut wire = BytesMut::new();
        wire.put_bytes(0, SYNC_HEADER_LEN);
        wire.put_i32(0);
        h.client.write_all(&wire).await.unwrap();

        assert!(matches!(
            h.connection.read_frame().await,
            Err(AppError::ProtocolFraming(_))
        ));
    }

    #[tokio::test]
    async fn close_between_frames_is_graceful() {
        let mut h = harness(1024).await;
        drop(h.client);
        assert!(h.connection.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_inside_frame_is_reset() {
        let mut h = harness(1024).await;
        let wire = RequestFrame::encode(b"truncated", None);
        h.client.write_all(&wire[..wire.len() - 3]).await.unwrap();
        drop(h.client);
        assert!(matches!(
            h.connection.read_frame().await,
            Err(AppError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn dispose_cancels_pending_read() {
        let mut h = harness(1024).await;
        let session = h.session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.dispose(DisconnectReason::Requested);
        });
        assert!(matches!(
            h.connection.read_frame().await,
            Err(AppError::ConnectionClosed)
        ));
    }
}
