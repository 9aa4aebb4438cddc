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

use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult};

use super::frame::ResponseFrame;
use super::is_no_buffer_space;
use super::session::{DisconnectReason, Priority, QueuedResponse, SendClaim, Session};

/// Per-session send pipeline.
///
/// At most one writer task is active per session. Whoever finds the write
/// path idle claims it and spawns the writer; everyone else queues behind
/// it. The writer drains the pending queue before releasing the path, so
/// the bytes of two responses never interleave on the socket.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    fragment_size: usize,
}

impl ResponseSender {
    pub fn new(fragment_size: usize) -> Self {
        ResponseSender {
            fragment_size: fragment_size.max(1),
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Frames `payload` and hands it to the session's write path.
    ///
    /// Returns false when the response was dropped: the session is gone, it
    /// overflowed its pending ceiling, or the payload does not fit a frame.
    pub fn send(&self, session: &Arc<Session>, payload: Bytes, priority: Priority) -> bool {
        let segments = match ResponseFrame::encode(payload, self.fragment_size) {
            Ok(segments) => segments,
            Err(e) => {
                error!("session {} response dropped: {}", session.id(), e);
                return false;
            }
        };
        match session.begin_send_or_enqueue(QueuedResponse::new(segments), priority) {
            SendClaim::Write(response) => {
                let session = session.clone();
                tokio::spawn(async move {
                    flush(session, response).await;
                });
                true
            }
            SendClaim::Queued => {
                trace!(
                    "session {} busy sending, response queued ({} pending)",
                    session.id(),
                    session.pending_responses()
                );
                true
            }
            SendClaim::Overflow => {
                warn!(
                    "session {} exceeded its pending response limit, disconnecting slow client",
                    session
                );
                if session.dispose(DisconnectReason::SlowClient) {
                    session.server_stats().forced_disconnect();
                }
                false
            }
            SendClaim::Closed => {
                debug!("session {} closed, response dropped", session.id());
                false
            }
        }
    }
}

/// Writes `response` and then every queued one, releasing the write path
/// when the queue is empty.
async fn flush(session: Arc<Session>, mut response: QueuedResponse) {
    let Some(stream) = session.stream() else {
        return;
    };
    loop {
        for segment in &response.segments {
            if let Err(e) = write_segment(&session, &stream, segment).await {
                match e {
                    AppError::ConnectionClosed => {
                        trace!("session {} closed during send", session.id())
                    }
                    e => debug!("session {} send failed: {}", session.id(), e),
                }
                session.dispose(DisconnectReason::TransportError);
                return;
            }
        }
        match session.next_pending_or_finish() {
            Some(next) => response = next,
            None => return,
        }
    }
}

/// Writes one segment, resuming at the offset after every partial write.
async fn write_segment(session: &Session, stream: &TcpStream, segment: &Bytes) -> AppResult<()> {
    let mut offset = 0;
    while offset < segment.len() {
        tokio::select! {
            biased;
            _ = session.closed().cancelled() => return Err(AppError::ConnectionClosed),
            ready = stream.writable() => ready?,
        }
        match stream.try_write(&segment[offset..]) {
            Ok(0) => {
                return Err(AppError::DetailedIoError(
                    "socket accepted zero bytes".into(),
                ))
            }
            Ok(n) => {
                offset += n;
                session.add_bytes_sent(n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                continue
            }
            Err(e) if is_no_buffer_space(&e) => {
                trace!("session {} send hit ENOBUFS, retrying", session.id());
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
