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

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::request::{CommandCodec, CommandExecutor, ResponseOf};
use crate::Shutdown;

use super::event_queue::OUT_OF_BAND_MIN_VERSION;
use super::registry::SessionRegistry;
use super::sender::ResponseSender;
use super::session::{Priority, SessionId};
use super::stats::ServerStats;

/// Events parked per session until the bulk pump collects them.
pub struct EventBuffer<R> {
    buffers: Mutex<HashMap<SessionId, VecDeque<R>>>,
    /// per session, 0 = unbounded
    capacity: usize,
    stats: Arc<ServerStats>,
}

impl<R> fmt::Debug for EventBuffer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("sessions", &self.buffers.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<R> EventBuffer<R> {
    pub fn new(capacity: usize, stats: Arc<ServerStats>) -> Self {
        EventBuffer {
            buffers: Mutex::new(HashMap::new()),
            capacity,
            stats,
        }
    }

    /// Never blocks. Returns false when the session's buffer is full.
    pub fn push(&self, session: SessionId, event: R) -> bool {
        self.extend(session, [event]) == 1
    }

    /// Pushes `events` under one lock. Returns the number accepted; the rest
    /// are dropped once the buffer is full.
    pub fn extend(&self, session: SessionId, events: impl IntoIterator<Item = R>) -> usize {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(session).or_default();
        let mut accepted = 0;
        let mut dropped = 0;
        for event in events {
            if self.capacity > 0 && buffer.len() >= self.capacity {
                dropped += 1;
            } else {
                buffer.push_back(event);
                accepted += 1;
            }
        }
        drop(buffers);
        if dropped > 0 {
            warn!(
                monotonic_counter.events_dropped = dropped as u64,
                "bulk event buffer of session {} full, dropped {} events", session, dropped
            );
            for _ in 0..dropped {
                self.stats.event_dropped();
            }
        }
        accepted
    }

    /// Everything buffered for `session`, oldest first.
    pub fn take(&self, session: SessionId) -> Vec<R> {
        self.buffers
            .lock()
            .remove(&session)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn buffered(&self, session: SessionId) -> usize {
        self.buffers.lock().get(&session).map_or(0, VecDeque::len)
    }

    /// Forgets the buffers of sessions not in `live`. Returns the number of
    /// discarded events.
    fn retain(&self, live: &HashSet<SessionId>) -> usize {
        let mut discarded = 0;
        self.buffers.lock().retain(|id, buffer| {
            let keep = live.contains(id);
            if !keep {
                discarded += buffer.len();
            }
            keep
        });
        discarded
    }
}

/// Periodically flushes every session's buffered events at low priority.
///
/// Only sessions speaking [`OUT_OF_BAND_MIN_VERSION`] or later are served;
/// events parked for older clients are discarded.
pub struct BulkEventPump<X: CommandExecutor> {
    buffer: Arc<EventBuffer<ResponseOf<X>>>,
    registry: Arc<SessionRegistry>,
    sender: ResponseSender,
    executor: Arc<X>,
    interval: Duration,
}

impl<X: CommandExecutor> BulkEventPump<X> {
    pub fn new(
        buffer: Arc<EventBuffer<ResponseOf<X>>>,
        registry: Arc<SessionRegistry>,
        sender: ResponseSender,
        executor: Arc<X>,
        interval: Duration,
    ) -> Self {
        BulkEventPump {
            buffer,
            registry,
            sender,
            executor,
            interval,
        }
    }

    pub fn spawn(self, notify_shutdown: broadcast::Sender<()>, shutdown_complete_tx: mpsc::Sender<()>) {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("bulk event pump received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        self.pump();
                    }
                }
            }
        });
    }

    /// One pass over the registry. Returns the number of responses sent.
    pub fn pump(&self) -> usize {
        let sessions = self.registry.snapshot();
        let live: HashSet<SessionId> = sessions.iter().map(|s| s.id()).collect();
        let departed = self.buffer.retain(&live);
        if departed > 0 {
            trace!("discarded {} events of departed sessions", departed);
        }

        let mut sent = 0;
        for session in sessions {
            let events = self.buffer.take(session.id());
            if events.is_empty() {
                continue;
            }
            if session.protocol_version() < OUT_OF_BAND_MIN_VERSION {
                trace!(
                    "session {} speaks protocol {}, {} bulk events discarded",
                    session.id(),
                    session.protocol_version(),
                    events.len()
                );
                continue;
            }
            for response in self.executor.bundle_events(&session, events) {
                let payload = self.executor.codec().encode(&response);
                if self.sender.send(&session, payload, Priority::Low) {
                    sent += 1;
                }
            }
        }
        sent
    }
}
