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

//! Out-of-band events.
//!
//! Producers (cache engine callbacks) push events without blocking; a single
//! delivery task resolves the target sessions and hands each event to the
//! send pipeline. Events for departed sessions are discarded.

use std::fmt;
use std::sync::Arc;

use async_channel::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::request::{CommandCodec, CommandExecutor, ResponseOf};
use crate::Shutdown;

use super::registry::SessionRegistry;
use super::sender::ResponseSender;
use super::session::{Priority, Session, SessionId};
use super::stats::ServerStats;

/// Oldest client protocol able to receive out-of-band events.
pub const OUT_OF_BAND_MIN_VERSION: u32 = 4124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Session(SessionId),
    /// every live session, at low priority
    Broadcast,
}

#[derive(Debug)]
pub struct QueuedEvent<R> {
    pub event: R,
    pub target: EventTarget,
}

/// Producer handle of the event queue.
pub struct EventQueue<R> {
    tx: async_channel::Sender<QueuedEvent<R>>,
    stats: Arc<ServerStats>,
}

impl<R> Clone for EventQueue<R> {
    fn clone(&self) -> Self {
        EventQueue {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<R> fmt::Debug for EventQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

impl<R: Send + 'static> EventQueue<R> {
    /// A bounded queue and the receiver the delivery task consumes.
    pub fn bounded(
        capacity: usize,
        stats: Arc<ServerStats>,
    ) -> (EventQueue<R>, async_channel::Receiver<QueuedEvent<R>>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (EventQueue { tx, stats }, rx)
    }

    /// Never blocks. Returns false when the event was dropped.
    pub fn enqueue(&self, event: R, target: EventTarget) -> bool {
        match self.tx.try_send(QueuedEvent { event, target }) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    monotonic_counter.events_dropped = 1u64,
                    "event queue full, dropping event for {:?}", dropped.target
                );
                self.stats.event_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event queue closed, dropping event");
                self.stats.event_dropped();
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// The single consumer of the event queue.
pub struct EventDelivery<X: CommandExecutor> {
    rx: async_channel::Receiver<QueuedEvent<ResponseOf<X>>>,
    registry: Arc<SessionRegistry>,
    sender: ResponseSender,
    executor: Arc<X>,
}

impl<X: CommandExecutor> EventDelivery<X> {
    pub fn new(
        rx: async_channel::Receiver<QueuedEvent<ResponseOf<X>>>,
        registry: Arc<SessionRegistry>,
        sender: ResponseSender,
        executor: Arc<X>,
    ) -> Self {
        EventDelivery {
            rx,
            registry,
            sender,
            executor,
        }
    }

    pub fn spawn(self, notify_shutdown: broadcast::Sender<()>, shutdown_complete_tx: mpsc::Sender<()>) {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            loop {
                let queued = tokio::select! {
                    queued = self.rx.recv() => match queued {
                        Ok(queued) => queued,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("event delivery received shutdown signal");
                        break;
                    }
                };
                self.deliver(queued);
            }
            debug!("event delivery exited");
        });
    }

    fn deliver(&self, queued: QueuedEvent<ResponseOf<X>>) {
        let payload = self.executor.codec().encode(&queued.event);
        match queued.target {
            EventTarget::Session(id) => match self.registry.get(id) {
                Some(session) => self.deliver_to(&session, payload, Priority::Normal),
                None => trace!("session {} departed, event discarded", id),
            },
            EventTarget::Broadcast => {
                for session in self.registry.snapshot() {
                    self.deliver_to(&session, payload.clone(), Priority::Low);
                }
            }
        }
    }

    fn deliver_to(&self, session: &Arc<Session>, payload: bytes::Bytes, priority: Priority) {
        if session.protocol_version() < OUT_OF_BAND_MIN_VERSION {
            trace!(
                "session {} speaks protocol {}, event not delivered",
                session.id(),
                session.protocol_version()
            );
            return;
        }
        self.sender.send(session, payload, priority);
    }
}
