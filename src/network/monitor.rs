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

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::request::CommandExecutor;
use crate::Shutdown;

use super::registry::SessionRegistry;
use super::session::{DisconnectReason, Session};

/// Evicts sessions stuck in an operation for longer than the timeout.
///
/// A session idling between commands is left alone; only one whose receive,
/// send or execution has been outstanding past the timeout is closed,
/// abortively.
pub struct IdleClientMonitor<X> {
    registry: Arc<SessionRegistry>,
    executor: Arc<X>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl<X: CommandExecutor> IdleClientMonitor<X> {
    pub fn new(
        registry: Arc<SessionRegistry>,
        executor: Arc<X>,
        timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        IdleClientMonitor {
            registry,
            executor,
            timeout,
            sweep_interval,
        }
    }

    pub fn spawn(self, notify_shutdown: broadcast::Sender<()>, shutdown_complete_tx: mpsc::Sender<()>) {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            let mut interval = time::interval(self.sweep_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            debug!(
                "idle client monitor started, timeout {:?}, sweep every {:?}",
                self.timeout, self.sweep_interval
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("idle client monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep(Instant::now());
                    }
                }
            }
        });
    }

    /// One pass over a snapshot of the registry. Returns the number of
    /// evicted sessions.
    pub fn sweep(&self, now: Instant) -> usize {
        self.evict(self.registry.snapshot(), now)
    }

    fn evict(&self, sessions: Vec<Arc<Session>>, now: Instant) -> usize {
        let mut evicted = 0;
        for session in sessions {
            let Some(stalled) = session.stalled_for(now) else {
                continue;
            };
            if stalled <= self.timeout || !session.operation_in_progress() {
                continue;
            }
            if session.is_disposed() {
                continue;
            }
            self.executor.on_client_forcefully_disconnected(&session);
            if !session.dispose(DisconnectReason::SlowClient) {
                trace!("session {} already disposed by another path", session.id());
                continue;
            }
            warn!(
                monotonic_counter.forced_disconnects = 1u64,
                "client {} stalled for {:?}, disconnected", session, stalled
            );
            session.server_stats().forced_disconnect();
            evicted += 1;
        }
        trace!("idle sweep evicted {} sessions", evicted);
        evicted
    }
}
