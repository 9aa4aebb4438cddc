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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::session::{DisconnectReason, Session, SessionId};

/// Live sessions of one connection manager.
///
/// Structural changes go through a single lock; per-session work always runs
/// on a snapshot so the lock is never held while touching a session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, session: Arc<Session>) {
        let previous = self.sessions.lock().insert(session.id(), session);
        debug_assert!(previous.is_none(), "session ids are unique");
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&id)
    }

    /// Disposed sessions are invisible even before their entry is removed.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(&id)
            .filter(|session| !session.is_disposed())
            .cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter(|session| !session.is_disposed())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Disposes every session, used on shutdown.
    pub fn dispose_all(&self, reason: DisconnectReason) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.dispose(reason);
        }
        debug!("registry drained {} sessions", count);
        count
    }
}
