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

use crate::network::{EventBuffer, EventQueue, Session, UsageStats};

/// What an executor gets along with each command.
#[derive(Debug)]
pub struct RequestContext<R> {
    pub session: Arc<Session>,
    /// echoed back by the executor so the client can correlate responses
    pub ack_id: Option<i64>,
    pub sequence: u32,
    pub stats: UsageStats,
    pub events: EventQueue<R>,
    /// events flushed to this client by the bulk pump, at low priority
    pub bulk_events: Arc<EventBuffer<R>>,
}

impl<R> RequestContext<R> {
    pub fn new(
        session: Arc<Session>,
        ack_id: Option<i64>,
        sequence: u32,
        stats: UsageStats,
        events: EventQueue<R>,
        bulk_events: Arc<EventBuffer<R>>,
    ) -> Self {
        RequestContext {
            session,
            ack_id,
            sequence,
            stats,
            events,
            bulk_events,
        }
    }

    /// Parks an event for this session until the next bulk flush.
    pub fn buffer_event(&self, event: R) -> bool {
        self.bulk_events.push(self.session.id(), event)
    }

    /// Parks several events at once; a flush never splits them. Returns the
    /// number accepted.
    pub fn buffer_events(&self, events: impl IntoIterator<Item = R>) -> usize {
        self.bulk_events.extend(self.session.id(), events)
    }
}
