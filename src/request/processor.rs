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

use std::future::Future;
use std::sync::Arc;

use tracing::{error, trace};

use crate::network::{EventBuffer, EventQueue, Priority, ResponseSender, Session, UsageStats};
use crate::utils::PoolHandler;

use super::{CommandCodec, CommandExecutor, CommandOf, RequestContext, ResponseOf};

/// A decoded command waiting for a dispatch worker.
#[derive(Debug)]
pub struct PendingCommand<C> {
    pub session: Arc<Session>,
    pub command: C,
    pub ack_id: Option<i64>,
    pub sequence: u32,
    pub stats: UsageStats,
}

/// Runs commands against the executor and feeds the responses to the send
/// pipeline. Used by the dispatch workers and, for non-queueable commands,
/// directly by the receive loop.
pub struct CommandProcessor<X: CommandExecutor> {
    executor: Arc<X>,
    sender: ResponseSender,
    events: EventQueue<ResponseOf<X>>,
    bulk_events: Arc<EventBuffer<ResponseOf<X>>>,
}

impl<X: CommandExecutor> Clone for CommandProcessor<X> {
    fn clone(&self) -> Self {
        CommandProcessor {
            executor: self.executor.clone(),
            sender: self.sender.clone(),
            events: self.events.clone(),
            bulk_events: self.bulk_events.clone(),
        }
    }
}

/// Keeps the session's execution counter balanced even if the executor panics.
struct ExecutionGuard<'a>(&'a Session);

impl<'a> ExecutionGuard<'a> {
    fn start(session: &'a Session) -> Self {
        session.start_execution();
        ExecutionGuard(session)
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.0.stop_execution();
    }
}

impl<X: CommandExecutor> CommandProcessor<X> {
    pub fn new(
        executor: Arc<X>,
        sender: ResponseSender,
        events: EventQueue<ResponseOf<X>>,
        bulk_events: Arc<EventBuffer<ResponseOf<X>>>,
    ) -> Self {
        CommandProcessor {
            executor,
            sender,
            events,
            bulk_events,
        }
    }

    pub fn executor(&self) -> &Arc<X> {
        &self.executor
    }

    pub async fn process(&self, pending: PendingCommand<CommandOf<X>>) {
        let PendingCommand {
            session,
            command,
            ack_id,
            sequence,
            stats,
        } = pending;
        if session.is_disposed() {
            trace!("session {} disposed, skipping command {}", session.id(), sequence);
            return;
        }

        let context = RequestContext::new(
            session,
            ack_id,
            sequence,
            stats,
            self.events.clone(),
            self.bulk_events.clone(),
        );
        let result = {
            let _guard = ExecutionGuard::start(&context.session);
            self.executor.execute(&context, command).await
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "command {} of session {} failed: {}",
                    sequence, context.session, e
                );
                self.executor.error_response(&context, &e)
            }
        };

        if let Some(response) = response {
            let payload = self.executor.codec().encode(&response);
            self.sender.send(&context.session, payload, Priority::Normal);
        }
    }
}

impl<X: CommandExecutor> PoolHandler<PendingCommand<CommandOf<X>>> for CommandProcessor<X> {
    fn handle(&self, task: PendingCommand<CommandOf<X>>) -> impl Future<Output = ()> + Send {
        self.process(task)
    }
}
