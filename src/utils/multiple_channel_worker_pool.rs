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

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::Shutdown;

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Channel Capacity
    pub channel_capacity: usize,
    /// Channel Number
    pub num_channels: usize,
    /// Monitor Interval
    pub monitor_interval: Duration,
    /// Worker Check Timeout param
    pub worker_check_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: num_cpus::get(),
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A worker pool with one channel and one dedicated worker per slot.
///
/// Tasks are routed by an ordering key: every task sent with the same key
/// lands on the same channel and is handled sequentially, in submission
/// order. Different keys spread over the slots and run in parallel.
#[derive(Debug)]
pub struct MultipleChannelWorkerPool<T> {
    _shutdown_complete_tx: mpsc::Sender<()>,
    channels: Arc<Vec<TaskChannel<T>>>,
    config: WorkerPoolConfig,
}
/// represent a task channel
#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> MultipleChannelWorkerPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        mut config: WorkerPoolConfig,
    ) -> Self {
        config.num_channels = config.num_channels.max(1);
        let channels = Self::spawn_channels_with_monitor(config.clone(), notify_shutdown, handler);

        Self {
            _shutdown_complete_tx: shutdown_complete_tx,
            channels,
            config,
        }
    }

    /// Send a task to the channel owning `key`.
    pub async fn send(&self, request: T, key: u64) -> Result<(), async_channel::SendError<T>> {
        self.channels[self.channel_of(key)].sender.send(request).await
    }

    /// Channel serving `key`.
    pub fn channel_of(&self, key: u64) -> usize {
        (key % self.channels.len() as u64) as usize
    }

    pub fn get_pool_config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Get channel count
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<Vec<TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(config.num_channels);
        let mut channels = Vec::with_capacity(config.num_channels);

        // Create a dedicated worker for each channel
        for id in 0..config.num_channels {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity);
            let worker = Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
            );
            workers.push(worker);
            channels.push(TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);
        let channels_clone = channels.clone();

        // Start monitor
        Self::spawn_monitor(workers, channels_clone, notify_shutdown, handler, config);

        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            debug!("dispatch worker {id} started");

            loop {
                tokio::select! {
                    Ok(request) = receiver.recv() => {
                        handler.handle(request).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("dispatch worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<Vec<TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("dispatch pool monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("dispatch worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("dispatch worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("dispatch worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        channels[worker.id].receiver.clone(),
                                    );
                                    debug!("dispatch worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("dispatch worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("dispatch pool monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("dispatch worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("dispatch worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "dispatch worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
