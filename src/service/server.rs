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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::frame::{LENGTH_HEADER_LEN, SYNC_HEADER_LEN};
use crate::network::{
    BulkEventPump, Connection, DisconnectReason, EventBuffer, EventDelivery, EventQueue,
    IdleClientMonitor, ReceiveOutcome, ResponseSender, ServerStats, Session, SessionId,
    SessionKind, SessionRegistry, UsageStats,
};
use crate::request::{
    ClientLoggingInfo, CommandCodec, CommandExecutor, CommandOf, CommandProcessor, LoggingType,
    PendingCommand, ResponseOf,
};
use crate::utils::MultipleChannelWorkerPool;
use crate::{AppError, AppResult};

use super::config::{NetworkConfig, ServerConfig};
use super::Shutdown;

type DispatchPool<X> = MultipleChannelWorkerPool<PendingCommand<CommandOf<X>>>;

/// Owner of the listening socket, the session registry and every
/// background loop serving them.
///
/// Graceful shutdown sequence:
/// 1. `stop` broadcasts the shutdown signal: the acceptor, the dispatch
///    workers and their monitor, the idle monitor, the event delivery loop
///    and the bulk event pump all leave their loops.
/// 2. every registered session is disposed, which cancels its receive loop
///    and any writer parked on its socket.
/// 3. each task holding a clone of `shutdown_complete_tx` drops it on exit;
///    `stop` returns once the last one is gone.
pub struct ConnectionManager<X: CommandExecutor> {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    events: EventQueue<ResponseOf<X>>,
    bulk_events: Arc<EventBuffer<ResponseOf<X>>>,
    executor: Arc<X>,
    logging_info: Mutex<ClientLoggingInfo>,
    launcher: Option<Arc<SessionLauncher<X>>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    acceptor: Option<JoinHandle<()>>,
}

impl<X: CommandExecutor> ConnectionManager<X> {
    /// Binds the listener and starts serving clients of the given kind.
    pub async fn start(
        config: &ServerConfig,
        executor: Arc<X>,
        kind: SessionKind,
    ) -> AppResult<ConnectionManager<X>> {
        config.validate()?;

        let listener = bind_listener(&config.network)?;
        let local_addr = listener.local_addr()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let registry = Arc::new(SessionRegistry::new());
        let stats = Arc::new(ServerStats::new());
        let sender = ResponseSender::new(config.network.response_fragment_size);
        let (events, event_rx) = EventQueue::bounded(config.event_queue.capacity, stats.clone());
        let bulk_events = Arc::new(EventBuffer::new(
            config.event_queue.bulk_buffer_capacity,
            stats.clone(),
        ));

        let processor = CommandProcessor::new(
            executor.clone(),
            sender.clone(),
            events.clone(),
            bulk_events.clone(),
        );
        let pool = Arc::new(MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            processor.clone(),
            config.dispatch_pool.worker_pool_config(),
        ));
        debug!("dispatch pool started with {} channels", pool.channel_count());

        EventDelivery::new(event_rx, registry.clone(), sender.clone(), executor.clone())
            .spawn(notify_shutdown.clone(), shutdown_complete_tx.clone());

        BulkEventPump::new(
            bulk_events.clone(),
            registry.clone(),
            sender,
            executor.clone(),
            config.event_queue.bulk_interval(),
        )
        .spawn(notify_shutdown.clone(), shutdown_complete_tx.clone());

        if config.idle_client.is_active() {
            IdleClientMonitor::new(
                registry.clone(),
                executor.clone(),
                config.idle_client.timeout(),
                config.idle_client.sweep_interval(),
            )
            .spawn(notify_shutdown.clone(), shutdown_complete_tx.clone());
        }

        let launcher = Arc::new(SessionLauncher {
            limit_connections: Arc::new(Semaphore::new(config.network.max_connections)),
            registry: registry.clone(),
            stats: stats.clone(),
            processor,
            pool,
            kind,
            max_package_size: config.network.max_package_size,
            max_pending_bytes: config.session.max_pending_response_bytes,
            shutdown_complete_tx: shutdown_complete_tx.clone(),
        });
        let acceptor = Acceptor {
            listener,
            launcher: launcher.clone(),
        };
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        let acceptor = tokio::spawn(async move {
            tokio::select! {
                res = acceptor.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "failed to accept");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("acceptor received shutdown signal");
                }
            }
        });

        info!("cache server listening on {} for {:?} clients", local_addr, kind);
        Ok(ConnectionManager {
            local_addr,
            registry,
            stats,
            events,
            bulk_events,
            executor,
            logging_info: Mutex::new(ClientLoggingInfo::default()),
            launcher: Some(launcher),
            notify_shutdown,
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Producer handle for out-of-band events.
    pub fn event_queue(&self) -> &EventQueue<ResponseOf<X>> {
        &self.events
    }

    /// Per-client buffers flushed by the bulk pump.
    pub fn bulk_events(&self) -> &Arc<EventBuffer<ResponseOf<X>>> {
        &self.bulk_events
    }

    pub fn executor(&self) -> &Arc<X> {
        &self.executor
    }

    /// Takes over a socket accepted elsewhere, typically a service client
    /// handed off by another manager. `transfer_command` is the request body
    /// that triggered the hand-off; it runs before the receive loop starts.
    pub async fn adopt(&self, socket: TcpStream, transfer_command: Bytes) -> AppResult<SessionId> {
        let launcher = self
            .launcher
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("connection manager stopped".into()))?;
        let permit = launcher
            .limit_connections
            .clone()
            .try_acquire_owned()
            .map_err(|e| AppError::Capacity(format!("can not adopt client: {}", e)))?;

        let frame_size = SYNC_HEADER_LEN + LENGTH_HEADER_LEN + transfer_command.len();
        let command = self.executor.codec().decode(transfer_command)?;
        let (session, stream) = launcher.register(socket)?;
        info!("adopted client {} with a transferred command", session);

        let pending = PendingCommand {
            session: session.clone(),
            command,
            ack_id: None,
            sequence: session.finish_receive(),
            stats: UsageStats::begin_sample(frame_size),
        };
        launcher.processor.process(pending).await;

        let id = session.id();
        launcher.spawn_receive(session, stream, permit);
        Ok(id)
    }

    /// Updates one client logging switch. Returns true if it changed; call
    /// [`update_clients`](Self::update_clients) to push the change.
    pub fn set_client_logging_info(&self, kind: LoggingType, enabled: bool) -> bool {
        self.logging_info.lock().set(kind, enabled)
    }

    pub fn client_logging_info(&self) -> ClientLoggingInfo {
        *self.logging_info.lock()
    }

    /// Pushes the current logging switches to every connected client.
    /// Returns the number of clients notified.
    pub fn update_clients(&self) -> usize {
        let info = self.client_logging_info();
        let sessions = self.registry.snapshot();
        for session in &sessions {
            self.executor.on_logging_info_modified(session, info);
        }
        debug!("logging info {:?} pushed to {} clients", info, sessions.len());
        sessions.len()
    }

    /// Stops accepting, disposes every session and waits for the background
    /// loops to exit.
    pub async fn stop(mut self) -> AppResult<()> {
        // no receiver left only means every loop already exited
        let _ = self.notify_shutdown.send(());

        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                error!("acceptor task failed: {}", e);
            }
        }

        let disposed = self.registry.dispose_all(DisconnectReason::ServerShutdown);
        debug!("disposed {} sessions on shutdown", disposed);

        drop(self.launcher.take());
        drop(self.shutdown_complete_tx.take());
        debug!("waiting for shutdown complete...");
        let _ = self.shutdown_complete_rx.recv().await;
        info!("connection manager on {} stopped", self.local_addr);
        Ok(())
    }
}

fn bind_listener(network: &NetworkConfig) -> AppResult<TcpListener> {
    let listen_address = format!("{}:{}", network.ip, network.port);
    let addr: SocketAddr = listen_address
        .parse()
        .map_err(|e| AppError::InvalidValue(format!("listen address {}: {}", listen_address, e)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    // accepted sockets inherit the listener's buffer sizes
    if network.send_buffer_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(network.send_buffer_size) {
            warn!("can not set send buffer size {}: {}", network.send_buffer_size, e);
        }
    }
    if network.recv_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(network.recv_buffer_size) {
            warn!("can not set receive buffer size {}: {}", network.recv_buffer_size, e);
        }
    }

    if let Err(err) = socket.bind(addr) {
        let error_msg = format!(
            "Failed to bind server to address: {} - Error: {}",
            listen_address, err
        );
        error!(error_msg);
        return Err(AppError::IllegalStateError(error_msg));
    }
    let listener = socket.listen(network.max_pending_connections)?;
    info!("tcp server binding to {} for listening", listen_address);
    Ok(listener)
}

/// Everything needed to turn a connected socket into a served session.
/// Shared by the acceptor and [`ConnectionManager::adopt`].
struct SessionLauncher<X: CommandExecutor> {
    limit_connections: Arc<Semaphore>,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    processor: CommandProcessor<X>,
    pool: Arc<DispatchPool<X>>,
    kind: SessionKind,
    max_package_size: usize,
    max_pending_bytes: usize,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl<X: CommandExecutor> SessionLauncher<X> {
    fn register(&self, socket: TcpStream) -> AppResult<(Arc<Session>, Arc<TcpStream>)> {
        socket.set_nodelay(true)?;
        let session = Session::new(
            self.registry.next_session_id(),
            socket,
            self.kind,
            &self.registry,
            self.stats.clone(),
            self.max_pending_bytes,
        )?;
        let stream = session
            .stream()
            .ok_or_else(|| AppError::IllegalStateError("new session without socket".into()))?;
        self.registry.insert(session.clone());
        self.stats.session_opened();
        info!(counter.active_sessions = 1i64, "client connected: {}", session);
        Ok((session, stream))
    }

    fn spawn_receive(
        &self,
        session: Arc<Session>,
        stream: Arc<TcpStream>,
        permit: OwnedSemaphorePermit,
    ) {
        let connection = Connection::new(
            session.clone(),
            stream,
            self.processor.clone(),
            self.pool.clone(),
            self.max_package_size,
        );
        let executor = self.processor.executor().clone();
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();

        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            match connection.run().await {
                ReceiveOutcome::Disconnect(reason) => {
                    session.dispose(reason);
                }
                ReceiveOutcome::HandedOff => session.closed().cancelled().await,
            }
            executor.on_client_disconnected(&session);
            // whether gracefully or unexpectedly closed, release connection
            drop(permit);
        });
    }
}

struct Acceptor<X: CommandExecutor> {
    listener: TcpListener,
    launcher: Arc<SessionLauncher<X>>,
}

impl<X: CommandExecutor> Acceptor<X> {
    /// Accepts connections until the listener fails for good.
    async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .launcher
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limit: {}", e)))?;

            let socket = self.accept().await?;
            match self.launcher.register(socket) {
                Ok((session, stream)) => self.launcher.spawn_receive(session, stream, permit),
                Err(e) => warn!("failed to set up accepted connection: {}", e),
            }
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!("accept tcp server error: {}", err)));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl<X: CommandExecutor> Drop for Acceptor<X> {
    fn drop(&mut self) {
        debug!("tcp acceptor dropped");
    }
}
