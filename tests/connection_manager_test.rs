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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use cachewire::network::frame::SYNC_HEADER_LEN;
use cachewire::network::{
    EventTarget, RequestFrame, ResponseFrame, ServerStats, Session, SessionId, SessionKind,
    OUT_OF_BAND_MIN_VERSION,
};
use cachewire::request::{
    ClientLoggingInfo, CommandCodec, CommandExecutor, LoggingType, RequestContext,
};
use cachewire::{
    setup_local_tracing, AppError, AppResult, ConnectionManager, ExecutionError, ServerConfig,
};
use parking_lot::Mutex;
use rand::Rng;
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[fixture]
fn setup() {
    // a second init in the same test binary is rejected, which is fine
    let _ = setup_local_tracing();
}

#[derive(Debug)]
enum TestCommand {
    Hello(u32),
    Echo(Bytes),
    Seq(u32),
    Fail,
    Notify,
    Big(usize),
    Inline(Bytes),
    EnableAck,
    Park(Vec<Bytes>),
}

#[derive(Debug, Default)]
struct TestCodec;

impl CommandCodec for TestCodec {
    type Command = TestCommand;
    type Response = Bytes;

    fn decode(&self, payload: Bytes) -> AppResult<TestCommand> {
        if let Some(rest) = payload.strip_prefix(b"echo ") {
            return Ok(TestCommand::Echo(Bytes::copy_from_slice(rest)));
        }
        if let Some(rest) = payload.strip_prefix(b"inline ") {
            return Ok(TestCommand::Inline(Bytes::copy_from_slice(rest)));
        }
        let text = std::str::from_utf8(&payload)
            .map_err(|e| AppError::MalformedCommand(e.to_string()))?;
        let mut words = text.split_whitespace();
        let number = |word: Option<&str>| -> AppResult<u64> {
            word.and_then(|w| w.parse().ok())
                .ok_or_else(|| AppError::MalformedCommand(text.to_string()))
        };
        match words.next() {
            Some("hello") => Ok(TestCommand::Hello(number(words.next())? as u32)),
            Some("seq") => Ok(TestCommand::Seq(number(words.next())? as u32)),
            Some("big") => Ok(TestCommand::Big(number(words.next())? as usize)),
            Some("fail") => Ok(TestCommand::Fail),
            Some("notify") => Ok(TestCommand::Notify),
            Some("ack") => Ok(TestCommand::EnableAck),
            Some("park") => Ok(TestCommand::Park(
                words.map(|w| Bytes::copy_from_slice(w.as_bytes())).collect(),
            )),
            _ => Err(AppError::MalformedCommand(text.to_string())),
        }
    }

    fn encode(&self, response: &Bytes) -> Bytes {
        response.clone()
    }

    fn is_queueable(&self, command: &TestCommand) -> bool {
        !matches!(command, TestCommand::Inline(_))
    }

    fn keeps_receiving(&self, command: &TestCommand) -> bool {
        matches!(command, TestCommand::Hello(_))
    }
}

#[derive(Debug, Default)]
struct TestExecutor {
    codec: TestCodec,
    order: Mutex<HashMap<SessionId, Vec<u32>>>,
    disconnected: AtomicUsize,
    forced: AtomicUsize,
    logging: Mutex<Vec<(SessionId, ClientLoggingInfo)>>,
}

fn big_payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect()
}

impl CommandExecutor for TestExecutor {
    type Codec = TestCodec;

    fn codec(&self) -> &TestCodec {
        &self.codec
    }

    async fn execute(
        &self,
        context: &RequestContext<Bytes>,
        command: TestCommand,
    ) -> Result<Option<Bytes>, ExecutionError> {
        match command {
            TestCommand::Hello(version) => {
                context.session.set_protocol_version(version);
                Ok(Some(Bytes::from_static(b"ok")))
            }
            TestCommand::Echo(payload) | TestCommand::Inline(payload) => match context.ack_id {
                Some(ack_id) => {
                    let mut tagged = BytesMut::with_capacity(8 + payload.len());
                    tagged.put_i64(ack_id);
                    tagged.put_slice(&payload);
                    Ok(Some(tagged.freeze()))
                }
                None => Ok(Some(payload)),
            },
            TestCommand::EnableAck => {
                context.session.set_acknowledgement_support(true);
                Ok(Some(Bytes::from_static(b"ok")))
            }
            TestCommand::Park(events) => {
                context.buffer_events(events);
                Ok(Some(Bytes::from_static(b"ok")))
            }
            TestCommand::Seq(n) => {
                let delay = rand::thread_rng().gen_range(0..1500);
                tokio::time::sleep(Duration::from_micros(delay)).await;
                self.order
                    .lock()
                    .entry(context.session.id())
                    .or_default()
                    .push(n);
                Ok(Some(Bytes::from(n.to_string())))
            }
            TestCommand::Fail => Err(ExecutionError::OperationFailed("boom".into())),
            TestCommand::Notify => {
                context.events.enqueue(
                    Bytes::from_static(b"event"),
                    EventTarget::Session(context.session.id()),
                );
                Ok(Some(Bytes::from_static(b"ok")))
            }
            TestCommand::Big(len) => Ok(Some(big_payload(len))),
        }
    }

    fn error_response(
        &self,
        _context: &RequestContext<Bytes>,
        error: &ExecutionError,
    ) -> Option<Bytes> {
        Some(Bytes::from(format!("error: {}", error)))
    }

    fn on_client_disconnected(&self, _session: &Session) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_client_forcefully_disconnected(&self, _session: &Session) {
        self.forced.fetch_add(1, Ordering::SeqCst);
    }

    fn bundle_events(&self, _session: &Session, events: Vec<Bytes>) -> Vec<Bytes> {
        vec![Bytes::from(events.join(&b","[..]))]
    }

    fn on_logging_info_modified(&self, session: &Session, info: ClientLoggingInfo) {
        self.logging.lock().push((session.id(), info));
    }
}

struct Client {
    stream: TcpStream,
    wire: BytesMut,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Client {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
            wire: BytesMut::new(),
        }
    }

    async fn send(&mut self, payload: &[u8]) {
        self.send_tagged(payload, None).await;
    }

    async fn send_tagged(&mut self, payload: &[u8], ack_id: Option<i64>) {
        self.stream
            .write_all(&RequestFrame::encode(payload, ack_id))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(response) = ResponseFrame::parse(&mut self.wire).unwrap() {
                    return response;
                }
                let n = self.stream.read_buf(&mut self.wire).await.unwrap();
                assert_ne!(n, 0, "server closed the connection");
            }
        })
        .await
        .expect("response in time")
    }

    /// Reads until the server closes the connection, gracefully or not.
    async fn expect_closed(&mut self, within: Duration) {
        tokio::time::timeout(within, async {
            let mut sink = vec![0u8; 64 * 1024];
            loop {
                match self.stream.read(&mut sink).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .expect("server closed the connection");
    }
}

async fn start(config: ServerConfig, kind: SessionKind) -> ConnectionManager<TestExecutor> {
    ConnectionManager::start(&config, Arc::new(TestExecutor::default()), kind)
        .await
        .unwrap()
}

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.port = 0;
    config.dispatch_pool.num_channels = 4;
    config
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(16)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_execute_in_submission_order(_setup: (), #[case] channels: usize) {
    let mut config = config();
    config.dispatch_pool.num_channels = channels;
    let manager = start(config, SessionKind::HostClient).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(Client::connect(manager.local_addr()).await);
    }
    for client in clients.iter_mut() {
        let mut batch = BytesMut::new();
        for n in 0..100u32 {
            batch.unsplit(RequestFrame::encode(format!("seq {}", n).as_bytes(), None));
        }
        client.stream.write_all(&batch).await.unwrap();
    }

    for client in clients.iter_mut() {
        for n in 0..100u32 {
            assert_eq!(client.recv().await, Bytes::from(n.to_string()));
        }
    }

    let expected: Vec<u32> = (0..100).collect();
    let order = manager.executor().order.lock().clone();
    assert_eq!(order.len(), 3);
    for sequence in order.values() {
        assert_eq!(sequence, &expected);
    }
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arbitrary_segment_boundaries_decode_identically(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut payload = b"echo ".to_vec();
    payload.extend((0..10_000).map(|_| rand::thread_rng().gen::<u8>()));

    let mut whole = Client::connect(manager.local_addr()).await;
    whole.send(&payload).await;
    let expected = whole.recv().await;
    assert_eq!(&expected[..], &payload[5..]);

    let wire = RequestFrame::encode(&payload, None);
    for _ in 0..3 {
        let mut split = Client::connect(manager.local_addr()).await;
        let mut cuts: Vec<usize> = (0..12)
            .map(|_| rand::thread_rng().gen_range(1..wire.len()))
            .collect();
        // always cut inside the sync and length headers too
        cuts.extend([3, SYNC_HEADER_LEN + 2]);
        cuts.push(wire.len());
        cuts.sort_unstable();
        cuts.dedup();

        let mut offset = 0;
        for cut in cuts {
            split.stream.write_all(&wire[offset..cut]).await.unwrap();
            split.stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            offset = cut;
        }
        assert_eq!(split.recv().await, expected);
    }
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_is_evicted_after_timeout(_setup: ()) {
    let mut config = config();
    config.idle_client.enabled = true;
    config.idle_client.timeout_ms = 2000;
    config.idle_client.sweep_interval_ms = 250;
    let manager = start(config, SessionKind::HostClient).await;

    let mut active = Client::connect(manager.local_addr()).await;
    active.send(b"echo still here").await;
    assert_eq!(&active.recv().await[..], b"still here");

    let started = Instant::now();
    let mut silent = Client::connect(manager.local_addr()).await;
    wait_until("both sessions registered", || manager.registry().len() == 2).await;

    silent.expect_closed(Duration::from_secs(6)).await;
    assert!(started.elapsed() > Duration::from_secs(2));
    wait_until("silent session removed", || manager.registry().len() == 1).await;
    assert_eq!(manager.executor().forced.load(Ordering::SeqCst), 1);
    assert_eq!(ServerStats::get(&manager.stats().forced_disconnects), 1);

    // idling between commands is not a stalled operation
    tokio::time::sleep(Duration::from_millis(500)).await;
    active.send(b"echo after idle").await;
    assert_eq!(&active.recv().await[..], b"after idle");
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn zero_length_header_disposes_session(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;
    wait_until("session registered", || manager.registry().len() == 1).await;

    let mut wire = BytesMut::new();
    wire.put_bytes(0, SYNC_HEADER_LEN);
    wire.put_i32(0);
    client.stream.write_all(&wire).await.unwrap();

    client.expect_closed(Duration::from_secs(2)).await;
    wait_until("session removed", || manager.registry().is_empty()).await;
    wait_until("executor notified", || {
        manager.executor().disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn oversized_frame_disposes_session(_setup: ()) {
    let mut config = config();
    config.network.max_package_size = 1024;
    let manager = start(config, SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(&vec![b'x'; 2048]).await;
    client.expect_closed(Duration::from_secs(2)).await;
    wait_until("session removed", || manager.registry().is_empty()).await;
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_response_arrives_intact(_setup: ()) {
    let mut config = config();
    config.network.response_fragment_size = 80 * 1024;
    let manager = start(config, SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(b"big 256000").await;
    assert_eq!(client.recv().await, big_payload(256_000));
    client.send(b"echo next").await;
    assert_eq!(&client.recv().await[..], b"next");
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn execution_error_becomes_error_response(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(b"fail").await;
    assert_eq!(&client.recv().await[..], b"error: operation failed: boom");
    client.send(b"inline works").await;
    assert_eq!(&client.recv().await[..], b"works");
    assert_eq!(manager.registry().len(), 1);
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn undecodable_command_disposes_session(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(b"no such command").await;
    client.expect_closed(Duration::from_secs(2)).await;
    wait_until("session removed", || manager.registry().is_empty()).await;
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_reach_capable_sessions_only(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut capable = Client::connect(manager.local_addr()).await;
    let mut legacy = Client::connect(manager.local_addr()).await;

    capable
        .send(format!("hello {}", OUT_OF_BAND_MIN_VERSION).as_bytes())
        .await;
    assert_eq!(&capable.recv().await[..], b"ok");
    legacy
        .send(format!("hello {}", OUT_OF_BAND_MIN_VERSION - 1).as_bytes())
        .await;
    assert_eq!(&legacy.recv().await[..], b"ok");

    capable.send(b"notify").await;
    let mut received = vec![capable.recv().await, capable.recv().await];
    received.sort();
    assert_eq!(received, vec![Bytes::from_static(b"event"), Bytes::from_static(b"ok")]);

    legacy.send(b"notify").await;
    assert_eq!(&legacy.recv().await[..], b"ok");
    legacy.send(b"echo no event").await;
    assert_eq!(&legacy.recv().await[..], b"no event");

    assert!(manager
        .event_queue()
        .enqueue(Bytes::from_static(b"broadcast"), EventTarget::Broadcast));
    assert_eq!(&capable.recv().await[..], b"broadcast");
    legacy.send(b"echo still no event").await;
    assert_eq!(&legacy.recv().await[..], b"still no event");

    // departed targets are dropped quietly
    assert!(manager
        .event_queue()
        .enqueue(Bytes::from_static(b"lost"), EventTarget::Session(u64::MAX)));
    capable.send(b"echo done").await;
    assert_eq!(&capable.recv().await[..], b"done");
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_client_is_handed_off_after_regular_command(_setup: ()) {
    let manager = start(config(), SessionKind::ServiceClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(b"hello 1").await;
    assert_eq!(&client.recv().await[..], b"ok");
    client.send(b"echo mapped").await;
    assert_eq!(&client.recv().await[..], b"mapped");

    client.send(b"echo unread").await;
    assert!(tokio::time::timeout(Duration::from_millis(300), client.recv())
        .await
        .is_err());
    assert_eq!(manager.registry().len(), 1);

    let executor = manager.executor().clone();
    manager.stop().await.unwrap();
    assert_eq!(executor.disconnected.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_over_pending_ceiling_is_disconnected(_setup: ()) {
    let mut config = config();
    config.session.max_pending_response_bytes = 4 * 1024 * 1024;
    let manager = start(config, SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    // never read while the server piles up responses
    let mut batch = BytesMut::new();
    for _ in 0..64 {
        batch.unsplit(RequestFrame::encode(b"big 1048576", None));
    }
    client.stream.write_all(&batch).await.unwrap();

    wait_until("slow client disconnected", || {
        ServerStats::get(&manager.stats().forced_disconnects) == 1
    })
    .await;
    client.expect_closed(Duration::from_secs(10)).await;
    wait_until("session removed", || manager.registry().is_empty()).await;
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_disposes_every_session(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut first = Client::connect(manager.local_addr()).await;
    let mut second = Client::connect(manager.local_addr()).await;
    first.send(b"echo 1").await;
    second.send(b"echo 2").await;
    assert_eq!(&first.recv().await[..], b"1");
    assert_eq!(&second.recv().await[..], b"2");

    let executor = manager.executor().clone();
    let stats = manager.stats().clone();
    manager.stop().await.unwrap();

    first.expect_closed(Duration::from_secs(2)).await;
    second.expect_closed(Duration::from_secs(2)).await;
    assert_eq!(executor.disconnected.load(Ordering::SeqCst), 2);
    assert_eq!(ServerStats::get(&stats.sessions_disposed), 2);
    assert_eq!(ServerStats::get(&stats.active_sessions), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acknowledgement_ids_are_echoed(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let mut client = Client::connect(manager.local_addr()).await;

    client.send(b"ack").await;
    assert_eq!(&client.recv().await[..], b"ok");

    for ack_id in [42i64, -7, i64::MAX] {
        client.send_tagged(b"echo tagged", Some(ack_id)).await;
        let response = client.recv().await;
        assert_eq!(&response[..8], &ack_id.to_be_bytes());
        assert_eq!(&response[8..], b"tagged");
    }

    // a body that holds nothing but the ack id is corrupt
    client.send_tagged(b"", Some(1)).await;
    client.expect_closed(Duration::from_secs(2)).await;
    wait_until("session removed", || manager.registry().is_empty()).await;
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adopted_socket_runs_transfer_command_then_receives(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;

    // the socket was accepted by some other listener
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut client = Client {
        stream: TcpStream::connect(listener.local_addr().unwrap()).await.unwrap(),
        wire: BytesMut::new(),
    };
    let (socket, _) = listener.accept().await.unwrap();

    let id = manager
        .adopt(socket, Bytes::from_static(b"seq 7"))
        .await
        .unwrap();
    assert!(manager.registry().contains(id));
    assert_eq!(&client.recv().await[..], b"7");

    client.send(b"echo adopted").await;
    assert_eq!(&client.recv().await[..], b"adopted");
    assert_eq!(manager.executor().order.lock().get(&id), Some(&vec![7]));

    let (stream, accepted) = tokio::join!(
        TcpStream::connect(listener.local_addr().unwrap()),
        listener.accept()
    );
    let mut rejected = Client {
        stream: stream.unwrap(),
        wire: BytesMut::new(),
    };
    let (socket, _) = accepted.unwrap();
    assert!(matches!(
        manager
            .adopt(socket, Bytes::from_static(b"no such command"))
            .await,
        Err(AppError::MalformedCommand(_))
    ));
    rejected.expect_closed(Duration::from_secs(2)).await;
    assert_eq!(manager.registry().len(), 1);
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_events_are_flushed_in_bulk(_setup: ()) {
    let mut config = config();
    config.event_queue.bulk_interval_ms = 100;
    let manager = start(config, SessionKind::HostClient).await;
    let mut capable = Client::connect(manager.local_addr()).await;
    let mut legacy = Client::connect(manager.local_addr()).await;

    capable
        .send(format!("hello {}", OUT_OF_BAND_MIN_VERSION).as_bytes())
        .await;
    assert_eq!(&capable.recv().await[..], b"ok");
    legacy.send(b"hello 1").await;
    assert_eq!(&legacy.recv().await[..], b"ok");

    capable.send(b"park a b c").await;
    let mut received = vec![capable.recv().await, capable.recv().await];
    received.sort();
    assert_eq!(received, vec![Bytes::from_static(b"a,b,c"), Bytes::from_static(b"ok")]);

    legacy.send(b"park x").await;
    assert_eq!(&legacy.recv().await[..], b"ok");
    tokio::time::sleep(Duration::from_millis(300)).await;
    legacy.send(b"echo nothing else").await;
    assert_eq!(&legacy.recv().await[..], b"nothing else");
    manager.stop().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn logging_info_is_pushed_to_every_client(_setup: ()) {
    let manager = start(config(), SessionKind::HostClient).await;
    let _first = Client::connect(manager.local_addr()).await;
    let _second = Client::connect(manager.local_addr()).await;
    wait_until("both sessions registered", || manager.registry().len() == 2).await;

    assert!(manager.set_client_logging_info(LoggingType::Error, true));
    assert!(!manager.set_client_logging_info(LoggingType::Error, true));
    assert!(manager.client_logging_info().is_enabled(LoggingType::Error));
    assert_eq!(manager.update_clients(), 2);

    let pushed = manager.executor().logging.lock().clone();
    assert_eq!(pushed.len(), 2);
    assert_ne!(pushed[0].0, pushed[1].0);
    for (_, info) in pushed {
        assert_eq!(
            info,
            ClientLoggingInfo {
                errors: true,
                detailed: false
            }
        );
    }
    manager.stop().await.unwrap();
}
