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

use tokio::net::{TcpListener, TcpStream};

use super::registry::SessionRegistry;
use super::session::{Session, SessionKind};
use super::stats::ServerStats;

/// A registered session over a loopback socket, plus the client end.
pub(crate) async fn loopback_session(
    registry: &Arc<SessionRegistry>,
    max_pending_bytes: usize,
) -> (Arc<Session>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    let stats = Arc::new(ServerStats::new());
    stats.session_opened();
    let session = Session::new(
        registry.next_session_id(),
        server,
        SessionKind::HostClient,
        registry,
        stats,
        max_pending_bytes,
    )
    .unwrap();
    registry.insert(session.clone());
    (session, client)
}
