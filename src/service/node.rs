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

use tokio::runtime::Runtime;
use tokio::signal;
use tracing::info;

use crate::network::SessionKind;
use crate::request::CommandExecutor;
use crate::AppResult;

use super::config::ServerConfig;
use super::server::ConnectionManager;

/// A standalone cache node: one connection manager serving until ctrl-c.
pub struct CacheNode {
    config: Arc<ServerConfig>,
}

impl CacheNode {
    pub fn new(config: ServerConfig) -> Self {
        CacheNode {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn start<X: CommandExecutor>(
        &self,
        rt: &Runtime,
        executor: Arc<X>,
        kind: SessionKind,
    ) -> AppResult<()> {
        rt.block_on(async {
            let manager = ConnectionManager::start(&self.config, executor, kind).await?;
            signal::ctrl_c().await?;
            info!("get shutdown signal");
            manager.stop().await
        })?;
        info!("cache node shutdown complete");
        Ok(())
    }
}
