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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::WorkerPoolConfig;

use super::{AppError, AppResult};

/// Default listen backlog.
pub const DEFAULT_MAX_PENDING_CONNECTIONS: u32 = 100;
/// Default response fragment size, 80 KiB.
pub const DEFAULT_RESPONSE_FRAGMENT_SIZE: usize = 80 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// listen backlog
    pub max_pending_connections: u32,
    /// concurrently served sessions
    pub max_connections: usize,
    /// per-session socket send buffer, 0 keeps the OS default
    pub send_buffer_size: u32,
    /// per-session socket receive buffer, 0 keeps the OS default
    pub recv_buffer_size: u32,
    pub max_package_size: usize,
    pub response_fragment_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9800,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            max_connections: 10_000,
            send_buffer_size: 0,
            recv_buffer_size: 0,
            max_package_size: 64 * 1024 * 1024,
            response_fragment_size: DEFAULT_RESPONSE_FRAGMENT_SIZE,
        }
    }
}

/// Slow/idle client detection. Off unless explicitly enabled with a positive timeout.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IdleClientConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for IdleClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 0,
            sweep_interval_ms: 5000,
        }
    }
}

impl IdleClientConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && self.timeout_ms > 0
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchPoolConfig {
    pub channel_capacity: usize,
    /// 0 sizes the pool to the available parallelism
    pub num_channels: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for DispatchPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval_ms: 5000,
            worker_check_timeout_ms: 200,
        }
    }
}

impl DispatchPoolConfig {
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let num_channels = if self.num_channels == 0 {
            num_cpus::get()
        } else {
            self.num_channels
        };
        WorkerPoolConfig {
            channel_capacity: self.channel_capacity,
            num_channels,
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            worker_check_timeout: Duration::from_millis(self.worker_check_timeout_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventQueueConfig {
    pub capacity: usize,
    /// how often buffered per-client events are flushed
    pub bulk_interval_ms: u64,
    /// buffered events per client, 0 = unbounded
    pub bulk_buffer_capacity: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256 * 1024,
            bulk_interval_ms: 500,
            bulk_buffer_capacity: 4096,
        }
    }
}

impl EventQueueConfig {
    pub fn bulk_interval(&self) -> Duration {
        Duration::from_millis(self.bulk_interval_ms)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// pending response ceiling per session, 0 = unbounded
    pub max_pending_response_bytes: usize,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub idle_client: IdleClientConfig,
    pub dispatch_pool: DispatchPoolConfig,
    pub event_queue: EventQueueConfig,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Loads the config file, then applies `CACHEWIRE__SECTION__KEY` environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("CACHEWIRE").separator("__"))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Rejects values the server cannot start with.
    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_pending_connections == 0 {
            return Err(AppError::Capacity(
                "network.max_pending_connections must be positive".into(),
            ));
        }
        if network.max_connections == 0 {
            return Err(AppError::Capacity(
                "network.max_connections must be positive".into(),
            ));
        }
        if network.response_fragment_size == 0 {
            return Err(AppError::Capacity(
                "network.response_fragment_size must be positive".into(),
            ));
        }
        if network.max_package_size == 0 || network.max_package_size > i32::MAX as usize {
            return Err(AppError::Capacity(format!(
                "network.max_package_size {} out of range",
                network.max_package_size
            )));
        }
        if self.idle_client.enabled && self.idle_client.timeout_ms == 0 {
            return Err(AppError::Capacity(
                "idle_client.timeout_ms must be positive when detection is enabled".into(),
            ));
        }
        if self.idle_client.sweep_interval_ms == 0 {
            return Err(AppError::Capacity(
                "idle_client.sweep_interval_ms must be positive".into(),
            ));
        }
        if self.dispatch_pool.channel_capacity == 0 {
            return Err(AppError::Capacity(
                "dispatch_pool.channel_capacity must be positive".into(),
            ));
        }
        if self.dispatch_pool.monitor_interval_ms == 0 {
            return Err(AppError::Capacity(
                "dispatch_pool.monitor_interval_ms must be positive".into(),
            ));
        }
        if self.event_queue.capacity == 0 {
            return Err(AppError::Capacity(
                "event_queue.capacity must be positive".into(),
            ));
        }
        if self.event_queue.bulk_interval_ms == 0 {
            return Err(AppError::Capacity(
                "event_queue.bulk_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
