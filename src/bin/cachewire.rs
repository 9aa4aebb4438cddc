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

use std::path::PathBuf;
use std::sync::Arc;

use cachewire::network::SessionKind;
use cachewire::request::LoopbackExecutor;
use cachewire::{setup_tracing, AppResult, CacheNode, ServerConfig};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tokio::runtime;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    /// kind of clients served on this port
    #[arg(long, value_enum, default_value_t = ClientKind::Host)]
    pub kind: ClientKind,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ClientKind {
    Host,
    Management,
    Service,
}

impl From<ClientKind> for SessionKind {
    fn from(kind: ClientKind) -> Self {
        match kind {
            ClientKind::Host => SessionKind::HostClient,
            ClientKind::Management => SessionKind::Management,
            ClientKind::Service => SessionKind::ServiceClient,
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };
        if let Some(level) = level {
            std::env::set_var("RUST_LOG", level);
        }
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = {
        let _enter = rt.enter();
        setup_tracing(&commandline.log_dir)?
    };

    let node = CacheNode::new(server_config);
    node.start(
        &rt,
        Arc::new(LoopbackExecutor::default()),
        commandline.kind.into(),
    )?;

    Ok(())
}
