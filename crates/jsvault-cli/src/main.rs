// Copyright 2025 jsvault Authors
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


use anyhow::{anyhow, Result};
use argh::FromArgs;
use jsvault_cli::admin::AdminClient;
use jsvault_server::folder::MemoryFileStore;
use jsvault_server::runtime::EngineLimits;
use jsvault_server::task::{PoolConfig, RegistryConfig};
use jsvault_server::{Backend, HttpServer, ScriptHost, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// jsvault - serve HTTP handlers and debug sessions from a script tree
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Tasks(TasksArgs),
    StopTask(StopTaskArgs),
}

/// Start the script host
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// script tree laid out as <tenant>/<group>/<path>
    #[argh(option, short = 's')]
    scripts: PathBuf,

    /// where scripts are read from: "store" loads the tree into memory, "fs" reads it on demand
    #[argh(option, default = "String::from(\"store\")")]
    backend: String,

    /// address to listen on
    #[argh(option, short = 'b', default = "String::from(\"127.0.0.1:8080\")")]
    bind: String,

    /// tenant served to HTTP requests
    #[argh(option, default = "String::from(\"default\")")]
    tenant: String,

    /// group served to HTTP requests
    #[argh(option, default = "String::from(\"default\")")]
    group: String,

    /// directory of static files served when no script matches
    #[argh(option)]
    static_dir: Option<PathBuf>,

    /// script engines serving HTTP requests in parallel
    #[argh(option, default = "4")]
    engines: usize,

    /// worker threads shared by background tasks
    #[argh(option, default = "64")]
    max_workers: usize,

    /// jobs that may wait for a worker before submissions are rejected
    #[argh(option, default = "512")]
    queue_capacity: usize,

    /// seconds between task reclamation sweeps
    #[argh(option, default = "3")]
    sweep_interval_secs: u64,

    /// iterations one HTTP handler loop may run before it throws
    #[argh(option)]
    loop_iteration_limit: Option<u64>,
}

/// Print the task registry of a running server
#[derive(FromArgs)]
#[argh(subcommand, name = "tasks")]
struct TasksArgs {
    /// server address (e.g., http://127.0.0.1:8080)
    #[argh(positional)]
    url: String,

    /// print the raw JSON snapshot
    #[argh(switch)]
    json: bool,
}

/// Force-stop a task on a running server
#[derive(FromArgs)]
#[argh(subcommand, name = "stop-task")]
struct StopTaskArgs {
    /// server address (e.g., http://127.0.0.1:8080)
    #[argh(positional)]
    url: String,

    /// task id as listed by `jsvault tasks`
    #[argh(positional)]
    id: String,
}

impl ServeArgs {
    fn config(&self) -> Result<ServerConfig> {
        let mut limits = EngineLimits::new();
        if let Some(limit) = self.loop_iteration_limit {
            limits = limits.with_loop_iteration_limit(limit);
        }

        let mut config = ServerConfig::new()
            .with_bind(self.bind.clone())
            .with_namespace(self.tenant.clone(), self.group.clone())
            .with_engines(self.engines)
            .with_pool(
                PoolConfig::new()
                    .with_max_workers(self.max_workers)
                    .with_queue_capacity(self.queue_capacity),
            )
            .with_registry(
                RegistryConfig::new().with_sweep_interval(Duration::from_secs(self.sweep_interval_secs)),
            )
            .with_limits(limits);
        if let Some(dir) = &self.static_dir {
            config = config.with_static_dir(dir.clone());
        }

        config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }

    fn backend(&self) -> Result<Backend> {
        match self.backend.as_str() {
            "store" => {
                let store = Arc::new(MemoryFileStore::new());
                let loaded = store.load_dir(&self.scripts)?;
                tracing::info!("Loaded {} files from {}", loaded, self.scripts.display());
                Ok(Backend::Store(store))
            }
            "fs" => {
                if !self.scripts.is_dir() {
                    return Err(anyhow!("Script directory not found: {}", self.scripts.display()));
                }
                Ok(Backend::FileSystem(self.scripts.clone()))
            }
            other => Err(anyhow!("Unknown backend '{}': expected \"store\" or \"fs\"", other)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Admin commands print their own output
    let should_init_tracing = matches!(cli.command, Commands::Serve(_));

    if should_init_tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match cli.command {
        Commands::Serve(args) => {
            let config = args.config()?;
            let addr = config.bind_addr().map_err(|e| anyhow!(e))?;
            let backend = args.backend()?;

            tracing::info!(
                "Serving tenant '{}' group '{}' on {}",
                config.tenant,
                config.group,
                addr
            );

            let host = ScriptHost::new(config, backend)?;
            host.start();

            let server = HttpServer::new(&host);
            let result = server
                .run_until(addr, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await;

            tracing::info!("Shutting down");
            host.shutdown().await;
            result?;
        }

        Commands::Tasks(args) => {
            let client = AdminClient::new(&args.url)?;
            let snapshot = client.snapshot().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot.summary_text());
            }
        }

        Commands::StopTask(args) => {
            let client = AdminClient::new(&args.url)?;
            let snapshot = client.stop_task(&args.id).await?;
            println!("Stopped {}", args.id);
            print!("{}", snapshot.summary_text());
        }
    }

    Ok(())
}
