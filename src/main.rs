use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sandbox_exec::config::CliArgs;
use sandbox_exec::env::{create_cgroup_pool, create_environment_pool};
use sandbox_exec::filestore::{FileStore, LocalFileStore, MemoryFileStore, TimeoutFileStore};
use sandbox_exec::worker::{Request, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().expect("Failed to load configuration");
    if config.parallelism == 0 {
        panic!("The number of worker loops must not be 0");
    }

    let request: Request = {
        let mut raw = String::new();
        match &cli.request_path {
            Some(path) => raw = std::fs::read_to_string(path)?,
            None => {
                std::io::stdin().read_to_string(&mut raw)?;
            }
        }
        serde_json::from_str(&raw)?
    };

    let shutdown_token = CancellationToken::new();
    let mut file_store: Arc<dyn FileStore> = match &config.file_store_dir {
        Some(dir) => Arc::new(LocalFileStore::new(dir)?),
        None => Arc::new(MemoryFileStore::new()),
    };
    if let Some(timeout) = config.file_timeout {
        let store = TimeoutFileStore::new(file_store, timeout.as_duration());
        store.spawn_cleanup(shutdown_token.clone());
        file_store = store;
    }

    let cgroups = create_cgroup_pool(&config).expect("Failed to initialize cgroup");
    let env_pool = Arc::new(create_environment_pool(&config, cgroups.clone()));

    let worker = Worker::new(WorkerConfig::new(&config, file_store, env_pool));
    worker.start();

    // ======= PREPARATION END, EXECUTION START =======

    let request_ctx = shutdown_token.child_token();
    let response = tokio::select! {
        response = worker.submit(request_ctx.clone(), request) => Some(response),
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            None
        }
    };

    if let Some(response) = response {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    shutdown_token.cancel();
    tokio::time::timeout(Duration::from_secs(30), worker.shutdown())
        .await
        .unwrap_or_else(|_| log::error!("Worker did not shut down in time"));
    if let Some(cgroups) = cgroups {
        cgroups.shutdown();
    }

    log::info!("Shutdown complete");
    Ok(())
}
