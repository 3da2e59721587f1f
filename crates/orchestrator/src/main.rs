#![forbid(unsafe_code)]

use quarry_orchestrator::observability::{LogFormat, init_logging};
use quarry_orchestrator::{
    QueryHandlers, QueryQueue, QueueConfig, SqlQueryHandler, SqliteWarehouse, Worker, env_var,
};
use quarry_storage::SqliteQueueDriver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug)]
struct WorkerArgs {
    storage_dir: PathBuf,
    warehouse: PathBuf,
    queue: String,
    poll_ms: Option<u64>,
    concurrency: Option<usize>,
    once: bool,
}

fn usage() -> &'static str {
    "quarry_worker: lease and execute queued warehouse queries\n\n\
USAGE:\n\
  quarry_worker --warehouse PATH [--storage-dir DIR] [--queue NAME]\n\
                [--concurrency N] [--poll-ms MS] [--once]\n\n\
NOTES:\n\
  - Any number of workers may share one --storage-dir; leases are coordinated in the store.\n\
  - Queue timeouts come from QUARRY_* environment variables (see QueueConfig::from_env).\n\
  - `--once` runs a single reap + reconcile pass and waits for dispatched work.\n"
}

fn parse_args() -> Result<WorkerArgs, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut storage_dir = env_var("QUARRY_STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".quarry"));
    let mut warehouse: Option<PathBuf> = env_var("QUARRY_WAREHOUSE").map(PathBuf::from);
    let mut queue = env_var("QUARRY_QUEUE").unwrap_or_else(|| "default".to_string());
    let mut poll_ms: Option<u64> = env_var("QUARRY_POLL_MS").and_then(|v| v.parse().ok());
    let mut concurrency: Option<usize> = None;
    let mut once = false;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--storage-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--storage-dir requires DIR")?;
                storage_dir = PathBuf::from(v);
            }
            "--warehouse" => {
                i += 1;
                let v = args.get(i).ok_or("--warehouse requires PATH")?;
                warehouse = Some(PathBuf::from(v));
            }
            "--queue" => {
                i += 1;
                let v = args.get(i).ok_or("--queue requires NAME")?;
                queue = v.to_string();
            }
            "--poll-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--poll-ms requires MS")?;
                poll_ms = Some(v.parse().map_err(|_| "--poll-ms must be a number")?);
            }
            "--concurrency" => {
                i += 1;
                let v = args.get(i).ok_or("--concurrency requires N")?;
                concurrency = Some(v.parse().map_err(|_| "--concurrency must be a number")?);
            }
            "--once" => once = true,
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let warehouse = warehouse.ok_or("--warehouse (or QUARRY_WAREHOUSE) is required")?;
    Ok(WorkerArgs {
        storage_dir,
        warehouse,
        queue,
        poll_ms,
        concurrency,
        once,
    })
}

#[tokio::main]
async fn main() {
    init_logging(LogFormat::from_env());

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    if let Err(err) = run(args).await {
        error!(error = %err, "quarry_worker failed");
        std::process::exit(1);
    }
}

async fn run(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = QueueConfig::from_env()?;
    if let Some(poll_ms) = args.poll_ms {
        config.poll_interval = Duration::from_millis(poll_ms.max(10));
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;

    let driver = SqliteQueueDriver::open(&args.storage_dir, config.driver_options(&args.queue))?;
    let mut handlers = QueryHandlers::new();
    handlers.insert(
        SqlQueryHandler::NAME.to_string(),
        Arc::new(SqlQueryHandler::new(Arc::new(SqliteWarehouse::new(
            &args.warehouse,
        )))),
    );
    let queue = QueryQueue::new(&args.queue, Arc::new(driver), config, handlers)?;
    let worker = Worker::new(queue.clone());

    if args.once {
        worker.tick().await;
        while !queue.get_queries().await?.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            worker.tick().await;
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });
    worker.run(shutdown).await;
    Ok(())
}
