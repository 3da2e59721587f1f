#![forbid(unsafe_code)]

use quarry_gateway::{
    ApiGateway, AppState, Authenticator, GatewayConfig, LocalSubscriptionStore, SchemaCompiler,
    SubscriptionServer, WsHub, router,
};
use quarry_orchestrator::observability::{LogFormat, init_logging};
use quarry_orchestrator::{
    QueryCache, QueryCacheOptions, QueryHandlers, QueryQueue, QueueConfig, SqlQueryHandler,
    SqliteWarehouse, Worker,
};
use quarry_storage::{SqliteCacheDriver, SqliteQueueDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn usage() -> &'static str {
    "quarry_gateway: HTTP and WebSocket query API over the shared queue\n\n\
USAGE:\n\
  quarry_gateway --schema PATH --warehouse PATH [--listen HOST:PORT] [--storage-dir DIR]\n\
                 [--queue NAME] [--base-path PATH] [--env NAME]\n\n\
NOTES:\n\
  - QUARRY_API_SECRET signs and verifies tokens; required when --env production.\n\
  - Outside production, requests without a valid token are served unauthenticated.\n\
  - The gateway runs its own reaper loop; quarry_worker processes may share --storage-dir.\n"
}

fn parse_args() -> Result<GatewayConfig, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut config = GatewayConfig::from_env().map_err(|err| err.to_string())?;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--schema" => {
                i += 1;
                let v = args.get(i).ok_or("--schema requires PATH")?;
                config.schema_path = Some(PathBuf::from(v));
            }
            "--warehouse" => {
                i += 1;
                let v = args.get(i).ok_or("--warehouse requires PATH")?;
                config.warehouse = Some(PathBuf::from(v));
            }
            "--listen" => {
                i += 1;
                let v = args.get(i).ok_or("--listen requires HOST:PORT")?;
                config.listen = v.parse().map_err(|_| "--listen must be HOST:PORT")?;
            }
            "--storage-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--storage-dir requires DIR")?;
                config.storage_dir = PathBuf::from(v);
            }
            "--queue" => {
                i += 1;
                let v = args.get(i).ok_or("--queue requires NAME")?;
                config.queue = v.to_string();
            }
            "--base-path" => {
                i += 1;
                let v = args.get(i).ok_or("--base-path requires PATH")?;
                config.base_path = v.to_string();
            }
            "--env" => {
                i += 1;
                let v = args.get(i).ok_or("--env requires NAME")?;
                config.environment = v.to_string();
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if config.schema_path.is_none() {
        return Err("--schema (or QUARRY_SCHEMA) is required".to_string());
    }
    if config.warehouse.is_none() {
        return Err("--warehouse (or QUARRY_WAREHOUSE) is required".to_string());
    }
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    init_logging(LogFormat::from_env());

    let config = match parse_args() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "quarry_gateway failed");
        std::process::exit(1);
    }
}

async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.api_secret.is_none() {
        warn!("QUARRY_API_SECRET is not set, using the development secret");
    }

    let queue_config = QueueConfig::from_env()?;
    let driver = SqliteQueueDriver::open(
        &config.storage_dir,
        queue_config.driver_options(&config.queue),
    )?;
    let warehouse = config.warehouse.clone().ok_or("warehouse path is required")?;
    let mut handlers = QueryHandlers::new();
    handlers.insert(
        SqlQueryHandler::NAME.to_string(),
        Arc::new(SqlQueryHandler::new(Arc::new(SqliteWarehouse::new(
            warehouse,
        )))),
    );
    let queue = QueryQueue::new(&config.queue, Arc::new(driver), queue_config, handlers)?;
    let cache = QueryCache::new(
        config.queue.clone(),
        queue.clone(),
        Arc::new(SqliteCacheDriver::open(&config.storage_dir)?),
        QueryCacheOptions::default(),
    );

    let schema_path = config.schema_path.clone().ok_or("schema path is required")?;
    let compiler = Arc::new(SchemaCompiler::from_file(&schema_path)?);
    let gateway = ApiGateway::new(
        config.base_path.clone(),
        Authenticator::new(config.secret(), config.is_production()),
        compiler.clone(),
        compiler,
        cache,
    );

    let hub = Arc::new(WsHub::new());
    let store = Arc::new(LocalSubscriptionStore::new(
        config.subscription_heart_beat_interval,
    ));
    let subscriptions = SubscriptionServer::new(gateway.clone(), store, hub.clone());
    let app = router(AppState {
        gateway,
        subscriptions: subscriptions.clone(),
        hub,
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    let worker = tokio::spawn(Worker::new(queue).run(shutdown.clone()));
    let ticks = {
        let token = shutdown.clone();
        let tick = config.subscription_tick;
        tokio::spawn(async move { subscriptions.run_ticks(tick, token).await })
    };

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(
        listen = %config.listen,
        base_path = %config.base_path,
        production = config.is_production(),
        "Gateway listening"
    );
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.cancel();
    worker.await?;
    ticks.await?;
    Ok(())
}
