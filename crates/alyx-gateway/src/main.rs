use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alyx_bus::EventBus;
use alyx_core::config::{AlyxConfig, DEFAULT_BIND, DEFAULT_PORT};
use alyx_core::Supervisor;
use alyx_executor::{Executor, FunctionIndex};
use alyx_gateway::app;
use alyx_hooks::HookRegistry;
use alyx_manifest::ManifestLoader;
use alyx_scheduler::Scheduler;
use alyx_store::Store;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "alyx", about = "Self-hostable BaaS event core")]
struct Args {
    /// Path to alyx.toml (default: ~/.alyx/alyx.toml, ALYX_CONFIG override)
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Functions root directory
    #[arg(long)]
    functions_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alyx=info,alyx_bus=info,alyx_scheduler=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();

    // load config: explicit flag > ALYX_CONFIG env > ~/.alyx/alyx.toml
    let config_path = args.config.or_else(|| std::env::var("ALYX_CONFIG").ok());
    let mut config = AlyxConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        AlyxConfig::default()
    });
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.functions_dir {
        config.functions.dir = dir;
    }
    // keep the callback URL in step with the actual listen address unless
    // the operator pinned one
    let default_url = format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}");
    if config.executor.alyx_url == default_url {
        config.executor.alyx_url =
            format!("http://{}:{}", config.server.bind, config.server.port);
    }

    let store = Arc::new(Store::open(&config.database.path)?);
    let registry = Arc::new(HookRegistry::new(Arc::clone(&store))?);
    let executor = Arc::new(Executor::new(
        config.executor.clone(),
        config.functions.production,
    ));
    let functions = Arc::new(FunctionIndex::new());
    let bus = Arc::new(EventBus::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&executor),
        Arc::clone(&functions),
        config.bus.clone(),
        config.retention.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.scheduler.clone(),
    ));
    let loader = Arc::new(ManifestLoader::new(
        config.functions.dir.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&functions),
        Arc::clone(&bus),
    ));

    let supervisor = Supervisor::new();
    Arc::clone(&bus).start(&supervisor);
    Arc::clone(&scheduler).start(&supervisor);

    let functions_root = std::path::Path::new(&config.functions.dir);
    if functions_root.is_dir() {
        match loader.load_all() {
            Ok(summary) => {
                info!(
                    loaded = summary.loaded.len(),
                    errors = summary.errors.len(),
                    "functions loaded"
                );
                for (function, reason) in &summary.errors {
                    error!(function = %function, reason = %reason, "manifest rejected");
                }
            }
            Err(e) => error!("initial manifest load failed: {e}"),
        }
        alyx_manifest::start_watcher(
            Arc::clone(&loader),
            &supervisor,
            Duration::from_millis(config.functions.watch_debounce_ms),
        )?;
    } else {
        warn!(
            dir = %config.functions.dir,
            "functions directory does not exist; no functions loaded"
        );
    }

    // periodic purge of expired callback tokens
    {
        let executor = Arc::clone(&executor);
        let token = supervisor.cancellation_token();
        supervisor.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        executor.tokens().purge_expired();
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let state = Arc::new(app::AppState {
        config,
        store,
        registry,
        bus,
        scheduler,
        executor,
        functions,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("alyx listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        })
        .await?;

    // drain dispatchers, scheduler and watcher before exiting
    if let Err(e) = supervisor.shutdown(grace).await {
        warn!("unclean shutdown: {e}");
    }
    Ok(())
}
