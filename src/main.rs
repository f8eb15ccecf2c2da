//! # jumpgate
//!
//! Connection fabric for a bastion host.
//!
//! jumpgate lets authenticated users open recorded, policy-enforced sessions
//! to inventory assets (SSH, Telnet, Redis/MySQL/PostgreSQL/MongoDB CLIs, RDP
//! and VNC through guacd) from a browser over WebSocket or from a native SSH
//! client. Assets behind SSH jump hosts are reached through pooled gateway
//! tunnels.
//!
//! ## API surface
//!
//! | Method | Path                                        | Auth  | Description                 |
//! |--------|---------------------------------------------|-------|-----------------------------|
//! | GET    | `/api/health`                               | No    | Liveness check              |
//! | GET    | `/connect/{asset}/{account}/{protocol}`     | Yes   | WebSocket session           |
//! | GET    | `/connect/monitor/{session_id}`             | Admin | Read-only WebSocket attach  |
//! | GET    | `/connect/share/{share_id}`                 | Link  | WebSocket session via share |
//! | POST   | `/connect/close/{session_id}`               | Admin | End a live session          |
//! | GET    | `/connect/sessions`                         | Admin | Online sessions             |
//!
//! Authentication is the signed `session` cookie or a `_key`/`_secret`
//! query pair.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, startup recovery, graceful shutdown
//! config.rs      — TOML + env-var configuration
//! auth.rs        — cookie / API-key authentication middleware
//! routes/        — HTTP and WebSocket handlers
//! connect/       — Orchestrator: admission, control loop, teardown, monitor
//! protocols/     — ssh, telnet, db and guacd adapters
//! sessions/      — Session aggregate, pipes, client transports, registry
//! terminal/      — ANSI parser, command audit, forbidden commands
//! guacd/         — Guacamole instruction codec and handshake
//! tunnel/        — gateway client pool and per-session tunnels
//! ssh/           — outbound SSH client helpers
//! sshd/          — SSH server front-end
//! recorder.rs    — asciinema v2 recorder
//! storage/       — replay Provider (local filesystem)
//! store/         — Store / AccessControl, TOML inventory, audit journal
//! schedule.rs    — connectable sweep, settings refresh, replay retention
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use jumpgate::auth::Authenticator;
use jumpgate::config::Config;
use jumpgate::connect::{Orchestrator, ReplayOptions, SettingsHandle};
use jumpgate::protocols::AdapterOptions;
use jumpgate::ssh::{AcceptAnyHostKey, ConnectOptions};
use jumpgate::storage::{LocalProvider, Provider};
use jumpgate::store::inventory::InventoryData;
use jumpgate::store::{journal, AccessControl, AuditJournal, Inventory, Store, StoreError};
use jumpgate::tunnel::{SshGatewayDialer, TunnelManager};
use jumpgate::{routes, schedule, sshd, AppState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bastion connection fabric.
#[derive(Parser)]
#[command(name = "jumpgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server and SSH front-end (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => {
            // No subcommand, but --config may still be passed
            let args: Vec<String> = std::env::args().collect();
            args.windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone())
        }
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("jumpgate: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run_server(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn load_inventory(path: &Path) -> Result<InventoryData, StoreError> {
    match InventoryData::load(path).await {
        Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Inventory {} not found, starting empty", path.display());
            Ok(InventoryData::default())
        }
        other => other,
    }
}

/// Mark every session the journal still shows online as closed now.
async fn recover_sessions(audit_dir: &Path, store: &dyn Store) {
    let now = Utc::now();
    for mut record in journal::recover_online(audit_dir).await {
        record.mark_offline(now);
        if let Err(e) = store.upsert_session(&record).await {
            warn!("Session {} recovery failed: {e}", record.session_id);
        } else {
            info!("Session {} marked offline after restart", record.session_id);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn Error>> {
    info!("jumpgate v{} starting", env!("CARGO_PKG_VERSION"));

    if config.auth.secret_key == "change-me" {
        warn!("Using default secret key — set JUMPGATE_SECRET_KEY or update config");
    }

    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;
    let audit_dir = data_dir.join("audit");

    let data = load_inventory(Path::new(&config.inventory.path)).await?;
    let inventory = Arc::new(
        Inventory::new(data, config.settings.clone(), config.auth.api_keys.clone())
            .with_journal(AuditJournal::open(&audit_dir).await?),
    );
    let store: Arc<dyn Store> = Arc::clone(&inventory) as Arc<dyn Store>;
    let acl: Arc<dyn AccessControl> = Arc::clone(&inventory) as Arc<dyn AccessControl>;
    recover_sessions(&audit_dir, store.as_ref()).await;

    let ssh_options = ConnectOptions {
        dial_timeout: Duration::from_secs(config.ssh.dial_timeout_secs),
        handshake_timeout: Duration::from_secs(config.ssh.handshake_timeout_secs),
        keepalive: (config.ssh.keepalive_secs > 0)
            .then(|| Duration::from_secs(config.ssh.keepalive_secs)),
        verifier: Arc::new(AcceptAnyHostKey),
    };
    let tunnels = Arc::new(TunnelManager::new(Arc::new(SshGatewayDialer::new(
        ssh_options.clone(),
    ))));

    let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new(config.replay_dir()).await?);
    info!(
        "Replays: {} provider, {} layout",
        provider.kind(),
        config.replay.path_strategy
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::clone(&acl),
        Arc::clone(&tunnels),
        SettingsHandle::new(config.settings.clone()),
        ReplayOptions {
            staging: data_dir.join("recording"),
            provider,
            strategy: config.replay.path_strategy,
        },
        AdapterOptions {
            ssh: ssh_options,
            telnet: config.telnet.clone(),
            guacd_host: config.guacd.host.clone(),
            guacd_port: config.guacd.port,
        },
        config.parser.scrub_markers.clone(),
    ));

    let auth = Arc::new(Authenticator::new(&config.auth, acl));
    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        orchestrator: Arc::clone(&orchestrator),
        auth,
    };
    let config = Arc::clone(&state.config);

    let app = routes::router(state)
        .layer(ConcurrencyLimitLayer::new(config.server.max_connections))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    // SSH front-end
    let stop = CancellationToken::new();
    let sshd_task = if config.ssh.enabled {
        let host_key = sshd::load_or_generate_host_key(&config.host_key_path()).await?;
        let ssh_listener = TcpListener::bind(&config.ssh.listen).await?;
        let orch = Arc::clone(&orchestrator);
        let stop = stop.clone();
        let dpi = config.server.default_dpi;
        Some(tokio::spawn(async move {
            if let Err(e) = sshd::serve(ssh_listener, host_key, orch, dpi, stop).await {
                error!("SSH front-end failed: {e}");
            }
        }))
    } else {
        None
    };

    let periodic = schedule::spawn(&orchestrator, &config.schedule, config.replay.retention_days);

    info!("Server ready");

    let orch = Arc::clone(&orchestrator);
    let shutdown = async move {
        shutdown_signal().await;
        let n = orch.registry().close_all();
        info!("Closing {n} online sessions");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    // Cleanup
    info!("Shutting down...");
    stop.cancel();
    for task in periodic {
        task.abort();
    }
    let closed = orchestrator.close_all(SHUTDOWN_GRACE).await;
    if !orchestrator.registry().is_empty() {
        warn!(
            "{} sessions still tearing down after {SHUTDOWN_GRACE:?}",
            orchestrator.registry().len()
        );
    }
    if let Some(task) = sshd_task {
        let _ = task.await;
    }
    tunnels.shutdown().await;
    info!("Goodbye ({closed} sessions closed at exit)");
    Ok(())
}
