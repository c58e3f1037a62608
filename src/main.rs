//! # Policy Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. Resolve the config path (first argument, `GATEWAY_CONFIG_PATH`, or
//!    `config/gateway.config.yml`) and load it
//! 2. Initialize logging from the `logging` section
//! 3. Compile the first dispatch graph; any configuration error exits non-zero
//! 4. Start the file watcher when `hotReload.enabled`
//! 5. Serve HTTP, and HTTPS when `https` is configured, until Ctrl-C or SIGTERM

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use policy_gateway::core::config::{resolve_config_path, HttpConfig};
use policy_gateway::gateway::server::shutdown_signal;
use policy_gateway::gateway::{
    DispatchGraphBuilder, Dispatcher, FileConfigSource, GatewayServer, HotReloadManager, ServerConfig, SniCertStore,
};
use policy_gateway::observability::{describe_metrics, init_logging};
use policy_gateway::{GatewayConfig, GatewayResult};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed to start");
            eprintln!("policy-gateway: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> GatewayResult<()> {
    let config_path = resolve_config_path();
    let config = GatewayConfig::load_from_file(&config_path).await?;

    init_logging(&config.logging)?;
    describe_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting policy gateway"
    );

    let builder = DispatchGraphBuilder::with_builtin();
    let graph = builder.build(&config, 1)?;
    let dispatcher = Arc::new(Dispatcher::new(graph));

    // dropping the watcher stops file notifications
    let _watcher = if config.hot_reload.enabled {
        let source = FileConfigSource::new(&config_path);
        let (watcher, changes) = source.watch()?;
        let manager = Arc::new(HotReloadManager::new(
            Arc::new(source),
            builder.clone(),
            Arc::clone(&dispatcher),
            config.hot_reload.debounce,
        ));
        manager.spawn_watch(changes);
        Some(watcher)
    } else {
        info!("Hot reload disabled");
        None
    };

    let http = config.http.clone().unwrap_or_else(HttpConfig::default);
    let http_server = GatewayServer::new(Arc::clone(&dispatcher), ServerConfig::from_http(&http)?);

    let https_server = match &config.https {
        Some(https) => {
            let store = SniCertStore::from_config(https)?;
            if store.is_empty() {
                warn!("No TLS certificates loaded; every TLS handshake will be refused");
            }
            let tls = RustlsConfig::from_config(Arc::new(store.into_server_config(https.client_ca.as_deref())?));
            let server = GatewayServer::new(
                Arc::clone(&dispatcher),
                ServerConfig::from_https(https, http.max_body_size)?,
            );
            info!(addr = %server.bind_addr(), client_auth = https.client_ca.is_some(), "HTTPS enabled");
            Some((server, tls))
        }
        None => None,
    };

    info!(addr = %http_server.bind_addr(), "Gateway ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut http_shutdown = shutdown_rx.clone();
    let http_task = http_server.start_with_shutdown(async move {
        let _ = http_shutdown.changed().await;
    });

    let https_task = async move {
        let Some((server, tls)) = https_server else {
            return Ok(());
        };
        let handle = Handle::new();
        let on_signal = handle.clone();
        let mut https_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let _ = https_shutdown.changed().await;
            on_signal.graceful_shutdown(Some(Duration::from_secs(10)));
        });
        server.serve_tls(tls, handle).await
    };

    tokio::try_join!(http_task, https_task)?;
    Ok(())
}
