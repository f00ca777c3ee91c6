use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use funnel_mcp::confirm::ConfirmationRouter;
use funnel_mcp::{
    logger, Config, GatewayServer, LexicalEmbedder, MCPAggregator, SemanticIndex, Settings,
    VectorStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file if present

    let settings = Settings::from_env().unwrap_or_else(|e| {
        eprintln!("funnel-mcp: {e}");
        std::process::exit(2);
    });
    let config = Config::load_profile(&settings.base_dir, &settings.profile).unwrap_or_else(|e| {
        eprintln!("funnel-mcp: {e}");
        std::process::exit(2);
    });
    let _log_guard = logger::init(&settings, &config).unwrap_or_else(|e| {
        eprintln!("funnel-mcp: {e}");
        std::process::exit(2);
    });

    info!(
        profile = %settings.profile,
        mode = ?settings.mode,
        providers = config.servers.len(),
        "funnel-mcp starting"
    );

    let confirm = Arc::new(ConfirmationRouter::with_native_fallback());
    let aggregator = Arc::new(MCPAggregator::new(
        settings.protocol_version.clone(),
        confirm,
    ));
    let index = Arc::new(SemanticIndex::new(
        Arc::new(LexicalEmbedder::default()),
        Some(VectorStore::for_profile(
            &settings.cache_dir(),
            &settings.profile,
        )),
    ));

    // The index follows the catalog in the background; queries work on
    // whatever subset is embedded.
    tokio::spawn(index.clone().run(aggregator.catalog().subscribe()));

    // Providers come up concurrently while the server is already
    // answering initialize and tools/list.
    {
        let aggregator = aggregator.clone();
        let servers = config.servers.clone();
        tokio::spawn(async move {
            aggregator.initialize(&servers).await;
        });
    }

    let server = GatewayServer::new(
        aggregator.clone(),
        index.clone(),
        settings.mode,
        settings.protocol_version.clone(),
    );

    let signal_code = tokio::select! {
        result = server.run() => {
            result?;
            None
        }
        code = shutdown_signal() => Some(code),
    };

    aggregator.close().await;
    index.sync();
    info!("funnel-mcp shut down");

    if let Some(code) = signal_code {
        std::process::exit(code);
    }
    Ok(())
}

/// Wait for a termination signal; the exit code mirrors the signal.
#[cfg(unix)]
async fn shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return 1,
    };
    tokio::select! {
        _ = term.recv() => 128 + libc::SIGTERM,
        result = tokio::signal::ctrl_c() => {
            let _ = result;
            128 + libc::SIGINT
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    130
}
