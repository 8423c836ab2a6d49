use args::Args;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args.log_filter);

    let mut config = config::Config::load(args.config.as_deref())?;

    if let Some(listen) = args.listen {
        config.server.listen_address = listen;
    }

    log::info!("Bifrost {}", env!("CARGO_PKG_VERSION"));

    let app = llm::router(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.server.listen_address)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind to {}: {e}", config.server.listen_address))?;

    log::info!("listening on http://{}", listener.local_addr()?);

    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("received shutdown signal, shutting down gracefully...");
                shutdown.cancel();
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {e}"))?;

    Ok(())
}
