// Shoutbox Server

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shoutbox::{
    app_state::AppState,
    config::Config,
    shout_interface::create_app,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shoutbox=info,tower_http=info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize application state
    let app_state = AppState::new(config.clone()).await?;

    let app = create_app(app_state);

    let addr = config.server_address();
    let listener = TcpListener::bind(&addr).await?;
    info!("Shoutbox listening on http://{}", addr);
    info!("  GET    /api/v1/entries?topic=        - Load a feed");
    info!("  POST   /api/v1/entries               - Post an entry");
    info!("  PUT    /api/v1/uploads/content       - Stream the selected image");
    info!("  GET    /uploads/{{path}}               - Uploaded images");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shoutbox stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
