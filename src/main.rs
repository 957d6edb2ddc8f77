use parlor_server::{echo, RoomTypes, ServerConfig};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting parlor server");

    let types = RoomTypes::new()
        .register(echo::TYPE, echo::factory)
        .expect("Failed to register room types");

    let server = parlor_server::start(ServerConfig::default(), types)
        .await
        .expect("Failed to start server");
    tracing::info!(port = server.port(), "Parlor server running");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutting down");
}
