use queuekeeper::config::KeeperConfig;
use queuekeeper::worker::StopOptions;
use queuekeeper::QueueKeeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = KeeperConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    eprintln!("queuekeeper v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Schema: {}", config.schema);
    eprintln!(
        "   Supervisor: {}",
        if config.supervise { "enabled" } else { "disabled" }
    );
    eprintln!(
        "   Timekeeper: {}",
        if config.schedule { "enabled" } else { "disabled" }
    );

    let keeper = QueueKeeper::open(config).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open job store: {}", e);
        std::process::exit(1);
    });

    keeper.start().await?;
    let queues = keeper.get_queues(None).await?;
    eprintln!("   Queues: {}", queues.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    keeper.stop(StopOptions::default()).await;
    Ok(())
}
