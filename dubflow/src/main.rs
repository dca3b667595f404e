use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dubflow::config::AppConfig;
use dubflow::database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dubflow=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    tracing::info!("dubflow initialized successfully");

    Ok(())
}
