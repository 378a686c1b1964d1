use log::{error, info};
use school_vote::config::Config;
use school_vote::db::{Database, VoteStore};
use school_vote::tasks::check_expired_elections_task;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "embedded-postgres")]
async fn start_embedded_postgres(
    config: &mut Config,
) -> Result<postgresql_embedded::PostgreSQL, postgresql_embedded::Error> {
    let mut postgresql = postgresql_embedded::PostgreSQL::default();
    postgresql.setup().await?;
    postgresql.start().await?;
    let database_name = "school_vote";
    if !postgresql.database_exists(database_name).await? {
        postgresql.create_database(database_name).await?;
    }
    config.database_url = postgresql.settings().url(database_name);
    info!("Embedded PostgreSQL running at {}", config.database_url);
    Ok(postgresql)
}

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    #[allow(unused_mut)]
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    #[cfg(feature = "embedded-postgres")]
    let _postgresql = match start_embedded_postgres(&mut config).await {
        Ok(postgresql) => postgresql,
        Err(e) => {
            error!("Failed to start embedded PostgreSQL: {}", e);
            return;
        }
    };

    // Initialize database
    let database: Arc<dyn VoteStore> = match Database::connect(&config).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    info!("Database ready, schema verified.");

    let cancel = CancellationToken::new();
    let closer = tokio::spawn(check_expired_elections_task(
        Arc::clone(&database),
        config.election_check_interval,
        cancel.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    cancel.cancel();
    if let Err(e) = closer.await {
        error!("Expired election task ended abnormally: {}", e);
    }
}
