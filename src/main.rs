use bjj_journal::api::init_rocket;
use bjj_journal::config::AppConfig;
use bjj_journal::database::{CURRENT_SCHEMA, migrate_database_declaratively};
use bjj_journal::db::clean_expired_sessions;
use bjj_journal::env::load_environment;
use bjj_journal::error::AppError;
use bjj_journal::telemetry::init_tracing;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Rocket(Box<rocket::Error>),
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

impl From<rocket::Error> for Error {
    fn from(value: rocket::Error) -> Self {
        Error::Rocket(Box::new(value))
    }
}

#[rocket::main]
async fn main() -> Result<(), Error> {
    if let Err(err) = load_environment() {
        eprintln!("Failed to load environment files: {}", err);
    }
    let _telemetry = init_tracing();

    let config = AppConfig::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    info!("Running database migrations...");
    match migrate_database_declaratively(
        pool.clone(),
        CURRENT_SCHEMA,
        config.allow_destructive_migrations,
    )
    .await
    {
        Ok(count) => info!(count, "Migrations completed successfully"),
        Err(e) => {
            error!("Failed to run migrations: {}", e);
            return Err(e.into());
        }
    }

    let pool_clone = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        loop {
            match clean_expired_sessions(&pool_clone).await {
                Ok(count) if count > 0 => info!("Cleaned up {} expired sessions", count),
                Ok(_) => {}
                Err(e) => warn!("Failed to clean expired sessions: {}", e),
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        }
    });

    let _rocket = init_rocket(pool, config).launch().await?;
    Ok(())
}
