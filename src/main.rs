//! formstore-check - connectivity check for the formstore session layer.
//!
//! Loads the `DB_*` configuration (optionally from a `.env` file), opens the
//! pool, runs a probe transaction and shuts down cleanly. Exits non-zero if
//! any step fails.

use formstore::config::Config;
use formstore::db::{
    ColumnType, Pool, QueryExecutor, RetryPolicy, RowMapper, RowSchema, Session, SqlxConnector,
};
use formstore::error::{DbError, DbResult};
use formstore::models::Statement;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn check(config: &Config) -> DbResult<()> {
    let settings = config.connection_settings()?;
    let pool_config = config.pool_config()?;
    let query_timeout = config.query_timeout()?;
    info!(
        db_type = %settings.db_type,
        url = %settings.masked_connection_string(),
        min_size = pool_config.min_size,
        max_size = pool_config.max_size,
        "Connecting"
    );

    let connector = SqlxConnector::new(&settings)?;
    let pool = Pool::connect(pool_config, connector).await?;
    let executor = QueryExecutor::with_defaults(query_timeout, RetryPolicy::default());

    let probe = RowMapper::new(RowSchema::new().field("probe", ColumnType::Integer), |r| {
        r.int()
    });
    let mut session = Session::new(&pool, &executor);
    let result = async {
        session.begin().await?;
        let value = session.fetch_one(&Statement::new("SELECT 1"), &probe).await?;
        session.rollback().await?;
        Ok::<_, DbError>(value)
    }
    .await;

    let status = pool.status();
    info!(
        size = status.size,
        idle = status.idle,
        in_use = status.in_use,
        "Pool status"
    );
    pool.shutdown_default().await;

    let value = result?;
    if value != 1 {
        return Err(DbError::internal(format!(
            "probe query returned {} instead of 1",
            value
        )));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let config = Config::parse_args();

    init_tracing(&config);
    info!("Starting formstore-check v{}", env!("CARGO_PKG_VERSION"));

    match check(&config).await {
        Ok(()) => {
            info!("Database reachable");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, suggestion = e.suggestion(), "Database check failed");
            ExitCode::FAILURE
        }
    }
}
