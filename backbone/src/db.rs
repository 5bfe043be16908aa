use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use tracing::info;

use crate::config::DatabaseSettings;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the Postgres pool described by `settings`.
///
/// The pool connects lazily, so an unreachable database shows up on the
/// first acquisition (and goes through the transaction retry loop) rather
/// than at startup.
pub fn build_pool(settings: &DatabaseSettings) -> PgPool {
    let options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .database(&settings.database)
        .username(&settings.username)
        .password(&settings.password);

    let options = if settings.log_statements {
        options.log_statements(log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    info!(
        host = %settings.host,
        database = %settings.database,
        min = settings.pool_min,
        max = settings.pool_max,
        "configuring postgres pool"
    );

    PgPoolOptions::new()
        .min_connections(settings.pool_min)
        .max_connections(settings.pool_max)
        .idle_timeout(IDLE_TIMEOUT)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy_with(options)
}
