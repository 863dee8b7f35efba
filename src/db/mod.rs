//! Database connection pool, migrations, and health check.
//!
//! The pool is shared by the routine repository and its prepared statements.

pub mod routine;
pub mod statements;

use std::str::FromStr as _;

use secrecy::ExposeSecret as _;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

pub use routine::PgRoutineRepository;
pub use statements::PreparedStatements;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        info!(host = %config.host, database = %config.name, "connected to postgres");
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection. Waits for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("postgres pool closed");
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    let ssl_mode = PgSslMode::from_str(&config.ssl_mode)
        .map_err(|e| Error::Config(format!("invalid DATABASE_SSL {:?}: {e}", config.ssl_mode)))?;

    let mut options = PgConnectOptions::new()
        .username(&config.user)
        .password(config.password.expose_secret())
        .database(&config.name)
        .ssl_mode(ssl_mode);

    options = match config.host.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|e| Error::Config(format!("invalid port in DATABASE_HOST: {e}")))?;
            options.host(host).port(port)
        }
        None => options.host(&config.host),
    };

    Ok(options)
}
