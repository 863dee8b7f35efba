//! Postgres-backed routine repository.

use async_trait::async_trait;
use sqlx::postgres::PgStatement;
use sqlx::{Executor as _, PgPool, Statement as _};
use tracing::debug;

use super::Db;
use super::statements::PreparedStatements;
use crate::error::Result;
use crate::model::RoutineEvent;
use crate::processor::RoutineRepository;

pub const CREATE_ROUTINE: &str = "create routine";

const QUERIES: &[(&str, &str)] = &[(
    CREATE_ROUTINE,
    "INSERT INTO device_routines \
     (id, device_id, status, context, area, diagnostics, dispatched_at, created_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
)];

/// Writes routine records through statements prepared at construction.
pub struct PgRoutineRepository {
    pool: PgPool,
    statements: PreparedStatements<PgStatement<'static>>,
}

impl PgRoutineRepository {
    /// Prepare every statement up front. A failure here is fatal for the
    /// caller; nothing is stored through a half-prepared repository.
    pub async fn new(db: &Db) -> Result<Self> {
        let pool = db.pool().clone();
        let statements = PreparedStatements::prepare(QUERIES, |sql| {
            let pool = pool.clone();
            async move { (&pool).prepare(sql).await }
        })
        .await?;

        Ok(Self { pool, statements })
    }
}

#[async_trait]
impl RoutineRepository for PgRoutineRepository {
    async fn store(&self, routine: RoutineEvent) -> Result<()> {
        let statement = self.statements.get(CREATE_ROUTINE)?;
        let id = routine.id;
        debug!(routine_id = %id, device_id = %routine.device_id, "storing routine");

        statement
            .query()
            .bind(id)
            .bind(routine.device_id)
            .bind(routine.status.to_string())
            .bind(routine.context)
            .bind(routine.area)
            .bind(routine.diagnostics)
            .bind(routine.dispatched_at)
            .bind(routine.created_at)
            .execute(&self.pool)
            .await?;

        debug!(routine_id = %id, "routine stored");
        Ok(())
    }
}
