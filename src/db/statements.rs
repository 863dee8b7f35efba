//! Named registry of prepared statements.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;

use tracing::debug;

use crate::error::{Error, Result};

/// Statements compiled once at construction and looked up by name.
///
/// Immutable after [`PreparedStatements::prepare`] returns, so it can be
/// shared freely across tasks.
#[derive(Debug)]
pub struct PreparedStatements<S> {
    statements: HashMap<&'static str, S>,
}

impl<S> PreparedStatements<S> {
    /// Compile every `(name, sql)` pair with `prepare_one`.
    ///
    /// Stops at the first failure, reporting the statement name.
    pub async fn prepare<F, Fut, E>(
        queries: &[(&'static str, &'static str)],
        mut prepare_one: F,
    ) -> Result<Self>
    where
        F: FnMut(&'static str) -> Fut,
        Fut: Future<Output = std::result::Result<S, E>>,
        E: Display,
    {
        let mut statements = HashMap::with_capacity(queries.len());
        for &(name, sql) in queries {
            let statement = prepare_one(sql).await.map_err(|e| Error::Preparation {
                statement: name.to_string(),
                reason: e.to_string(),
            })?;
            debug!(statement = name, "prepared statement");
            statements.insert(name, statement);
        }
        Ok(Self { statements })
    }

    pub fn get(&self, name: &str) -> Result<&S> {
        self.statements
            .get(name)
            .ok_or_else(|| Error::StatementNotPrepared(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
