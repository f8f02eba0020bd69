//! Connection, transaction and session-provider traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::value::QueryResult;
use crate::error::{Error, Result};

/// A logical database session.
///
/// Session-scoped state such as the current database belongs to exactly one
/// `Connection`; callers that run jobs concurrently acquire one session per
/// job from a [`ConnectionProvider`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a query and return all rows
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Start a transaction on this session
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Switch the session's current database
    async fn use_database(&self, database: &str) -> Result<()>;

    /// Cheap round trip used for liveness checks
    async fn ping(&self) -> Result<()>;

    /// Server version string, e.g. "8.0.36"
    fn server_version(&self) -> String;

    /// Server product, e.g. "mysql" or "mariadb"
    fn server_type(&self) -> String;
}

/// An open transaction. Dropping it without commit leaves the outcome to the
/// driver; callers always finish with [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback).
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Hands out independent sessions against one server.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a dedicated session. Two calls never return the same session.
    async fn acquire(&self) -> Result<Arc<dyn Connection>>;
}

/// Run a bounded liveness check against a session.
pub async fn check_liveness(conn: &dyn Connection, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, conn.ping()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { timeout }),
    }
}
