//! Transactional statement batches.
//!
//! Statements are grouped into batches, each executed inside one
//! transaction. A failing statement rolls back its whole batch; the job's
//! [`ErrorPolicy`] then decides whether to record the failure and carry on
//! with the next batch or to abort.

use std::fmt;
use std::sync::Arc;

use dbkit_core::driver::Connection;
use tracing::{debug, warn};

use crate::error::{BackupError, ExecutionError, Result};
use crate::tokenizer::Statement;

/// Statements per batch for small sources
pub const SMALL_BATCH_SIZE: usize = 100;

/// Statements per batch for sources of at least [`LARGE_SOURCE_BYTES`]
pub const LARGE_BATCH_SIZE: usize = 500;

pub const LARGE_SOURCE_BYTES: u64 = 10 * 1024 * 1024;

/// Chooses the batch size once per job from the source size.
pub fn batch_size_for(total: Option<u64>) -> usize {
    match total {
        Some(n) if n >= LARGE_SOURCE_BYTES => LARGE_BATCH_SIZE,
        _ => SMALL_BATCH_SIZE,
    }
}

/// What to do after a batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Record the error and move on to the next batch
    Continue,
    /// Stop the job and return the error
    Abort,
}

/// Per-job decision function for failed batches. Defaults to abort.
#[derive(Clone)]
pub struct ErrorPolicy(Arc<dyn Fn(&ExecutionError) -> ErrorAction + Send + Sync>);

impl ErrorPolicy {
    pub fn abort() -> Self {
        Self(Arc::new(|_| ErrorAction::Abort))
    }

    pub fn continue_on_error() -> Self {
        Self(Arc::new(|_| ErrorAction::Continue))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ExecutionError) -> ErrorAction + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn decide(&self, error: &ExecutionError) -> ErrorAction {
        (self.0)(error)
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::abort()
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPolicy(..)")
    }
}

/// Totals reported by [`BatchExecutor::finish`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    /// Statements in committed batches
    pub statements_executed: u64,
    pub batches_committed: u64,
    /// Failures the policy chose to continue past
    pub errors: Vec<ExecutionError>,
}

/// Groups statements and executes each group in a transaction.
pub struct BatchExecutor<'a> {
    conn: &'a dyn Connection,
    database: String,
    batch_size: usize,
    policy: ErrorPolicy,
    pending: Vec<Statement>,
    summary: BatchSummary,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(
        conn: &'a dyn Connection,
        database: impl Into<String>,
        batch_size: usize,
        policy: ErrorPolicy,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            conn,
            database: database.into(),
            batch_size,
            policy,
            pending: Vec::with_capacity(batch_size),
            summary: BatchSummary::default(),
        }
    }

    /// Queues a statement, flushing when the batch is full.
    pub async fn push(&mut self, statement: Statement) -> Result<()> {
        self.pending.push(statement);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Executes the queued statements as one transaction.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);

        match self.run_batch(&batch).await? {
            None => {
                self.summary.statements_executed += batch.len() as u64;
                self.summary.batches_committed += 1;
                debug!(
                    "Committed batch of {} statements on {}",
                    batch.len(),
                    self.database
                );
                Ok(())
            }
            Some(error) => match self.policy.decide(&error) {
                ErrorAction::Continue => {
                    warn!("Batch rolled back, continuing: {}", error);
                    self.summary.errors.push(error);
                    Ok(())
                }
                ErrorAction::Abort => Err(BackupError::Execution(error)),
            },
        }
    }

    /// Statements committed so far
    pub fn statements_executed(&self) -> u64 {
        self.summary.statements_executed
    }

    /// Flushes the final partial batch and returns the totals.
    pub async fn finish(mut self) -> Result<BatchSummary> {
        self.flush().await?;
        Ok(self.summary)
    }

    /// Runs one batch. `Ok(Some(_))` means the batch failed and was rolled
    /// back; `Err` means the transaction could not even be opened.
    async fn run_batch(&self, batch: &[Statement]) -> Result<Option<ExecutionError>> {
        let mut tx = self.conn.begin_transaction().await?;

        for statement in batch {
            if let Err(e) = tx.execute(&statement.sql).await {
                let error = ExecutionError::new(
                    &self.database,
                    statement.end_offset,
                    &statement.sql,
                    e.to_string(),
                );
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback on {} failed: {}", self.database, rollback);
                }
                return Ok(Some(error));
            }
        }

        if let Err(e) = tx.commit().await {
            let offset = batch.last().map_or(0, |s| s.end_offset);
            return Ok(Some(ExecutionError::new(
                &self.database,
                offset,
                "COMMIT",
                e.to_string(),
            )));
        }
        Ok(None)
    }
}
