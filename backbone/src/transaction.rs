//! Auto-committing units of work on top of a pooled database connection.
//!
//! [`TransactionRunner::run`] opens exactly one transaction per call, hands
//! it to the caller's work and issues exactly one of commit or rollback
//! before returning.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres};
use tracing::{debug, error, warn};

use crate::error::AppError;

/// An open transaction that can be finished exactly once.
#[async_trait]
pub trait Transactional: Send + Sized {
    /// Commit the transaction. A failed commit must leave the
    /// transaction rolled back.
    async fn commit(self) -> Result<(), sqlx::Error>;
    async fn rollback(self) -> Result<(), sqlx::Error>;
}

/// Anything that can open a [`Transactional`].
#[async_trait]
pub trait TransactionSource: Send + Sync {
    type Tx: Transactional;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error>;
}

#[async_trait]
impl Transactional for sqlx::Transaction<'static, Postgres> {
    async fn commit(self) -> Result<(), sqlx::Error> {
        // dropping an uncommitted sqlx transaction queues its rollback
        sqlx::Transaction::commit(self).await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        sqlx::Transaction::rollback(self).await
    }
}

#[async_trait]
impl TransactionSource for PgPool {
    type Tx = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error> {
        sqlx::Pool::begin(self).await
    }
}

/// Bounded retry with a constant pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(2000),
        }
    }
}

pub struct TransactionRunner<S> {
    source: S,
    policy: RetryPolicy,
}

impl<S: TransactionSource> TransactionRunner<S> {
    pub fn new(source: S) -> Self {
        Self::with_policy(source, RetryPolicy::default())
    }

    pub fn with_policy(source: S, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Open a transaction, retrying failed attempts.
    ///
    /// Attempts are counted from zero; the attempt that fails once the
    /// counter has reached `max_retries` is the last one, so at most
    /// `max_retries + 1` attempts are made.
    pub async fn acquire_transaction(&self) -> Result<S::Tx, AppError> {
        let mut retry: u32 = 0;
        loop {
            match self.source.begin().await {
                Ok(tx) => {
                    debug!(retry, "transaction acquired");
                    return Ok(tx);
                }
                Err(e) if retry >= self.policy.max_retries => {
                    error!(%e, attempts = retry + 1, "get transaction failed, giving up");
                    return Err(AppError::TransactionAcquisition {
                        attempts: retry + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(%e, retry, backoff_ms = self.policy.backoff.as_millis() as u64, "get transaction failed, retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                    retry += 1;
                }
            }
        }
    }

    /// Run `work` inside a fresh transaction.
    ///
    /// Commits when `work` returns `Ok`. When `work` fails the transaction
    /// is rolled back and the work error is returned unchanged; a failed
    /// commit is returned as [`AppError::Database`].
    pub async fn run<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>>,
        E: From<AppError>,
    {
        let mut tx = self.acquire_transaction().await?;

        match work(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    error!(%e, "commit failed, transaction rolled back");
                    Err(AppError::Database(e).into())
                }
            },
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(%e, "rollback after failed work also failed");
                }
                Err(err)
            }
        }
    }
}
