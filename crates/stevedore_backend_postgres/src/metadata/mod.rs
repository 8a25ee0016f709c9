//! Connection plumbing for the relational metadata store.
//!
//! [`MetadataPool`] hands out pooled connections and transactions; the typed
//! store modules take a bare `&mut PgConnection`, so every query runs
//! identically on either. Transactions add savepoints for nested operations.
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use sqlx::{PgConnection, Pool, Transaction};

use crate::errors::{Error, Result};

pub mod types;

#[derive(Clone)]
pub struct MetadataPool {
    pool: Pool<Postgres>,
}

impl MetadataPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn conn(&self) -> Result<MetadataConn> {
        Ok(MetadataConn {
            conn: self.pool.acquire().await?,
        })
    }

    pub async fn begin(&self) -> Result<MetadataTx<'static>> {
        Ok(MetadataTx {
            tx: Some(self.pool.begin().await?),
        })
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

pub struct MetadataConn {
    conn: PoolConnection<Postgres>,
}

impl MetadataConn {
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }
}

static SAVEPOINT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

/// An open transaction. Dropping without [`MetadataTx::commit`] rolls back.
pub struct MetadataTx<'a> {
    tx: Option<Transaction<'a, Postgres>>,
}

impl<'a> MetadataTx<'a> {
    pub fn executor(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(Error::TxInactive),
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    /// Establish a named savepoint for a nested operation.
    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        let stmt = format!("SAVEPOINT {}", validate_savepoint_name(name)?);
        sqlx::query(&stmt).execute(self.executor()?).await?;
        Ok(())
    }

    /// Roll back to a previously established savepoint, keeping the enclosing
    /// transaction alive.
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        let stmt = format!("ROLLBACK TO SAVEPOINT {}", validate_savepoint_name(name)?);
        sqlx::query(&stmt).execute(self.executor()?).await?;
        Ok(())
    }

    pub async fn release(&mut self, name: &str) -> Result<()> {
        let stmt = format!("RELEASE SAVEPOINT {}", validate_savepoint_name(name)?);
        sqlx::query(&stmt).execute(self.executor()?).await?;
        Ok(())
    }
}

fn validate_savepoint_name(name: &str) -> Result<&str> {
    if SAVEPOINT_NAME_RE.is_match(name) {
        Ok(name)
    } else {
        Err(Error::InvalidSavepointName(name.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn savepoint_names() {
        assert!(validate_savepoint_name("sp_manifest_put").is_ok());
        assert!(validate_savepoint_name("_1").is_ok());
        for bad in ["", "1abc", "sp-dash", "sp;drop table blobs", "sp name"] {
            assert!(validate_savepoint_name(bad).is_err(), "{bad:?}");
        }
    }
}
