use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::errors::{Error, Result};
use crate::metadata::MetadataPool;

fn default_port() -> u16 {
    5432
}

fn default_max_open() -> u32 {
    10
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TlsConfig {
    /// disable | prefer | require | verify-ca | verify-full
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub root_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_open")]
    pub max_open: u32,
    #[serde(default)]
    pub max_idle: u32,
    #[serde(default)]
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: default_max_open(),
            max_idle: 0,
            max_lifetime_secs: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub dbname: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl PostgresConfig {
    fn connect_options(&self) -> Result<PgConnectOptions> {
        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.dbname);

        if let Some(password) = &self.password {
            opts = opts.password(password);
        }
        if let Some(mode) = &self.tls.mode {
            let mode = match mode.as_str() {
                "disable" => PgSslMode::Disable,
                "allow" => PgSslMode::Allow,
                "prefer" => PgSslMode::Prefer,
                "require" => PgSslMode::Require,
                "verify-ca" => PgSslMode::VerifyCa,
                "verify-full" => PgSslMode::VerifyFull,
                other => {
                    return Err(Error::Sqlx(sqlx::Error::Configuration(
                        format!("unknown tls mode {other:?}").into(),
                    )))
                }
            };
            opts = opts.ssl_mode(mode);
        }
        if let Some(root) = &self.tls.root_cert {
            opts = opts.ssl_root_cert(root);
        }
        if let Some(cert) = &self.tls.client_cert {
            opts = opts.ssl_client_cert(cert);
        }
        if let Some(key) = &self.tls.client_key {
            opts = opts.ssl_client_key(key);
        }
        Ok(opts)
    }

    pub async fn new_pool(&self) -> Result<MetadataPool> {
        let mut pool_opts = PgPoolOptions::new()
            .max_connections(self.pool.max_open)
            .min_connections(self.pool.max_idle);
        if let Some(secs) = self.pool.max_lifetime_secs {
            pool_opts = pool_opts.max_lifetime(Duration::from_secs(secs));
        }
        let pool = pool_opts.connect_with(self.connect_options()?).await?;
        Ok(MetadataPool::new(pool))
    }
}

fn default_tx_timeout_secs() -> u64 {
    10
}

fn default_review_delay_secs() -> i64 {
    24 * 60 * 60
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// Online garbage collection settings, shared by both worker kinds.
#[derive(Clone, Debug, Deserialize)]
pub struct GcConfig {
    /// Absolute deadline for one worker transaction.
    #[serde(default = "default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,
    /// How long a newly enqueued task waits before review.
    #[serde(default = "default_review_delay_secs")]
    pub review_delay_secs: i64,
    /// Idle sleep between polls when the queue is empty.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            tx_timeout_secs: default_tx_timeout_secs(),
            review_delay_secs: default_review_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl GcConfig {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn review_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.review_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
