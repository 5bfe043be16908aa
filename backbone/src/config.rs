use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::error::{AppError, Result};

fn default_node_env() -> String {
    "development".into()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_poolsize_min() -> u32 {
    5
}

fn default_db_poolsize_max() -> u32 {
    20
}

fn default_mq_url() -> String {
    "amqp://127.0.0.1:5672/%2f".into()
}

fn default_mq_prefetch() -> u16 {
    1
}

fn default_logger_colorize() -> bool {
    true
}

fn default_logger_time_format() -> String {
    "%Y-%m-%d %H:%M:%S%.3f".into()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Http,
    #[default]
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            // tracing has no dedicated request level
            LogLevel::Http | LogLevel::Debug => "debug",
        }
    }
}

/// Process-wide settings, read once from the environment at startup.
///
/// Keys are the lowercased environment variable names (`DB_HOST` becomes
/// `db_host`), mirroring how the services have always been configured.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_node_env")]
    pub node_env: String,

    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    pub db_name: String,
    pub db_username: String,
    pub db_password: String,
    #[serde(default = "default_db_poolsize_min")]
    pub db_poolsize_min: u32,
    #[serde(default = "default_db_poolsize_max")]
    pub db_poolsize_max: u32,

    #[serde(default = "default_mq_url")]
    pub mq_url: String,
    #[serde(default = "default_mq_prefetch")]
    pub mq_prefetch: u16,

    #[serde(default)]
    pub logger_level: LogLevel,
    #[serde(default = "default_logger_colorize")]
    pub logger_colorize: bool,
    #[serde(default = "default_logger_time_format")]
    pub logger_time_format: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub log_statements: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub prefetch: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub colorize: bool,
    pub time_format: String,
}

impl Settings {
    pub fn new() -> Result<Self> {
        Self::from_builder(
            config::Config::builder().add_source(config::Environment::default()),
        )
    }

    /// Builds and validates settings from an arbitrary source stack.
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.db_poolsize_min <= 1 {
            return Err(AppError::Config(format!(
                "DB_POOLSIZE_MIN must be greater than 1, got {}",
                self.db_poolsize_min
            )));
        }
        if self.db_poolsize_max <= 2 {
            return Err(AppError::Config(format!(
                "DB_POOLSIZE_MAX must be greater than 2, got {}",
                self.db_poolsize_max
            )));
        }
        if self.db_poolsize_max < self.db_poolsize_min {
            return Err(AppError::Config(format!(
                "DB_POOLSIZE_MAX ({}) is below DB_POOLSIZE_MIN ({})",
                self.db_poolsize_max, self.db_poolsize_min
            )));
        }
        if self.mq_prefetch == 0 {
            return Err(AppError::Config("MQ_PREFETCH must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.node_env == "development"
    }

    pub fn database(&self) -> DatabaseSettings {
        DatabaseSettings {
            host: self.db_host.clone(),
            port: self.db_port,
            database: self.db_name.clone(),
            username: self.db_username.clone(),
            password: self.db_password.clone(),
            pool_min: self.db_poolsize_min,
            pool_max: self.db_poolsize_max,
            log_statements: self.is_development(),
        }
    }

    pub fn broker(&self) -> BrokerSettings {
        BrokerSettings {
            url: self.mq_url.clone(),
            prefetch: self.mq_prefetch,
        }
    }

    pub fn logging(&self) -> LoggingSettings {
        LoggingSettings {
            level: self.logger_level,
            colorize: self.logger_colorize,
            time_format: self.logger_time_format.clone(),
        }
    }
}
