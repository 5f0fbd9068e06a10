use std::path::PathBuf;

use clap::Parser;
use shared::error::CommonError;
use url::Url;

use crate::logic::{
    BarrierServiceOptions, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_ROTATION_MAX_ATTEMPTS, KdfLabel,
    MAX_UNSEAL_SECRETS, UnsealMode, UnsealSecretSource,
};

#[derive(Clone, Parser)]
#[command(name = "barrier")]
pub struct BarrierConfig {
    /// Files holding the unseal secrets, comma separated.
    #[arg(
        long,
        env = "BARRIER_UNSEAL_FILES",
        value_delimiter = ',',
        required = true
    )]
    pub unseal_files: Vec<PathBuf>,
    /// Derive the root KEK from every combination of this many unseal files
    /// instead of from all of them.
    #[arg(long, env = "BARRIER_UNSEAL_CHOOSE_N")]
    pub unseal_choose_n: Option<usize>,
    #[arg(
        long,
        env = "BARRIER_DB_CONN_STRING",
        default_value = "libsql://./.barrier/local.db?mode=local"
    )]
    pub db_conn_string: Url,
    #[arg(long, env = "BARRIER_DB_AUTH_TOKEN")]
    pub db_auth_token: Option<String>,
    #[arg(
        long,
        env = "BARRIER_ROTATION_MAX_ATTEMPTS",
        default_value_t = DEFAULT_ROTATION_MAX_ATTEMPTS
    )]
    pub rotation_max_attempts: u32,
    #[arg(
        long,
        env = "BARRIER_EVENT_CHANNEL_CAPACITY",
        default_value_t = DEFAULT_EVENT_CHANNEL_CAPACITY
    )]
    pub event_channel_capacity: usize,
}

impl std::fmt::Debug for BarrierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierConfig")
            .field("unseal_files", &self.unseal_files)
            .field("unseal_choose_n", &self.unseal_choose_n)
            .field("db_conn_string", &self.db_conn_string.as_str())
            .field(
                "db_auth_token",
                &self.db_auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("rotation_max_attempts", &self.rotation_max_attempts)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish()
    }
}

impl BarrierConfig {
    /// Reads the configuration from `BARRIER_*` environment variables only,
    /// after loading any `.env` and `.env.secrets` files.
    pub fn from_env() -> Result<Self, CommonError> {
        shared::env::configure_env()?;
        let config = Self::try_parse_from(["barrier"]).map_err(|e| CommonError::ValidationFailed {
            msg: format!("invalid barrier configuration: {e}"),
            source: Some(e.into()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CommonError> {
        if self.unseal_files.is_empty() {
            return Err(CommonError::validation_failed(
                "at least one unseal file is required",
            ));
        }
        if self.unseal_files.len() > MAX_UNSEAL_SECRETS {
            return Err(CommonError::validation_failed(format!(
                "at most {MAX_UNSEAL_SECRETS} unseal files are supported, got {}",
                self.unseal_files.len()
            )));
        }
        if let Some(n) = self.unseal_choose_n
            && (n == 0 || n > self.unseal_files.len())
        {
            return Err(CommonError::validation_failed(format!(
                "unseal_choose_n must be between 1 and {}, got {n}",
                self.unseal_files.len()
            )));
        }
        if self.rotation_max_attempts == 0 {
            return Err(CommonError::validation_failed(
                "rotation_max_attempts must be at least 1",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CommonError::validation_failed(
                "event_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn unseal_sources(&self) -> Vec<UnsealSecretSource> {
        self.unseal_files
            .iter()
            .cloned()
            .map(UnsealSecretSource::from)
            .collect()
    }

    pub fn unseal_mode(&self) -> UnsealMode {
        match self.unseal_choose_n {
            Some(n) => UnsealMode::ChooseN { n },
            None => UnsealMode::All,
        }
    }

    pub fn service_options(&self) -> BarrierServiceOptions {
        BarrierServiceOptions {
            kdf_label: KdfLabel::CURRENT,
            rotation_max_attempts: self.rotation_max_attempts,
            event_channel_capacity: self.event_channel_capacity,
        }
    }
}
