//! Service configuration from the environment (and `.env`).

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::merge::orchestrator::{DEFAULT_BATCH_SIZE, DEFAULT_FAILURE_PREVIEW};
use crate::merge::{sanitize_filename, ArchiveStaging, RunOptions};

/// Largest batch size accepted from clients.
pub const MAX_BATCH_SIZE: usize = 500;
/// Largest inter-row pause accepted from clients, in milliseconds.
pub const MAX_PAUSE_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {message}")]
    Invalid {
        key: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub default_batch_size: usize,
    pub default_pause_ms: u64,
    pub failure_preview_limit: usize,
    pub staging: ArchiveStaging,
    pub job_ttl: Duration,
    pub max_jobs: u64,
    pub max_upload_bytes: usize,
    /// Per-archive content cap; a run that exceeds it is aborted.
    pub max_archive_bytes: Option<u64>,
    pub archive_name: String,
    pub offer_empty_archive: bool,
    pub convert_command: Option<String>,
    pub convert_extension: String,
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_pause_ms: 0,
            failure_preview_limit: DEFAULT_FAILURE_PREVIEW,
            staging: ArchiveStaging::Memory,
            job_ttl: Duration::from_secs(60 * 60),
            max_jobs: 64,
            max_upload_bytes: 25 * 1024 * 1024,
            max_archive_bytes: None,
            archive_name: "documents.zip".to_string(),
            offer_empty_archive: false,
            convert_command: None,
            convert_extension: "pdf".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Read `DOCMERGE_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_batch_size = parse(&lookup, "DOCMERGE_BATCH_SIZE", defaults.default_batch_size)?;
        if !(1..=MAX_BATCH_SIZE).contains(&default_batch_size) {
            return Err(invalid(
                "DOCMERGE_BATCH_SIZE",
                default_batch_size,
                format!("must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }

        let default_pause_ms = parse(&lookup, "DOCMERGE_PAUSE_MS", defaults.default_pause_ms)?;
        if default_pause_ms > MAX_PAUSE_MS {
            return Err(invalid(
                "DOCMERGE_PAUSE_MS",
                default_pause_ms,
                format!("must be at most {MAX_PAUSE_MS}"),
            ));
        }

        let archive_name = match lookup("DOCMERGE_ARCHIVE_NAME") {
            Some(name) => {
                let stem = name.trim().trim_end_matches(".zip");
                format!("{}.zip", sanitize_filename(stem, "documents"))
            }
            None => defaults.archive_name,
        };

        let max_archive_bytes = match parse(&lookup, "DOCMERGE_MAX_ARCHIVE_BYTES", 0u64)? {
            0 => None,
            limit => Some(limit),
        };

        let convert_command = lookup("DOCMERGE_CONVERT_COMMAND")
            .map(|command| command.trim().to_string())
            .filter(|command| !command.is_empty());

        let allowed_origins = lookup("DOCMERGE_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: lookup("DOCMERGE_HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "DOCMERGE_PORT", defaults.port)?,
            default_batch_size,
            default_pause_ms,
            failure_preview_limit: parse(&lookup, "DOCMERGE_FAILURE_PREVIEW", defaults.failure_preview_limit)?,
            staging: parse(&lookup, "DOCMERGE_STAGING", defaults.staging)?,
            job_ttl: Duration::from_secs(parse(&lookup, "DOCMERGE_JOB_TTL_SECS", defaults.job_ttl.as_secs())?),
            max_jobs: parse(&lookup, "DOCMERGE_MAX_JOBS", defaults.max_jobs)?,
            max_upload_bytes: parse(&lookup, "DOCMERGE_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            max_archive_bytes,
            archive_name,
            offer_empty_archive: parse(&lookup, "DOCMERGE_OFFER_EMPTY_ARCHIVE", defaults.offer_empty_archive)?,
            convert_command,
            convert_extension: lookup("DOCMERGE_CONVERT_EXTENSION")
                .map(|ext| ext.trim().trim_start_matches('.').to_string())
                .filter(|ext| !ext.is_empty())
                .unwrap_or(defaults.convert_extension),
            allowed_origins,
        })
    }

    /// Run options for a job, with optional per-request overrides.
    pub fn run_options(&self, batch_size: Option<usize>, pause_ms: Option<u64>) -> RunOptions {
        RunOptions {
            batch_size: batch_size.unwrap_or(self.default_batch_size),
            inter_row_pause: Duration::from_millis(pause_ms.unwrap_or(self.default_pause_ms)),
            failure_preview_limit: self.failure_preview_limit,
            staging: self.staging,
            max_archive_bytes: self.max_archive_bytes,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl Display, message: String) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        message,
    }
}
