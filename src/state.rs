//! Shared application state handed to every handler.

use std::sync::Arc;

use log::info;

use crate::config::AppConfig;
use crate::jobs::registry::JobRegistry;
use crate::merge::{BatchOrchestrator, ConversionError, ExternalConverter, PostProcessor, RunOptions};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: JobRegistry,
    pub converter: Option<Arc<dyn PostProcessor>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, ConversionError> {
        let converter: Option<Arc<dyn PostProcessor>> = match &config.convert_command {
            Some(command) => {
                let converter = ExternalConverter::from_command_line(command, &config.convert_extension)?;
                info!(
                    "post-processing enabled: '{}' producing .{} files",
                    converter.program(),
                    config.convert_extension
                );
                Some(Arc::new(converter))
            }
            None => None,
        };

        Ok(Self {
            jobs: JobRegistry::new(config.job_ttl, config.max_jobs),
            config: Arc::new(config),
            converter,
        })
    }

    /// Orchestrator for one job, wired with the configured post-processor.
    pub fn orchestrator(&self, options: RunOptions) -> BatchOrchestrator {
        let orchestrator = BatchOrchestrator::new(options);
        match &self.converter {
            Some(converter) => orchestrator.with_post_processor(Arc::clone(converter)),
            None => orchestrator,
        }
    }
}
