//! Optional post-processing of generated documents.
//!
//! A [`PostProcessor`] turns a rendered document into a second format. The
//! bundled [`ExternalConverter`] shells out to a configured command (for
//! example LibreOffice) inside a throwaway directory.

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

use super::renderer::DocumentPayload;

const INPUT_TOKEN: &str = "{input}";
const OUTDIR_TOKEN: &str = "{outdir}";

/// Errors that can occur while converting one document.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("conversion command is empty")]
    EmptyCommand,
    #[error("failed to create temporary directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to write conversion input: {0}")]
    WriteInput(#[source] std::io::Error),
    #[error("conversion command could not be started: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("conversion command exited with status {0}")]
    Exit(i32),
    #[error("failed to read converted document: {0}")]
    ReadOutput(#[source] std::io::Error),
}

/// Converts one successful document into another format.
pub trait PostProcessor: Send + Sync {
    /// Extension of the produced files.
    fn extension(&self) -> &str;

    fn convert(&self, payload: &DocumentPayload) -> Result<Vec<u8>, ConversionError>;
}

/// Runs an external program once per document.
///
/// The command line may reference `{input}` (the written document) and
/// `{outdir}` (where the program must leave `<name>.<extension>`).
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    program: String,
    args: Vec<String>,
    extension: String,
}

impl ExternalConverter {
    pub fn new(program: impl Into<String>, args: Vec<String>, extension: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            extension: extension.into(),
        }
    }

    /// Parse a whitespace-separated command line such as
    /// `soffice --headless --convert-to pdf --outdir {outdir} {input}`.
    pub fn from_command_line(command: &str, extension: &str) -> Result<Self, ConversionError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ConversionError::EmptyCommand)?;
        Ok(Self::new(program, parts.collect(), extension.trim_start_matches('.')))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expand_args(&self, input: &Path, outdir: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let outdir = outdir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(INPUT_TOKEN, &input).replace(OUTDIR_TOKEN, &outdir))
            .collect()
    }
}

impl PostProcessor for ExternalConverter {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn convert(&self, payload: &DocumentPayload) -> Result<Vec<u8>, ConversionError> {
        let workdir = tempfile::Builder::new()
            .prefix("docmerge-convert-")
            .tempdir()
            .map_err(ConversionError::TempDir)?;
        let outdir = workdir.path().join("out");
        fs::create_dir(&outdir).map_err(ConversionError::TempDir)?;

        let input = workdir.path().join(payload.entry_name());
        fs::write(&input, &payload.bytes).map_err(ConversionError::WriteInput)?;

        run_converter(&workdir, &self.program, &self.expand_args(&input, &outdir))?;

        let output = outdir.join(format!("{}.{}", payload.name, self.extension));
        fs::read(&output).map_err(ConversionError::ReadOutput)
    }
}

fn run_converter(workdir: &TempDir, program: &str, args: &[String]) -> Result<(), ConversionError> {
    let status = Command::new(program)
        .args(args)
        .current_dir(workdir.path())
        .status()
        .map_err(ConversionError::Spawn)?;

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        return Err(ConversionError::Exit(code));
    }
    Ok(())
}
