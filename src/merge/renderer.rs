//! Document rendering.
//!
//! Handles the low-level details of opening the template package, rewriting
//! the text-bearing parts and re-packing the result in memory.

use std::io::{Cursor, Read, Write};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use super::context::RenderContext;
use super::template::{
    is_word_text_part, substitute, EngineError, SubstitutionMode, Template, TemplateFormat,
};

/// Failure of one row, carrying enough to show the operator what went wrong.
#[derive(Debug, Error)]
#[error("row {row} ({output_name}): {source}")]
pub struct RenderError {
    /// 1-based row index.
    pub row: usize,
    pub output_name: String,
    #[source]
    pub source: EngineError,
}

/// A rendered document, not yet written anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    pub name: String,
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl DocumentPayload {
    /// Archive entry name: output name plus extension.
    pub fn entry_name(&self) -> String {
        format!("{}.{}", self.name, self.extension)
    }
}

/// Turns a template and a context into document bytes.
pub trait DocumentRenderer {
    fn render(&self, template: &Template, context: &RenderContext) -> Result<Vec<u8>, EngineError>;
}

/// Stateless renderer for the formats understood by [`Template`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl DocumentRenderer for TemplateRenderer {
    fn render(&self, template: &Template, context: &RenderContext) -> Result<Vec<u8>, EngineError> {
        match template.format() {
            TemplateFormat::Docx => render_docx(template.bytes(), context),
            TemplateFormat::Text { escape_markup, .. } => {
                let source = std::str::from_utf8(template.bytes()).map_err(|_| EngineError::NotUtf8 {
                    part: template.name().to_string(),
                })?;
                let mode = if *escape_markup {
                    SubstitutionMode::Markup
                } else {
                    SubstitutionMode::Plain
                };
                Ok(substitute(source, context, mode)?.into_bytes())
            }
        }
    }
}

/// Entry options shared by every package this crate writes. The fixed
/// timestamp keeps output byte-for-byte reproducible.
pub(crate) fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
}

/// Preallocation for one entry. The declared size comes from the uploaded
/// package header and is only trusted up to a multiple of the package size.
fn capacity_hint(declared: u64, package_len: usize) -> usize {
    let ceiling = package_len.saturating_mul(4);
    usize::try_from(declared).map_or(ceiling, |declared| declared.min(ceiling))
}

fn render_docx(package: &[u8], context: &RenderContext) -> Result<Vec<u8>, EngineError> {
    let mut source = ZipArchive::new(Cursor::new(package))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(package.len())));
    let options = entry_options();

    for index in 0..source.len() {
        let mut entry = source.by_index(index)?;
        let name = entry.name().to_string();

        if entry.is_dir() {
            writer.add_directory(name, options)?;
            continue;
        }

        let mut data = Vec::with_capacity(capacity_hint(entry.size(), package.len()));
        entry.read_to_end(&mut data)?;

        if is_word_text_part(&name) {
            let xml = String::from_utf8(data).map_err(|_| EngineError::NotUtf8 { part: name.clone() })?;
            data = substitute(&xml, context, SubstitutionMode::WordXml)?.into_bytes();
        }

        writer.start_file(name, options)?;
        writer.write_all(&data)?;
    }

    Ok(writer.finish()?.into_inner())
}
