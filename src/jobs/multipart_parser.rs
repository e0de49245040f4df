use std::fmt::Display;
use std::str::FromStr;

use actix_multipart::{Field, Multipart};
use actix_web::HttpResponse;
use futures_util::StreamExt;
use log::warn;
use sanitize_filename::sanitize;

use crate::config::{MAX_BATCH_SIZE, MAX_PAUSE_MS};
use crate::ErrorResponse;

/// A file field read fully into memory.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct ParsedJobForm {
    pub dataset: UploadedFile,
    pub template: UploadedFile,
    pub filename_column: String,
    pub batch_size: Option<usize>,
    pub pause_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MultipartParseError {
    #[error("Multipart field error: {0}")]
    FieldError(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Invalid UTF-8 data: {0}")]
    Utf8Error(String),
    #[error("Upload exceeds the limit of {0} bytes")]
    TooLarge(usize),
}

impl From<MultipartParseError> for HttpResponse {
    fn from(error: MultipartParseError) -> Self {
        match error {
            MultipartParseError::TooLarge(_) => {
                HttpResponse::PayloadTooLarge().json(ErrorResponse::new("PayloadTooLarge", &error.to_string()))
            }
            MultipartParseError::IoError(_) => {
                HttpResponse::InternalServerError().json(ErrorResponse::internal_error(&error.to_string()))
            }
            _ => HttpResponse::BadRequest().json(ErrorResponse::bad_request(&error.to_string())),
        }
    }
}

pub struct MultipartParser;

impl MultipartParser {
    /// Parse the job form. `limit` bounds the sum of all field sizes.
    pub async fn parse_job_multipart(
        mut multipart: Multipart,
        limit: usize,
    ) -> Result<ParsedJobForm, MultipartParseError> {
        let mut received = 0usize;
        let mut dataset = None;
        let mut template = None;
        let mut filename_column = None;
        let mut batch_size = None;
        let mut pause_ms = None;

        while let Some(item) = multipart.next().await {
            let mut field = item.map_err(|e| MultipartParseError::FieldError(e.to_string()))?;
            let field_name = field_name(&field)?;

            match field_name.as_str() {
                "dataset" => dataset = Some(read_file(&mut field, "dataset", &mut received, limit).await?),
                "template" => template = Some(read_file(&mut field, "template", &mut received, limit).await?),
                "filename_column" => {
                    let value = read_text(&mut field, &mut received, limit).await?;
                    let value = value.trim();
                    if !value.is_empty() {
                        filename_column = Some(value.to_string());
                    }
                }
                "batch_size" => {
                    let value = read_text(&mut field, &mut received, limit).await?;
                    batch_size = parse_optional("batch_size", &value, 1, MAX_BATCH_SIZE)?;
                }
                "pause_ms" => {
                    let value = read_text(&mut field, &mut received, limit).await?;
                    pause_ms = parse_optional("pause_ms", &value, 0, MAX_PAUSE_MS)?;
                }
                other => {
                    warn!("ignoring unexpected multipart field '{}'", other);
                    drain(&mut field, &mut received, limit).await?;
                }
            }
        }

        Ok(ParsedJobForm {
            dataset: dataset.ok_or(MultipartParseError::MissingField("dataset"))?,
            template: template.ok_or(MultipartParseError::MissingField("template"))?,
            filename_column: filename_column.ok_or(MultipartParseError::MissingField("filename_column"))?,
            batch_size,
            pause_ms,
        })
    }

    pub async fn parse_dataset_multipart(
        mut multipart: Multipart,
        limit: usize,
    ) -> Result<UploadedFile, MultipartParseError> {
        let mut received = 0usize;
        let mut dataset = None;

        while let Some(item) = multipart.next().await {
            let mut field = item.map_err(|e| MultipartParseError::FieldError(e.to_string()))?;
            if field_name(&field)? == "dataset" {
                dataset = Some(read_file(&mut field, "dataset", &mut received, limit).await?);
            } else {
                drain(&mut field, &mut received, limit).await?;
            }
        }

        dataset.ok_or(MultipartParseError::MissingField("dataset"))
    }
}

/// Parse an optional bounded number; a blank value means "use the default".
pub fn parse_optional<T>(field: &'static str, raw: &str, min: T, max: T) -> Result<Option<T>, MultipartParseError>
where
    T: FromStr + PartialOrd + Display,
    T::Err: Display,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let value: T = raw.parse().map_err(|e: T::Err| MultipartParseError::InvalidValue {
        field,
        message: e.to_string(),
    })?;
    if value < min || value > max {
        return Err(MultipartParseError::InvalidValue {
            field,
            message: format!("must be between {min} and {max}"),
        });
    }
    Ok(Some(value))
}

fn field_name(field: &Field) -> Result<String, MultipartParseError> {
    let content_disposition = field
        .content_disposition()
        .ok_or_else(|| MultipartParseError::FieldError("Content disposition not found".to_string()))?;
    content_disposition
        .get_name()
        .map(str::to_string)
        .ok_or_else(|| MultipartParseError::FieldError("Field name not found".to_string()))
}

async fn read_file(
    field: &mut Field,
    name: &'static str,
    received: &mut usize,
    limit: usize,
) -> Result<UploadedFile, MultipartParseError> {
    let filename = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(|filename| sanitize(filename))
        .filter(|filename| !filename.is_empty())
        .ok_or_else(|| MultipartParseError::FieldError(format!("No filename in {name} field")))?;

    let data = read_bytes(field, received, limit).await?;
    Ok(UploadedFile { filename, data })
}

async fn read_text(field: &mut Field, received: &mut usize, limit: usize) -> Result<String, MultipartParseError> {
    let bytes = read_bytes(field, received, limit).await?;
    String::from_utf8(bytes).map_err(|e| MultipartParseError::Utf8Error(e.to_string()))
}

async fn read_bytes(field: &mut Field, received: &mut usize, limit: usize) -> Result<Vec<u8>, MultipartParseError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| MultipartParseError::IoError(e.to_string()))?;
        *received += chunk.len();
        if *received > limit {
            return Err(MultipartParseError::TooLarge(limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

async fn drain(field: &mut Field, received: &mut usize, limit: usize) -> Result<(), MultipartParseError> {
    read_bytes(field, received, limit).await.map(|_| ())
}
