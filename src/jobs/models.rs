use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::merge::{RunReport, RunState};

/// Multipart body of `POST /api/jobs`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateJobForm {
    /// XLSX, CSV, TSV or JSON dataset.
    #[allow(unused)]
    pub dataset: Vec<u8>,
    /// DOCX or text template.
    #[allow(unused)]
    pub template: Vec<u8>,
    /// Column whose value names each document.
    #[allow(unused)]
    pub filename_column: String,
    #[allow(unused)]
    pub batch_size: Option<usize>,
    #[allow(unused)]
    pub pause_ms: Option<u64>,
}

/// Multipart body of `POST /api/datasets/inspect`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct InspectDatasetForm {
    #[allow(unused)]
    pub dataset: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DatasetInspection {
    pub columns: Vec<String>,
    pub row_count: usize,
    /// First row as it would be substituted; empty for a dataset without rows.
    #[schema(value_type = Object)]
    pub preview: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobCreated {
    pub job_id: Uuid,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    #[schema(value_type = String, example = "running")]
    pub state: RunState,
    pub processed: usize,
    pub total: usize,
    #[schema(value_type = Option<Object>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub archive_available: bool,
    pub converted_available: bool,
    pub created_at: DateTime<Utc>,
}
