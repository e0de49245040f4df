use std::collections::BTreeSet;
use std::sync::Arc;

use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::future::ready;
use futures_util::stream::{self, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::jobs::models::{CreateJobForm, DatasetInspection, InspectDatasetForm, JobCreated, JobSnapshot};
use crate::jobs::multipart_parser::{MultipartParser, ParsedJobForm, UploadedFile};
use crate::jobs::registry::{Job, JobEvent};
use crate::jobs::runner::{self, RunRequest};
use crate::merge::{ArchiveBlob, Dataset, RenderContext, SetupError, Template};
use crate::{metrics, AppState, ErrorResponse};

fn job_not_found(id: Uuid) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse::not_found(&format!("Job {id} not found")))
}

async fn find_job(state: &AppState, id: Uuid) -> Result<Arc<Job>, HttpResponse> {
    state.jobs.get(id).await.ok_or_else(|| job_not_found(id))
}

/// Parse and validate the uploads; runs on the blocking pool.
fn prepare_run(dataset: UploadedFile, template: UploadedFile, filename_column: &str) -> Result<RunRequest, SetupError> {
    let dataset = Dataset::from_upload(&dataset.filename, &dataset.data)?;
    let template = Template::from_bytes(template.filename, template.data)?;

    if dataset.column_index(filename_column).is_none() {
        return Err(SetupError::UnknownColumn(filename_column.to_string()));
    }

    match template.placeholders() {
        Ok(placeholders) => {
            let columns: BTreeSet<&str> = dataset.columns().iter().map(String::as_str).collect();
            for name in placeholders.iter().filter(|name| !columns.contains(name.as_str())) {
                warn!("placeholder '{}' has no matching column and will render blank", name);
            }
        }
        Err(e) => debug!("template placeholders could not be listed: {}", e),
    }

    Ok(RunRequest {
        dataset,
        template,
        filename_column: filename_column.to_string(),
    })
}

fn attachment(filename: &str) -> ContentDisposition {
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(filename.to_string())],
    }
}

async fn serve_archive(req: &HttpRequest, blob: Arc<ArchiveBlob>, filename: &str) -> HttpResponse {
    let mime = mime_guess::from_path(filename).first_or_octet_stream();

    if let Some(path) = blob.staged_path() {
        return match NamedFile::open_async(path).await {
            Ok(file) => file
                .set_content_type(mime)
                .set_content_disposition(attachment(filename))
                .into_response(req),
            Err(e) => {
                error!("failed to open staged archive {}: {}", path.display(), e);
                HttpResponse::InternalServerError().json(ErrorResponse::internal_error("Archive is unavailable"))
            }
        };
    }

    match blob.as_bytes() {
        Some(bytes) => HttpResponse::Ok()
            .content_type(mime.to_string())
            .insert_header(attachment(filename))
            .body(bytes.to_vec()),
        None => HttpResponse::InternalServerError().json(ErrorResponse::internal_error("Archive is unavailable")),
    }
}

fn event_stream<S>(events: S) -> HttpResponse
where
    S: Stream<Item = Result<web::Bytes, std::io::Error>> + 'static,
{
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(events)
}

fn sse_bytes(event: &JobEvent) -> Result<web::Bytes, std::io::Error> {
    Ok(web::Bytes::from(event.to_sse()))
}

#[utoipa::path(
    context_path = "/api",
    tag = "Datasets",
    post,
    path = "/datasets/inspect",
    request_body(content = inline(InspectDatasetForm), content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Columns, row count and first-row preview", body = DatasetInspection),
        (status = 400, description = "Dataset could not be read", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse)
    )
)]
pub async fn inspect_dataset(payload: Multipart, state: web::Data<AppState>) -> impl Responder {
    let upload = match MultipartParser::parse_dataset_multipart(payload, state.config.max_upload_bytes).await {
        Ok(upload) => upload,
        Err(e) => return HttpResponse::from(e),
    };

    let dataset = match web::block(move || Dataset::from_upload(&upload.filename, &upload.data)).await {
        Ok(Ok(dataset)) => dataset,
        Ok(Err(e)) => {
            warn!("dataset inspection rejected: {}", e);
            return HttpResponse::BadRequest().json(ErrorResponse::bad_request(&e.to_string()));
        }
        Err(e) => {
            error!("dataset inspection worker failed: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse::internal_error(&e.to_string()));
        }
    };

    let mut preview = Map::new();
    if let Some(first) = dataset.rows().first() {
        let context = RenderContext::build(dataset.columns(), first);
        for column in dataset.columns() {
            preview.insert(column.clone(), Value::String(context.resolve(column).to_string()));
        }
    }

    HttpResponse::Ok().json(DatasetInspection {
        columns: dataset.columns().to_vec(),
        row_count: dataset.len(),
        preview,
    })
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    post,
    path = "/jobs",
    request_body(content = inline(CreateJobForm), content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Job accepted and running", body = JobCreated),
        (status = 400, description = "Invalid dataset, template or form field", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse),
        (status = 500, description = "Internal Server Error", body = ErrorResponse)
    )
)]
pub async fn create_job(payload: Multipart, state: web::Data<AppState>) -> impl Responder {
    let form = match MultipartParser::parse_job_multipart(payload, state.config.max_upload_bytes).await {
        Ok(form) => form,
        Err(e) => return HttpResponse::from(e),
    };
    let ParsedJobForm {
        dataset,
        template,
        filename_column,
        batch_size,
        pause_ms,
    } = form;

    let request = match web::block(move || prepare_run(dataset, template, &filename_column)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("job rejected: {}", e);
            metrics::record_setup_failure();
            return HttpResponse::BadRequest().json(ErrorResponse::bad_request(&e.to_string()));
        }
        Err(e) => {
            error!("job setup worker failed: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse::internal_error(&e.to_string()));
        }
    };

    let job = Arc::new(Job::new(request.dataset.len()));
    state.jobs.insert(Arc::clone(&job)).await;
    debug!("job {} registered ({} jobs tracked)", job.id(), state.jobs.entry_count());

    let orchestrator = state.orchestrator(state.config.run_options(batch_size, pause_ms));
    runner::spawn(Arc::clone(&job), orchestrator, request);

    HttpResponse::Accepted().json(JobCreated {
        job_id: job.id(),
        total: job.total(),
    })
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    get,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Current job state", body = JobSnapshot),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub async fn get_job(path: web::Path<Uuid>, state: web::Data<AppState>) -> impl Responder {
    match find_job(&state, path.into_inner()).await {
        Ok(job) => HttpResponse::Ok().json(job.snapshot(state.config.offer_empty_archive)),
        Err(response) => response,
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    get,
    path = "/jobs/{id}/events",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Server-sent `progress` events followed by one `done` event", body = String, content_type = "text/event-stream"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub async fn job_events(path: web::Path<Uuid>, state: web::Data<AppState>) -> impl Responder {
    let job = match find_job(&state, path.into_inner()).await {
        Ok(job) => job,
        Err(response) => return response,
    };

    let receiver = job.subscribe();
    if let Some(done) = job.terminal_event() {
        return event_stream(stream::once(ready(sse_bytes(&done))));
    }

    let live = BroadcastStream::new(receiver).filter_map(|item| ready(item.ok()));
    let events = stream::once(ready(job.progress_event()))
        .chain(live)
        .scan(false, |finished, event| {
            if *finished {
                return ready(None);
            }
            *finished = event.is_terminal();
            ready(Some(sse_bytes(&event)))
        });

    event_stream(events)
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    get,
    path = "/jobs/{id}/archive",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "ZIP archive of the generated documents", body = Vec<u8>, content_type = "application/zip"),
        (status = 404, description = "Unknown job", body = ErrorResponse),
        (status = 409, description = "Job still running or produced no documents", body = ErrorResponse)
    )
)]
pub async fn download_archive(req: HttpRequest, path: web::Path<Uuid>, state: web::Data<AppState>) -> impl Responder {
    let job = match find_job(&state, path.into_inner()).await {
        Ok(job) => job,
        Err(response) => return response,
    };

    if !job.state().is_terminal() {
        return HttpResponse::Conflict().json(ErrorResponse::conflict("Job is still running"));
    }

    match job.archive(state.config.offer_empty_archive) {
        Some(blob) => {
            info!("serving archive for job {} ({} documents)", job.id(), blob.len());
            serve_archive(&req, blob, &state.config.archive_name).await
        }
        None => HttpResponse::Conflict().json(ErrorResponse::conflict("Job produced no documents")),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    get,
    path = "/jobs/{id}/converted",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "ZIP archive of the converted documents", body = Vec<u8>, content_type = "application/zip"),
        (status = 404, description = "Unknown job or no converted output", body = ErrorResponse),
        (status = 409, description = "Job still running", body = ErrorResponse)
    )
)]
pub async fn download_converted(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> impl Responder {
    let job = match find_job(&state, path.into_inner()).await {
        Ok(job) => job,
        Err(response) => return response,
    };

    if !job.state().is_terminal() {
        return HttpResponse::Conflict().json(ErrorResponse::conflict("Job is still running"));
    }

    match job.converted() {
        Some(blob) => {
            let stem = state.config.archive_name.trim_end_matches(".zip");
            let filename = format!("{}_{}.zip", stem, state.config.convert_extension);
            serve_archive(&req, blob, &filename).await
        }
        None => HttpResponse::NotFound().json(ErrorResponse::not_found("No converted documents for this job")),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    delete,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 202, description = "Cancellation requested", body = JobSnapshot),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub async fn cancel_job(path: web::Path<Uuid>, state: web::Data<AppState>) -> impl Responder {
    match find_job(&state, path.into_inner()).await {
        Ok(job) => {
            info!("cancellation requested for job {}", job.id());
            job.request_cancel();
            HttpResponse::Accepted().json(job.snapshot(state.config.offer_empty_archive))
        }
        Err(response) => response,
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Jobs",
    get,
    path = "/metrics/pipeline",
    responses(
        (status = 200, description = "Pipeline counters in Prometheus text format", body = String, content_type = "text/plain"),
        (status = 500, description = "Internal Server Error", body = ErrorResponse)
    )
)]
pub async fn pipeline_metrics() -> impl Responder {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(body),
        Err(e) => {
            error!("failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::internal_error(&e.to_string()))
        }
    }
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/datasets/inspect").route(web::post().to(inspect_dataset)))
        .service(web::resource("/jobs").route(web::post().to(create_job)))
        .service(
            web::resource("/jobs/{id}")
                .route(web::get().to(get_job))
                .route(web::delete().to(cancel_job)),
        )
        .service(web::resource("/jobs/{id}/events").route(web::get().to(job_events)))
        .service(web::resource("/jobs/{id}/archive").route(web::get().to(download_archive)))
        .service(web::resource("/jobs/{id}/converted").route(web::get().to(download_converted)))
        .service(web::resource("/metrics/pipeline").route(web::get().to(pipeline_metrics)));
}
