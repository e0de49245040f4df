use actix_cors::Cors;
use actix_web::middleware::Compress;
use actix_web::{http::header, web, App, HttpServer};
use actix_web_prometheus::PrometheusMetricsBuilder;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod config;
pub mod jobs;
pub mod merge;
pub mod metrics;
pub mod state;

pub use crate::config::AppConfig;
pub use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str) -> Self {
        Self {
            error: error_type.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new("NotFound", message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new("BadRequest", message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new("Conflict", message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new("InternalServerError", message)
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::jobs::handlers::inspect_dataset,
        crate::jobs::handlers::create_job,
        crate::jobs::handlers::get_job,
        crate::jobs::handlers::job_events,
        crate::jobs::handlers::download_archive,
        crate::jobs::handlers::download_converted,
        crate::jobs::handlers::cancel_job,
        crate::jobs::handlers::pipeline_metrics
    ),
    components(
        schemas(
            jobs::models::CreateJobForm,
            jobs::models::InspectDatasetForm,
            jobs::models::DatasetInspection,
            jobs::models::JobCreated,
            jobs::models::JobSnapshot,
            ErrorResponse,
        )
    ),
    tags(
        (name = "Datasets", description = "Dataset inspection before a run."),
        (name = "Jobs", description = "Batch document generation jobs.")
    )
)]
pub struct ApiDoc;

fn cors(allowed_origins: &[String]) -> Cors {
    allowed_origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
        .expose_headers(vec![header::CONTENT_DISPOSITION])
        .max_age(3600)
}

pub async fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let app_state = AppState::new(config).context("invalid conversion command")?;
    let bind = (app_state.config.host.clone(), app_state.config.port);
    let app_state = web::Data::new(app_state);

    let prometheus = PrometheusMetricsBuilder::new("docmerge_server")
        .endpoint("/metrics")
        .build()
        .map_err(|e| anyhow::anyhow!("failed to create Prometheus metrics middleware: {e:?}"))?;

    log::info!(
        "Starting server at http://{}:{} (staging: {}, default batch size: {})",
        bind.0,
        bind.1,
        app_state.config.staging,
        app_state.config.default_batch_size
    );

    HttpServer::new(move || {
        let app_state = app_state.clone();
        let prometheus = prometheus.clone();
        let cors = cors(&app_state.config.allowed_origins);

        App::new()
            .wrap(Compress::default())
            .wrap(prometheus)
            .wrap(cors)
            .app_data(app_state)
            .service(web::scope("/api").configure(jobs::handlers::config))
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-doc/openapi.json", ApiDoc::openapi()))
    })
    .keep_alive(actix_web::http::KeepAlive::Os)
    .bind(bind)
    .context("failed to bind server address")?
    .run()
    .await
    .context("server error")
}
