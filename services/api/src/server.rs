use crate::cli::ServeArgs;
use crate::infra::{AppState, InMemoryUserDirectory, LocalImageStorage};
use crate::routes::with_assessment_routes;
use assessment_hub::assessments::{AssessmentService, MemoryStore, ACTOR_HEADER};
use assessment_hub::config::AppConfig;
use assessment_hub::error::AppError;
use assessment_hub::telemetry;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(upload_dir) = args.upload_dir.take() {
        config.storage.upload_dir = upload_dir;
    }
    if let Some(users_file) = args.users_file.take() {
        config.storage.users_file = Some(users_file);
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let directory = match &config.storage.users_file {
        Some(path) => {
            let directory = InMemoryUserDirectory::from_path(path)?;
            info!(path = %path.display(), "user directory seeded");
            directory
        }
        None => {
            warn!("no users file configured; only the bootstrap admin can sign in");
            InMemoryUserDirectory::bootstrap()
        }
    };
    let images = LocalImageStorage::new(&config.storage.upload_dir)?;

    let service = Arc::new(AssessmentService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(directory),
        Arc::new(images),
        config.assessments.clone(),
    ));

    let app = with_assessment_routes(service, config.storage.max_upload_bytes)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    warn!(
        header = ACTOR_HEADER,
        "caller identity is taken from the request header; serve behind an authenticating proxy"
    );

    info!(
        ?config.environment,
        %addr,
        upload_dir = %config.storage.upload_dir.display(),
        "assessment hub ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
