use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, Multipart, Path, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tracing::error;

use super::directory::UserDirectory;
use super::domain::{AssessmentId, IndicatorItemId, User, UserId};
use super::error::ServiceError;
use super::payload::{CreateAssessmentRequest, SubmissionPatch, UpdateAssessmentRequest};
use super::service::AssessmentService;
use super::uploads::{ImageStorage, ImageUpload};

/// Header carrying the id of the caller, set by the upstream authentication layer.
///
/// The value is trusted as sent. The router must only be reachable through a
/// proxy that authenticates callers and overwrites this header.
pub const ACTOR_HEADER: &str = "x-actor-id";

type SharedService<U, S> = Arc<AssessmentService<U, S>>;

/// Router builder exposing the assessment, submission and report endpoints.
pub fn assessment_router<U, S>(service: SharedService<U, S>, max_upload_bytes: usize) -> Router
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    Router::new()
        .route("/api/auth/profile", get(profile_handler::<U, S>))
        .route("/api/auth/users", get(users_handler::<U, S>))
        .route(
            "/api/assessments",
            get(list_handler::<U, S>).post(create_handler::<U, S>),
        )
        .route(
            "/api/assessments/:assessment_id",
            get(detail_handler::<U, S>)
                .put(update_handler::<U, S>)
                .delete(delete_handler::<U, S>),
        )
        .route(
            "/api/user-data/report/:assessment_id",
            get(report_handler::<U, S>),
        )
        .route(
            "/api/user-data/:indicator_item_id",
            get(submission_handler::<U, S>).post(save_submission_handler::<U, S>),
        )
        .route(
            "/api/user-data/:indicator_item_id/upload",
            post(upload_handler::<U, S>),
        )
        .route(
            "/api/user-data/:indicator_item_id/delete",
            delete(delete_image_handler::<U, S>),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(service)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }

        let payload = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "violations": self.violations(),
        });
        (status, Json(payload)).into_response()
    }
}

/// Caller id taken from [`ACTOR_HEADER`]. A missing or blank header is rejected with 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorId(pub UserId);

#[axum::async_trait]
impl<T> FromRequestParts<T> for ActorId
where
    T: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &T) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match actor {
            Some(actor) => Ok(ActorId(UserId(actor.to_string()))),
            None => {
                let payload = json!({
                    "error": "authentication required",
                    "kind": "unauthenticated",
                    "violations": [],
                });
                Err((StatusCode::UNAUTHORIZED, Json(payload)).into_response())
            }
        }
    }
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::NotFound(what.to_string()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ServiceError::invalid("body", rejection.body_text()))
}

fn actor<U, S>(service: &SharedService<U, S>, ActorId(id): &ActorId) -> Result<User, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    service.resolve_actor(id)
}

pub(crate) async fn profile_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let user = service.profile(&actor_id.0)?;
    Ok((StatusCode::OK, Json(json!({ "user": user }))).into_response())
}

pub(crate) async fn users_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let users = service.active_users(&actor)?;
    Ok((StatusCode::OK, Json(json!({ "users": users }))).into_response())
}

pub(crate) async fn list_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let assessments = service.list_assessments(&actor);
    Ok((StatusCode::OK, Json(json!({ "assessments": assessments }))).into_response())
}

pub(crate) async fn create_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    payload: Result<Json<CreateAssessmentRequest>, JsonRejection>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let request = json_body(payload)?;
    let tree = service.create_assessment(&actor, &request)?;
    let payload = json!({
        "message": "assessment created",
        "assessment": tree,
    });
    Ok((StatusCode::CREATED, Json(payload)).into_response())
}

pub(crate) async fn detail_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(assessment_id): Path<String>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: AssessmentId = parse_id(&assessment_id, "assessment")?;
    let tree = service.get_assessment(&actor, &id)?;
    Ok((StatusCode::OK, Json(json!({ "assessment": tree }))).into_response())
}

pub(crate) async fn update_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(assessment_id): Path<String>,
    payload: Result<Json<UpdateAssessmentRequest>, JsonRejection>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: AssessmentId = parse_id(&assessment_id, "assessment")?;
    let request = json_body(payload)?;
    let tree = service.update_assessment(&actor, &id, &request)?;
    let payload = json!({
        "message": "assessment updated",
        "assessment": tree,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn delete_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(assessment_id): Path<String>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: AssessmentId = parse_id(&assessment_id, "assessment")?;
    service.delete_assessment(&actor, &id)?;
    Ok((StatusCode::OK, Json(json!({ "message": "assessment deleted" }))).into_response())
}

pub(crate) async fn submission_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(indicator_item_id): Path<String>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: IndicatorItemId = parse_id(&indicator_item_id, "indicator item")?;
    let row = service.submission(&actor, &id)?;
    Ok((StatusCode::OK, Json(json!({ "user_data": row }))).into_response())
}

pub(crate) async fn save_submission_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(indicator_item_id): Path<String>,
    payload: Result<Json<SubmissionPatch>, JsonRejection>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: IndicatorItemId = parse_id(&indicator_item_id, "indicator item")?;
    let patch = json_body(payload)?;
    let row = service.save_submission(&actor, &id, &patch)?;
    let payload = json!({
        "message": "data saved",
        "user_data": row,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn upload_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(indicator_item_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: IndicatorItemId = parse_id(&indicator_item_id, "indicator item")?;

    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(rejection) => return Ok(multipart_failure(rejection.status(), rejection.body_text())),
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(rejection) => return Ok(multipart_failure(rejection.status(), rejection.body_text())),
        };
        upload = Some(ImageUpload {
            file_name,
            bytes: bytes.to_vec(),
        });
        break;
    }

    let upload = upload.ok_or_else(|| ServiceError::invalid("file", "no file part"))?;
    let image_path = service.upload_image(&actor, &id, &upload)?;
    let payload = json!({
        "message": "image uploaded",
        "image_path": image_path,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

fn multipart_failure(status: StatusCode, message: String) -> Response {
    let payload = json!({
        "error": message,
        "kind": "validation_error",
        "violations": [{ "field": "file", "message": "upload could not be read" }],
    });
    (status, Json(payload)).into_response()
}

pub(crate) async fn delete_image_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(indicator_item_id): Path<String>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: IndicatorItemId = parse_id(&indicator_item_id, "indicator item")?;
    service.delete_image(&actor, &id)?;
    Ok((StatusCode::OK, Json(json!({ "message": "image deleted" }))).into_response())
}

pub(crate) async fn report_handler<U, S>(
    State(service): State<SharedService<U, S>>,
    actor_id: ActorId,
    Path(assessment_id): Path<String>,
) -> Result<Response, ServiceError>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    let actor = actor(&service, &actor_id)?;
    let id: AssessmentId = parse_id(&assessment_id, "published assessment")?;
    let report = service.report(&actor, &id)?;
    Ok((StatusCode::OK, Json(json!({ "report": report }))).into_response())
}
