use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use assessment_hub::assessments::{
    assessment_router, AssessmentService, DirectoryError, ImageStorage, MemoryStore, Role,
    StagedImage, StorageError, User, UserDirectory, UserId, ACTOR_HEADER,
};
use assessment_hub::config::AssessmentConfig;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

struct StaticDirectory(HashMap<UserId, User>);

impl StaticDirectory {
    fn new(users: &[(&str, Role)]) -> Self {
        Self(
            users
                .iter()
                .map(|(id, role)| {
                    let user = User {
                        id: UserId(id.to_string()),
                        username: id.to_string(),
                        full_name: id.to_string(),
                        email: String::new(),
                        role: *role,
                        is_active: true,
                    };
                    (user.id.clone(), user)
                })
                .collect(),
        )
    }
}

impl UserDirectory for StaticDirectory {
    fn find(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self.0.get(id).cloned())
    }

    fn active_users(&self) -> Result<Vec<User>, DirectoryError> {
        Ok(self.0.values().cloned().collect())
    }
}

#[derive(Default)]
struct DiscardingImages {
    staged: Mutex<usize>,
}

impl ImageStorage for DiscardingImages {
    fn stage(&self, _bytes: &[u8]) -> Result<StagedImage, StorageError> {
        let mut staged = self.staged.lock().expect("image mutex poisoned");
        *staged += 1;
        Ok(StagedImage {
            key: format!("staged-{staged}"),
        })
    }

    fn promote(&self, _staged: &StagedImage, _file_name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn discard(&self, _staged: &StagedImage) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _file_name: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

fn app() -> Router {
    let service = AssessmentService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticDirectory::new(&[
            ("admin", Role::Admin),
            ("viewer", Role::User),
            ("stranger", Role::User),
        ])),
        Arc::new(DiscardingImages::default()),
        AssessmentConfig::default(),
    );
    assessment_router(Arc::new(service), 1024 * 1024)
}

async fn call(app: &Router, method: Method, uri: &str, actor: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(ACTOR_HEADER, actor);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).expect("json body")))
            .expect("request builds"),
        None => builder.body(Body::empty()).expect("request builds"),
    };

    let response = app.clone().oneshot(request).await.expect("route executes");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    (status, serde_json::from_slice(&body).expect("json payload"))
}

#[tokio::test]
async fn draft_to_published_lifecycle_controls_visibility() {
    let app = app();

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/assessments",
        "admin",
        Some(json!({
            "fiscal_year": 2025,
            "items": [{
                "title": "Teaching",
                "indicators": [{
                    "title": "Lesson planning",
                    "items": [{ "title": "Plans on time", "target_value": "100%" }],
                    "permissions": [{ "user_id": "viewer", "can_view": true }]
                }]
            }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["assessment"]["id"]
        .as_str()
        .expect("assessment id")
        .to_string();
    let path = format!("/api/assessments/{id}");

    let (status, tree) = call(&app, Method::GET, &path, "admin", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["assessment"]["items"][0]["title"], "Teaching");
    assert_eq!(
        tree["assessment"]["items"][0]["indicators"][0]["items"][0]["target_value"],
        "100%"
    );

    let (status, _) = call(&app, Method::GET, &path, "viewer", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, updated) = call(
        &app,
        Method::PUT,
        &path,
        "admin",
        Some(json!({ "status": "published" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["assessment"]["status"], "published");

    let (status, tree) = call(&app, Method::GET, &path, "viewer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["assessment"]["name"], "FY2025");

    let report_path = format!("/api/user-data/report/{id}");
    let (status, granted) = call(&app, Method::GET, &report_path, "viewer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(granted["report"].as_array().map(Vec::len), Some(1));

    let (status, ungranted) = call(&app, Method::GET, &report_path, "stranger", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ungranted["report"], json!([]));
}

#[tokio::test]
async fn same_fiscal_year_gets_suffixed_names() {
    let app = app();
    let mut names = Vec::new();
    for _ in 0..3 {
        let (status, created) = call(
            &app,
            Method::POST,
            "/api/assessments",
            "admin",
            Some(json!({ "fiscal_year": 2030 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        names.push(created["assessment"]["name"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(names, vec!["FY2030", "FY2030-1", "FY2030-2"]);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/assessments",
        "admin",
        Some(json!({ "items": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["violations"][0]["field"], "fiscal_year");
}
