use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use serde_json::Value;

use crate::assessments::directory::{DirectoryError, UserDirectory};
use crate::assessments::domain::{Role, User, UserId};
use crate::assessments::payload::{CreateAssessmentRequest, UpdateAssessmentRequest};
use crate::assessments::store::MemoryStore;
use crate::assessments::uploads::{ImageStorage, StagedImage, StorageError};
use crate::assessments::{assessment_router, AssessmentService};
use crate::config::AssessmentConfig;

pub(super) const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

pub(super) fn person(id: &str, role: Role) -> User {
    User {
        id: UserId(id.to_string()),
        username: id.to_string(),
        full_name: format!("{} Example", id.to_uppercase()),
        email: format!("{id}@example.org"),
        role,
        is_active: true,
    }
}

pub(super) fn admin() -> User {
    person("admin", Role::Admin)
}

pub(super) fn moderator() -> User {
    person("mod", Role::Moderator)
}

pub(super) fn staff() -> User {
    person("staff", Role::User)
}

pub(super) fn outsider() -> User {
    person("outsider", Role::User)
}

pub(super) fn user_id(id: &str) -> UserId {
    UserId(id.to_string())
}

#[derive(Default)]
pub(super) struct MemoryDirectory {
    users: Mutex<HashMap<UserId, User>>,
}

impl MemoryDirectory {
    pub(super) fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let directory = Self::default();
        {
            let mut guard = directory.users.lock().expect("directory mutex poisoned");
            for user in users {
                guard.insert(user.id.clone(), user);
            }
        }
        directory
    }

    pub(super) fn deactivate(&self, id: &str) {
        if let Some(user) = self
            .users
            .lock()
            .expect("directory mutex poisoned")
            .get_mut(&user_id(id))
        {
            user.is_active = false;
        }
    }

    pub(super) fn forget(&self, id: &str) {
        self.users
            .lock()
            .expect("directory mutex poisoned")
            .remove(&user_id(id));
    }
}

impl UserDirectory for MemoryDirectory {
    fn find(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self
            .users
            .lock()
            .expect("directory mutex poisoned")
            .get(id)
            .cloned())
    }

    fn active_users(&self) -> Result<Vec<User>, DirectoryError> {
        let mut users: Vec<User> = self
            .users
            .lock()
            .expect("directory mutex poisoned")
            .values()
            .filter(|user| user.is_active)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

pub(super) struct UnavailableDirectory;

impl UserDirectory for UnavailableDirectory {
    fn find(&self, _id: &UserId) -> Result<Option<User>, DirectoryError> {
        Err(DirectoryError::Unavailable("identity provider offline".to_string()))
    }

    fn active_users(&self) -> Result<Vec<User>, DirectoryError> {
        Err(DirectoryError::Unavailable("identity provider offline".to_string()))
    }
}

/// Image storage double that keeps bytes in memory and records removals.
#[derive(Default)]
pub(super) struct MemoryImages {
    sequence: AtomicU64,
    staged: Mutex<HashMap<String, Vec<u8>>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    removed: Mutex<Vec<String>>,
    refuse_promotion: AtomicBool,
}

impl MemoryImages {
    pub(super) fn refuse_promotions(&self) {
        self.refuse_promotion.store(true, Ordering::Relaxed);
    }

    pub(super) fn files(&self) -> Vec<String> {
        self.files
            .lock()
            .expect("image mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(super) fn staged_count(&self) -> usize {
        self.staged.lock().expect("image mutex poisoned").len()
    }

    pub(super) fn removed(&self) -> Vec<String> {
        self.removed.lock().expect("image mutex poisoned").clone()
    }
}

impl ImageStorage for MemoryImages {
    fn stage(&self, bytes: &[u8]) -> Result<StagedImage, StorageError> {
        let key = format!("stage-{}", self.sequence.fetch_add(1, Ordering::Relaxed));
        self.staged
            .lock()
            .expect("image mutex poisoned")
            .insert(key.clone(), bytes.to_vec());
        Ok(StagedImage { key })
    }

    fn promote(&self, staged: &StagedImage, file_name: &str) -> Result<(), StorageError> {
        if self.refuse_promotion.load(Ordering::Relaxed) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        let bytes = self
            .staged
            .lock()
            .expect("image mutex poisoned")
            .remove(&staged.key)
            .ok_or_else(|| StorageError::MissingStage(staged.key.clone()))?;
        self.files
            .lock()
            .expect("image mutex poisoned")
            .insert(file_name.to_string(), bytes);
        Ok(())
    }

    fn discard(&self, staged: &StagedImage) -> Result<(), StorageError> {
        self.staged
            .lock()
            .expect("image mutex poisoned")
            .remove(&staged.key);
        Ok(())
    }

    fn remove(&self, file_name: &str) -> Result<(), StorageError> {
        self.files
            .lock()
            .expect("image mutex poisoned")
            .remove(file_name);
        self.removed
            .lock()
            .expect("image mutex poisoned")
            .push(file_name.to_string());
        Ok(())
    }
}

pub(super) type TestService = AssessmentService<MemoryDirectory, MemoryImages>;

pub(super) struct Harness {
    pub(super) service: Arc<TestService>,
    pub(super) store: Arc<MemoryStore>,
    pub(super) directory: Arc<MemoryDirectory>,
    pub(super) images: Arc<MemoryImages>,
}

pub(super) fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::with_users([
        admin(),
        moderator(),
        staff(),
        outsider(),
    ]));
    let images = Arc::new(MemoryImages::default());
    let service = Arc::new(AssessmentService::new(
        store.clone(),
        directory.clone(),
        images.clone(),
        AssessmentConfig::default(),
    ));
    Harness {
        service,
        store,
        directory,
        images,
    }
}

pub(super) fn router(harness: &Harness) -> axum::Router {
    assessment_router(harness.service.clone(), 1024 * 1024)
}

pub(super) fn create_request(value: Value) -> CreateAssessmentRequest {
    serde_json::from_value(value).expect("create payload parses")
}

pub(super) fn update_request(value: Value) -> UpdateAssessmentRequest {
    serde_json::from_value(value).expect("update payload parses")
}

/// One item, one indicator, one indicator item. `grants` become the indicator's ACL.
pub(super) fn single_path_request(grants: Value) -> CreateAssessmentRequest {
    create_request(serde_json::json!({
        "fiscal_year": 2025,
        "items": [{
            "title": "Teaching quality",
            "indicators": [{
                "title": "Lesson planning",
                "items": [{
                    "title": "Plans submitted on time",
                    "target_value": "100%",
                    "actual_target": "95%"
                }],
                "permissions": grants
            }]
        }]
    }))
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
