use assessment_hub::assessments::{
    DirectoryError, ImageStorage, Role, StagedImage, StorageError, User, UserDirectory, UserId,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const STAGING_DIR: &str = ".staging";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Directory of users loaded once at startup from a JSON array of user records.
/// The map is read-only after construction.
#[derive(Default)]
pub(crate) struct InMemoryUserDirectory {
    users: HashMap<UserId, User>,
}

impl InMemoryUserDirectory {
    pub(crate) fn from_users(users: impl IntoIterator<Item = User>) -> Result<Self, DirectoryError> {
        let mut seeded = HashMap::new();
        for user in users {
            if user.id.is_blank() {
                return Err(DirectoryError::InvalidSeed(format!(
                    "user '{}' has a blank id",
                    user.username
                )));
            }
            if seeded.insert(user.id.clone(), user).is_some() {
                return Err(DirectoryError::InvalidSeed(
                    "duplicate user id in seed".to_string(),
                ));
            }
        }
        Ok(Self { users: seeded })
    }

    pub(crate) fn from_path(path: &Path) -> Result<Self, DirectoryError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            DirectoryError::InvalidSeed(format!("cannot read {}: {err}", path.display()))
        })?;
        let users: Vec<User> = serde_json::from_str(&raw).map_err(|err| {
            DirectoryError::InvalidSeed(format!("cannot parse {}: {err}", path.display()))
        })?;
        Self::from_users(users)
    }

    /// Single administrator used when no seed file is configured.
    pub(crate) fn bootstrap() -> Self {
        let admin = User {
            id: UserId("admin".to_string()),
            username: "admin".to_string(),
            full_name: "Administrator".to_string(),
            email: String::new(),
            role: Role::Admin,
            is_active: true,
        };
        Self {
            users: HashMap::from([(admin.id.clone(), admin)]),
        }
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn find(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self.users.get(id).cloned())
    }

    fn active_users(&self) -> Result<Vec<User>, DirectoryError> {
        let mut users: Vec<User> = self
            .users
            .values()
            .filter(|user| user.is_active)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

/// Stores images as plain files under the upload root. Staged bytes live in a
/// hidden sub-directory until they are renamed into place.
pub(crate) struct LocalImageStorage {
    root: PathBuf,
    staging: PathBuf,
}

impl LocalImageStorage {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        Ok(Self { root, staging })
    }

    fn staged_path(&self, staged: &StagedImage) -> PathBuf {
        self.staging.join(&staged.key)
    }

    /// Stored names are produced by the service and never contain separators;
    /// anything else is refused instead of resolved.
    fn final_path(&self, file_name: &str) -> Result<PathBuf, StorageError> {
        let plain = !file_name.is_empty()
            && !file_name.starts_with('.')
            && !file_name.contains(['/', '\\']);
        if plain {
            Ok(self.root.join(file_name))
        } else {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to touch '{file_name}'"),
            )))
        }
    }
}

impl ImageStorage for LocalImageStorage {
    fn stage(&self, bytes: &[u8]) -> Result<StagedImage, StorageError> {
        let staged = StagedImage {
            key: uuid::Uuid::new_v4().to_string(),
        };
        fs::write(self.staged_path(&staged), bytes)?;
        Ok(staged)
    }

    fn promote(&self, staged: &StagedImage, file_name: &str) -> Result<(), StorageError> {
        let source = self.staged_path(staged);
        if !source.exists() {
            return Err(StorageError::MissingStage(staged.key.clone()));
        }
        fs::rename(source, self.final_path(file_name)?)?;
        Ok(())
    }

    fn discard(&self, staged: &StagedImage) -> Result<(), StorageError> {
        match fs::remove_file(self.staged_path(staged)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, file_name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.final_path(file_name)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn staged_bytes_only_appear_after_promotion() {
        let root = TempDir::new().expect("temp dir");
        let storage = LocalImageStorage::new(root.path()).expect("storage ready");

        let staged = storage.stage(b"\x89PNG").expect("staged");
        assert!(!root.path().join("final.png").exists());

        storage.promote(&staged, "final.png").expect("promoted");
        assert_eq!(
            fs::read(root.path().join("final.png")).expect("file written"),
            b"\x89PNG"
        );
        assert!(matches!(
            storage.promote(&staged, "again.png"),
            Err(StorageError::MissingStage(_))
        ));
    }

    #[test]
    fn discard_and_remove_tolerate_missing_files() {
        let root = TempDir::new().expect("temp dir");
        let storage = LocalImageStorage::new(root.path()).expect("storage ready");

        let staged = storage.stage(b"GIF89a").expect("staged");
        storage.discard(&staged).expect("discarded");
        storage.discard(&staged).expect("second discard is a no-op");
        storage.remove("never-written.png").expect("missing file ignored");
    }

    #[test]
    fn path_like_names_are_refused() {
        let root = TempDir::new().expect("temp dir");
        let storage = LocalImageStorage::new(root.path()).expect("storage ready");
        let staged = storage.stage(b"GIF89a").expect("staged");

        assert!(storage.promote(&staged, "../escape.gif").is_err());
        assert!(storage.remove(".staging").is_err());
    }

    #[test]
    fn directory_seed_rejects_duplicates_and_blank_ids() {
        let root = TempDir::new().expect("temp dir");
        let seed = root.path().join("users.json");
        fs::write(
            &seed,
            serde_json::to_vec(&json!([
                { "id": "u-1", "username": "ana", "full_name": "Ana", "role": "Admin" },
                { "id": "u-2", "username": "ben", "full_name": "Ben", "role": "User", "is_active": false }
            ]))
            .expect("seed json"),
        )
        .expect("seed written");

        let directory = InMemoryUserDirectory::from_path(&seed).expect("seed loads");
        let active = directory.active_users().expect("listing works");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "ana");
        assert!(directory
            .find(&UserId("u-2".to_string()))
            .expect("lookup works")
            .is_some());

        let duplicate = InMemoryUserDirectory::from_users([
            InMemoryUserDirectory::bootstrap()
                .find(&UserId("admin".to_string()))
                .expect("lookup works")
                .expect("admin seeded"),
            InMemoryUserDirectory::bootstrap()
                .find(&UserId("admin".to_string()))
                .expect("lookup works")
                .expect("admin seeded"),
        ]);
        assert!(matches!(duplicate, Err(DirectoryError::InvalidSeed(_))));
    }
}
