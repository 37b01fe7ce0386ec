use super::domain::{User, UserId};

/// Lookup of users owned by the identity system. Credentials never pass through here.
pub trait UserDirectory: Send + Sync {
    fn find(&self, id: &UserId) -> Result<Option<User>, DirectoryError>;
    fn active_users(&self) -> Result<Vec<User>, DirectoryError>;
}

/// Error enumeration for directory failures.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid directory seed: {0}")]
    InvalidSeed(String),
}

/// Display name used when a referenced user is missing from the directory.
pub(crate) const UNKNOWN_USER: &str = "Unknown";
