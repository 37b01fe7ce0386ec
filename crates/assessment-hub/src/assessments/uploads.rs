//! Image attachments for submissions: what gets accepted and what it is stored as.
//!
//! Byte persistence belongs to an [`ImageStorage`] implementation. The service stages
//! bytes before its transaction, promotes them under the final name after commit, and
//! discards the staged copy when the transaction fails.

use mime::Mime;

use super::domain::{IndicatorItemId, UserId};
use super::error::ServiceError;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// Multipart file as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Handle to bytes written to a temporary location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub key: String,
}

/// Byte storage for uploaded images, rooted at the configured upload directory.
pub trait ImageStorage: Send + Sync {
    fn stage(&self, bytes: &[u8]) -> Result<StagedImage, StorageError>;
    fn promote(&self, staged: &StagedImage, file_name: &str) -> Result<(), StorageError>;
    fn discard(&self, staged: &StagedImage) -> Result<(), StorageError>;
    fn remove(&self, file_name: &str) -> Result<(), StorageError>;
}

/// Error enumeration for storage backend failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("staged upload {0} is missing")]
    MissingStage(String),
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload accepted for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VettedImage {
    pub(crate) sanitized_name: String,
    pub(crate) mime: Mime,
}

/// Check extension, MIME mapping and content signature of an upload.
pub(crate) fn vet(upload: &ImageUpload) -> Result<VettedImage, ServiceError> {
    let raw = upload.file_name.trim();
    if raw.is_empty() {
        return Err(ServiceError::invalid("file", "no file selected"));
    }
    if upload.bytes.is_empty() {
        return Err(ServiceError::invalid("file", "file is empty"));
    }

    let (stem, extension) = match raw.rsplit_once('.') {
        Some((stem, extension)) => (stem, extension.to_ascii_lowercase()),
        None => return Err(invalid_type()),
    };
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(invalid_type());
    }

    let mime = mime_guess::from_ext(&extension)
        .first()
        .filter(|guess| guess.type_() == mime::IMAGE)
        .ok_or_else(invalid_type)?;
    if !matches_signature(&mime, &upload.bytes) {
        return Err(ServiceError::invalid("file", "invalid image file"));
    }

    let stem = sanitize(stem);
    let stem = if stem.is_empty() { "image".to_string() } else { stem };

    Ok(VettedImage {
        sanitized_name: format!("{stem}.{extension}"),
        mime,
    })
}

fn invalid_type() -> ServiceError {
    ServiceError::invalid(
        "file",
        "invalid file type, only PNG, JPG, JPEG, GIF are allowed",
    )
}

/// Keep ASCII letters, digits, `.`, `_` and `-`; path separators and whitespace become `_`.
pub fn sanitize(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    filtered.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn matches_signature(mime: &Mime, bytes: &[u8]) -> bool {
    if *mime == mime::IMAGE_PNG {
        bytes.starts_with(b"\x89PNG\r\n\x1a\n")
    } else if *mime == mime::IMAGE_JPEG {
        bytes.starts_with(&[0xFF, 0xD8, 0xFF])
    } else if *mime == mime::IMAGE_GIF {
        bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")
    } else {
        false
    }
}

/// `{actor}_{indicator item}_{unix seconds}_{sanitized original name}`
pub fn stored_file_name(
    actor: &UserId,
    indicator_item: &IndicatorItemId,
    unix_timestamp: i64,
    sanitized_name: &str,
) -> String {
    format!(
        "{}_{}_{}_{}",
        sanitize(&actor.0),
        indicator_item,
        unix_timestamp,
        sanitized_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn upload(name: &str, bytes: &[u8]) -> ImageUpload {
        ImageUpload {
            file_name: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn sanitize_strips_paths_and_unsafe_characters() {
        assert_eq!(sanitize("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize("my photo (1)"), "my_photo_1");
        assert_eq!(sanitize("รูปภาพ"), "");
    }

    #[test]
    fn vet_accepts_whitelisted_images() {
        let vetted = vet(&upload("Site Visit.PNG", PNG)).expect("png accepted");
        assert_eq!(vetted.sanitized_name, "Site_Visit.png");
        assert_eq!(vetted.mime, mime::IMAGE_PNG);

        let gif = vet(&upload("chart.gif", b"GIF89a....")).expect("gif accepted");
        assert_eq!(gif.mime, mime::IMAGE_GIF);
    }

    #[test]
    fn vet_falls_back_to_generic_stem_for_non_ascii_names() {
        let vetted = vet(&upload("รูปภาพ.jpg", &[0xFF, 0xD8, 0xFF, 0xE0])).expect("jpeg accepted");
        assert_eq!(vetted.sanitized_name, "image.jpg");
    }

    #[test]
    fn vet_rejects_other_types_and_mismatched_content() {
        assert!(matches!(
            vet(&upload("report.pdf", b"%PDF-1.7")),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            vet(&upload("noextension", PNG)),
            Err(ServiceError::Validation(_))
        ));
        let error = vet(&upload("fake.png", b"GIF89a")).expect_err("signature mismatch");
        assert_eq!(error.violations()[0].message, "invalid image file");
    }

    #[test]
    fn stored_names_embed_actor_item_and_timestamp() {
        let item = IndicatorItemId::new();
        let name = stored_file_name(&UserId("u-7".to_string()), &item, 1_700_000_000, "a.png");
        assert_eq!(name, format!("u-7_{item}_1700000000_a.png"));
    }
}
