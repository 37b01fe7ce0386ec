//! Assessment trees, per-indicator access control and user submissions.
//!
//! An assessment owns items, items own indicators, and indicators own indicator
//! items. Plain users reach indicators only through explicit grants; admins and
//! moderators bypass them. Submissions attach performance data and an optional
//! image to an indicator item, one per user.

pub mod access;
pub mod directory;
pub mod domain;
pub mod error;
pub(crate) mod lifecycle;
pub mod payload;
pub mod report;
pub mod router;
pub mod service;
pub mod store;
pub mod sync;
pub mod uploads;

#[cfg(test)]
mod tests;

pub use access::{AccessEvaluator, AccessMode};
pub use directory::{DirectoryError, UserDirectory};
pub use domain::{
    Assessment, AssessmentId, AssessmentItem, AssessmentItemId, AssessmentItemNode,
    AssessmentStatus, AssessmentTree, Indicator, IndicatorId, IndicatorItem, IndicatorItemId,
    IndicatorNode, PermissionId, Role, SubmissionId, SubmissionStatus, User, UserData, UserId,
    UserPermission,
};
pub use error::{ServiceError, Violation};
pub use payload::{
    AssessmentItemPatch, CreateAssessmentRequest, IndicatorItemPatch, IndicatorPatch,
    NewAssessmentItem, NewIndicator, NewIndicatorItem, PermissionGrant, SubmissionPatch,
    UpdateAssessmentRequest,
};
pub use report::{PermissionView, ReportEntry, ReportIndicator, ReportItem, SubmissionView};
pub use router::{assessment_router, ActorId, ACTOR_HEADER};
pub use service::AssessmentService;
pub use store::{CascadeSummary, MemoryStore, StoreError, Tables, Transaction};
pub use uploads::{ImageStorage, ImageUpload, StagedImage, StorageError, ALLOWED_EXTENSIONS};
