use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::access::{AccessEvaluator, AccessMode};
use super::directory::UserDirectory;
use super::domain::{
    Assessment, AssessmentId, AssessmentStatus, AssessmentTree, IndicatorItemId, User, UserData,
    UserId,
};
use super::error::{ServiceError, Violation};
use super::lifecycle;
use super::payload::{CreateAssessmentRequest, SubmissionPatch, UpdateAssessmentRequest};
use super::report::{ReportAggregator, ReportItem};
use super::store::{CascadeSummary, MemoryStore, Tables};
use super::sync::TreeSynchronizer;
use super::uploads::{self, ImageStorage, ImageUpload, StagedImage};
use crate::config::AssessmentConfig;

/// Service composing the entity store, tree synchronizer, access evaluator and
/// lifecycle rules behind the operations exposed over HTTP.
pub struct AssessmentService<U, S> {
    store: Arc<MemoryStore>,
    directory: Arc<U>,
    images: Arc<S>,
    config: AssessmentConfig,
}

impl<U, S> AssessmentService<U, S>
where
    U: UserDirectory + 'static,
    S: ImageStorage + 'static,
{
    pub fn new(
        store: Arc<MemoryStore>,
        directory: Arc<U>,
        images: Arc<S>,
        config: AssessmentConfig,
    ) -> Self {
        Self {
            store,
            directory,
            images,
            config,
        }
    }

    /// Resolve the authenticated caller. Unknown and deactivated users look the same.
    pub fn resolve_actor(&self, actor_id: &UserId) -> Result<User, ServiceError> {
        self.directory
            .find(actor_id)?
            .filter(|user| user.is_active)
            .ok_or_else(|| ServiceError::NotFound("user".to_string()))
    }

    pub fn profile(&self, actor_id: &UserId) -> Result<User, ServiceError> {
        self.resolve_actor(actor_id)
    }

    /// Active directory users, for privileged callers assigning permissions.
    pub fn active_users(&self, actor: &User) -> Result<Vec<User>, ServiceError> {
        require_privileged(actor)?;
        Ok(self.directory.active_users()?)
    }

    /// Plain users only ever see published assessments.
    pub fn list_assessments(&self, actor: &User) -> Vec<Assessment> {
        self.store.read(|tables| {
            tables
                .assessments()
                .into_iter()
                .filter(|assessment| {
                    actor.is_privileged() || assessment.status == AssessmentStatus::Published
                })
                .cloned()
                .collect()
        })
    }

    pub fn create_assessment(
        &self,
        actor: &User,
        request: &CreateAssessmentRequest,
    ) -> Result<AssessmentTree, ServiceError> {
        require_privileged(actor)?;
        request.validate().map_err(ServiceError::Validation)?;
        self.check_users(request.referenced_users())?;

        let now = Utc::now();
        let tree = self.store.transaction(|tx| {
            let assessment_id = TreeSynchronizer::new(tx, now).create(
                &actor.id,
                request,
                &self.config.name_prefix,
            )?;
            committed_tree(tx, &assessment_id)
        })?;

        info!(
            assessment = %tree.assessment.id,
            name = %tree.assessment.name,
            actor = %actor.id,
            items = tree.items.len(),
            "assessment created"
        );
        Ok(tree)
    }

    /// Plain users may only read published assessments.
    pub fn get_assessment(
        &self,
        actor: &User,
        assessment_id: &AssessmentId,
    ) -> Result<AssessmentTree, ServiceError> {
        let tree = self
            .store
            .read(|tables| tables.tree(assessment_id))
            .ok_or_else(|| ServiceError::NotFound("assessment".to_string()))?;

        if !actor.is_privileged() && tree.assessment.status != AssessmentStatus::Published {
            return Err(ServiceError::Forbidden(
                "assessment is not published".to_string(),
            ));
        }
        Ok(tree)
    }

    pub fn update_assessment(
        &self,
        actor: &User,
        assessment_id: &AssessmentId,
        request: &UpdateAssessmentRequest,
    ) -> Result<AssessmentTree, ServiceError> {
        require_privileged(actor)?;
        request.validate().map_err(ServiceError::Validation)?;
        self.check_users(request.referenced_users())?;

        let now = Utc::now();
        let tree = self.store.transaction(|tx| {
            TreeSynchronizer::new(tx, now).update(assessment_id, request)?;
            committed_tree(tx, assessment_id)
        })?;

        info!(
            assessment = %assessment_id,
            actor = %actor.id,
            status = tree.assessment.status.label(),
            "assessment updated"
        );
        Ok(tree)
    }

    /// Cascade-delete an assessment, then remove image files its submissions referenced.
    pub fn delete_assessment(
        &self,
        actor: &User,
        assessment_id: &AssessmentId,
    ) -> Result<CascadeSummary, ServiceError> {
        require_privileged(actor)?;

        let summary = self
            .store
            .transaction(|tx| tx.delete_assessment(assessment_id))?;

        for file_name in &summary.orphaned_images {
            if let Err(error) = self.images.remove(file_name) {
                warn!(%file_name, %error, "failed to remove image of deleted assessment");
            }
        }

        info!(
            assessment = %assessment_id,
            actor = %actor.id,
            items = summary.assessment_items,
            indicators = summary.indicators,
            indicator_items = summary.indicator_items,
            submissions = summary.submissions,
            "assessment deleted"
        );
        Ok(summary)
    }

    /// The caller's own submission for an indicator item, if one exists.
    pub fn submission(
        &self,
        actor: &User,
        indicator_item_id: &IndicatorItemId,
    ) -> Result<Option<UserData>, ServiceError> {
        self.store.read(|tables| {
            require_item_access(tables, actor, indicator_item_id, AccessMode::View)?;
            Ok(tables.submission(&actor.id, indicator_item_id).cloned())
        })
    }

    /// Create or update the caller's submission. A status of `complete`, whether
    /// requested or already stored, is re-checked against the merged fields.
    pub fn save_submission(
        &self,
        actor: &User,
        indicator_item_id: &IndicatorItemId,
        patch: &SubmissionPatch,
    ) -> Result<UserData, ServiceError> {
        let now = Utc::now();
        let saved = self.store.transaction(|tx| {
            require_item_access(tx, actor, indicator_item_id, AccessMode::View)?;

            let stored = tx.submission(&actor.id, indicator_item_id).cloned();
            let target = patch
                .status
                .or_else(|| stored.as_ref().map(|row| row.status))
                .unwrap_or_default();
            lifecycle::check_submission_transition(stored.as_ref(), patch, target)?;

            let mut row = match &stored {
                Some(row) => row.clone(),
                None => UserData::draft(actor.id.clone(), *indicator_item_id, now),
            };
            if let Some(performance) = &patch.performance {
                row.performance = Some(performance.clone());
            }
            if let Some(rate) = &patch.rate {
                row.rate = Some(rate.clone());
            }
            if let Some(score) = &patch.score {
                row.score = Some(score.clone());
            }
            row.status = target;
            row.updated_at = now;

            if stored.is_some() {
                tx.update_submission(row.clone())?;
            } else {
                tx.insert_submission(row.clone())?;
            }
            Ok::<_, ServiceError>(row)
        })?;

        info!(
            indicator_item = %indicator_item_id,
            actor = %actor.id,
            status = saved.status.label(),
            "submission saved"
        );
        Ok(saved)
    }

    /// Attach an image to the caller's submission and return its stored file name.
    ///
    /// Access is checked before the upload is vetted or staged. Bytes are staged
    /// before the transaction and only promoted once the row that references them
    /// has committed. If promotion fails the row is put back the way it was.
    pub fn upload_image(
        &self,
        actor: &User,
        indicator_item_id: &IndicatorItemId,
        upload: &ImageUpload,
    ) -> Result<String, ServiceError> {
        self.store
            .read(|tables| require_item_access(tables, actor, indicator_item_id, AccessMode::View))?;

        let vetted = uploads::vet(upload)?;
        let now = Utc::now();
        let file_name = uploads::stored_file_name(
            &actor.id,
            indicator_item_id,
            now.timestamp(),
            &vetted.sanitized_name,
        );

        let staged = self.images.stage(&upload.bytes)?;
        let committed = self.store.transaction(|tx| {
            require_item_access(tx, actor, indicator_item_id, AccessMode::View)?;

            let prior = tx.submission(&actor.id, indicator_item_id).cloned();
            let mut row = prior
                .clone()
                .unwrap_or_else(|| UserData::draft(actor.id.clone(), *indicator_item_id, now));
            row.image_path = Some(file_name.clone());
            row.updated_at = now;
            if prior.is_some() {
                tx.update_submission(row)?;
            } else {
                tx.insert_submission(row)?;
            }
            Ok::<_, ServiceError>(prior)
        });

        let prior = match committed {
            Ok(prior) => prior,
            Err(error) => {
                self.discard_staged(&staged);
                return Err(error);
            }
        };

        if let Err(error) = self.images.promote(&staged, &file_name) {
            self.discard_staged(&staged);
            self.restore_submission(actor, indicator_item_id, &file_name, prior)?;
            warn!(
                indicator_item = %indicator_item_id,
                actor = %actor.id,
                %file_name,
                %error,
                "image promotion failed; submission restored"
            );
            return Err(error.into());
        }

        let previous = prior.and_then(|row| row.image_path);
        if let Some(previous) = previous.filter(|previous| *previous != file_name) {
            if let Err(error) = self.images.remove(&previous) {
                warn!(file_name = %previous, %error, "failed to remove replaced image");
            }
        }

        info!(
            indicator_item = %indicator_item_id,
            actor = %actor.id,
            %file_name,
            mime = %vetted.mime,
            bytes = upload.bytes.len(),
            "image uploaded"
        );
        Ok(file_name)
    }

    fn discard_staged(&self, staged: &StagedImage) {
        if let Err(error) = self.images.discard(staged) {
            warn!(key = %staged.key, %error, "failed to discard staged upload");
        }
    }

    /// Undo an upload whose file never reached storage. Rows changed since the
    /// upload committed are left alone.
    fn restore_submission(
        &self,
        actor: &User,
        indicator_item_id: &IndicatorItemId,
        file_name: &str,
        prior: Option<UserData>,
    ) -> Result<(), ServiceError> {
        self.store.transaction(|tx| {
            let Some(current) = tx.submission(&actor.id, indicator_item_id).cloned() else {
                return Ok(());
            };
            if current.image_path.as_deref() != Some(file_name) {
                return Ok(());
            }
            match prior {
                Some(prior) => tx.update_submission(prior)?,
                None => {
                    tx.delete_submission(&current.id)?;
                }
            }
            Ok::<_, ServiceError>(())
        })
    }

    /// Detach and remove the caller's image. Requires edit access.
    pub fn delete_image(
        &self,
        actor: &User,
        indicator_item_id: &IndicatorItemId,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let removed = self.store.transaction(|tx| {
            require_item_access(tx, actor, indicator_item_id, AccessMode::Edit)?;

            let mut row = tx
                .submission(&actor.id, indicator_item_id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound("image".to_string()))?;
            let file_name = row
                .image_path
                .take()
                .ok_or_else(|| ServiceError::NotFound("image".to_string()))?;
            row.updated_at = now;
            tx.update_submission(row)?;
            Ok::<_, ServiceError>(file_name)
        })?;

        if let Err(error) = self.images.remove(&removed) {
            warn!(file_name = %removed, %error, "failed to remove image file");
        }
        info!(
            indicator_item = %indicator_item_id,
            actor = %actor.id,
            file_name = %removed,
            "image deleted"
        );
        Ok(())
    }

    pub fn report(
        &self,
        actor: &User,
        assessment_id: &AssessmentId,
    ) -> Result<Vec<ReportItem>, ServiceError> {
        self.store.read(|tables| {
            ReportAggregator::new(tables, self.directory.as_ref()).build(actor, assessment_id)
        })
    }

    /// Every permission grant must name a user the directory knows about.
    fn check_users(&self, references: Vec<(String, UserId)>) -> Result<(), ServiceError> {
        let mut violations = Vec::new();
        for (field, user_id) in references {
            let known = self
                .directory
                .find(&user_id)?
                .is_some_and(|user| user.is_active);
            if !known {
                violations.push(Violation::new(field, format!("user {user_id} not found")));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Validation(violations))
        }
    }
}

fn require_privileged(actor: &User) -> Result<(), ServiceError> {
    if actor.is_privileged() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("insufficient permissions".to_string()))
    }
}

fn require_item_access(
    tables: &Tables,
    actor: &User,
    indicator_item_id: &IndicatorItemId,
    mode: AccessMode,
) -> Result<(), ServiceError> {
    let entry = tables
        .indicator_item(indicator_item_id)
        .ok_or_else(|| ServiceError::NotFound("indicator item".to_string()))?;
    AccessEvaluator::new(tables).require(actor, &entry.indicator_id, mode)
}

fn committed_tree(
    tables: &Tables,
    assessment_id: &AssessmentId,
) -> Result<AssessmentTree, ServiceError> {
    tables
        .tree(assessment_id)
        .ok_or_else(|| ServiceError::Internal(format!("assessment {assessment_id} vanished mid-write")))
}
