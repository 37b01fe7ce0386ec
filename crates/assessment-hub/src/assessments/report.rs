use serde::Serialize;

use super::access::{AccessEvaluator, AccessMode};
use super::directory::{UserDirectory, UNKNOWN_USER};
use super::domain::{
    AssessmentId, AssessmentItemId, AssessmentStatus, IndicatorId, IndicatorItem,
    SubmissionStatus, User, UserData, UserId,
};
use super::error::ServiceError;
use super::store::Tables;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportItem {
    pub id: AssessmentItemId,
    pub title: String,
    pub order_index: u32,
    pub indicators: Vec<ReportIndicator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportIndicator {
    pub id: IndicatorId,
    pub title: String,
    pub order_index: u32,
    pub items: Vec<ReportEntry>,
    /// Resolved ACL, only present for privileged actors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<PermissionView>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub item: IndicatorItem,
    pub user_data: Vec<SubmissionView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionView {
    pub user_name: String,
    pub status: SubmissionStatus,
    pub data: UserData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionView {
    pub user_id: UserId,
    pub user_name: String,
    pub can_view: bool,
    pub can_edit: bool,
}

/// Read-only projection of a published assessment merged with submissions.
pub struct ReportAggregator<'a, D: ?Sized> {
    tables: &'a Tables,
    directory: &'a D,
}

impl<'a, D> ReportAggregator<'a, D>
where
    D: UserDirectory + ?Sized,
{
    pub fn new(tables: &'a Tables, directory: &'a D) -> Self {
        Self { tables, directory }
    }

    /// Unpublished or missing assessments are reported as not found for every role.
    pub fn build(
        &self,
        actor: &User,
        assessment_id: &AssessmentId,
    ) -> Result<Vec<ReportItem>, ServiceError> {
        let assessment = self
            .tables
            .assessment(assessment_id)
            .filter(|assessment| assessment.status == AssessmentStatus::Published)
            .ok_or_else(|| ServiceError::NotFound("published assessment".to_string()))?;

        let access = AccessEvaluator::new(self.tables);
        let mut report = Vec::new();

        for item in self.tables.assessment_items(&assessment.id) {
            let mut indicators = Vec::new();
            for indicator in self.tables.indicators(&item.id) {
                if !access.can_access(actor, &indicator.id, AccessMode::View) {
                    continue;
                }

                let mut entries = Vec::new();
                for entry in self.tables.indicator_items(&indicator.id) {
                    entries.push(ReportEntry {
                        item: entry.clone(),
                        user_data: self.submissions_for(actor, entry)?,
                    });
                }

                let permissions = if actor.is_privileged() {
                    Some(self.permissions_for(&indicator.id)?)
                } else {
                    None
                };

                indicators.push(ReportIndicator {
                    id: indicator.id,
                    title: indicator.title.clone(),
                    order_index: indicator.order_index,
                    items: entries,
                    permissions,
                });
            }

            if !indicators.is_empty() {
                report.push(ReportItem {
                    id: item.id,
                    title: item.title.clone(),
                    order_index: item.order_index,
                    indicators,
                });
            }
        }

        Ok(report)
    }

    fn submissions_for(
        &self,
        actor: &User,
        entry: &IndicatorItem,
    ) -> Result<Vec<SubmissionView>, ServiceError> {
        if !actor.is_privileged() {
            return Ok(self
                .tables
                .submission(&actor.id, &entry.id)
                .map(|row| SubmissionView {
                    user_name: actor.full_name.clone(),
                    status: row.status,
                    data: row.clone(),
                })
                .into_iter()
                .collect());
        }

        let mut views = Vec::new();
        for row in self.tables.submissions(&entry.id) {
            let user_name = self
                .directory
                .find(&row.user_id)?
                .map(|user| user.full_name)
                .unwrap_or_else(|| UNKNOWN_USER.to_string());
            views.push(SubmissionView {
                user_name,
                status: row.status,
                data: row.clone(),
            });
        }
        Ok(views)
    }

    /// Grants whose user no longer resolves are left out.
    fn permissions_for(&self, indicator_id: &IndicatorId) -> Result<Vec<PermissionView>, ServiceError> {
        let mut views = Vec::new();
        for grant in self.tables.permissions(indicator_id) {
            if let Some(user) = self.directory.find(&grant.user_id)? {
                views.push(PermissionView {
                    user_id: grant.user_id.clone(),
                    user_name: user.full_name,
                    can_view: grant.can_view,
                    can_edit: grant.can_edit,
                });
            }
        }
        Ok(views)
    }
}
