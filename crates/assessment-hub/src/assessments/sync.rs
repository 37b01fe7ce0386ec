//! Builds assessment trees from nested payloads and reconciles existing trees
//! against partial ones. Runs entirely inside a caller-provided transaction.

use chrono::{DateTime, Utc};

use super::domain::{
    Assessment, AssessmentId, AssessmentItem, AssessmentItemId, AssessmentStatus, Indicator,
    IndicatorId, IndicatorItem, IndicatorItemId, PermissionId, UserId, UserPermission,
};
use super::error::{ServiceError, Violation};
use super::lifecycle;
use super::payload::{
    kept_title, AssessmentItemPatch, CreateAssessmentRequest, IndicatorItemPatch, IndicatorPatch,
    NewIndicator, PermissionGrant, UpdateAssessmentRequest,
};
use super::store::{Tables, Transaction};

const TITLE_REQUIRED: &str = "title is required for new entries";
const NO_INDEX_LEFT: &str = "no order index is left after the last sibling";

/// First free name of the form `{prefix}{year}`, then `{prefix}{year}-1`, `-2`, ...
pub fn next_available_name(tables: &Tables, prefix: &str, fiscal_year: i32) -> String {
    let base = format!("{prefix}{fiscal_year}");
    let mut name = base.clone();
    let mut counter = 1u32;
    while tables.name_taken(&name) {
        name = format!("{base}-{counter}");
        counter += 1;
    }
    name
}

/// Slot after the highest taken index; `None` once `u32::MAX` is occupied.
fn next_index(taken: impl IntoIterator<Item = u32>) -> Option<u32> {
    match taken.into_iter().max() {
        Some(max) => max.checked_add(1),
        None => Some(0),
    }
}

/// Title for an entry about to be inserted; blank titles count as missing.
fn new_title(title: &Option<String>) -> Option<String> {
    title
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
}

pub struct TreeSynchronizer<'t, 'a> {
    tx: &'t mut Transaction<'a>,
    now: DateTime<Utc>,
}

impl<'t, 'a> TreeSynchronizer<'t, 'a> {
    pub fn new(tx: &'t mut Transaction<'a>, now: DateTime<Utc>) -> Self {
        Self { tx, now }
    }

    /// Insert a whole tree. Entries without a title are skipped and retained siblings
    /// are numbered 0..n in input order.
    pub fn create(
        &mut self,
        creator: &UserId,
        request: &CreateAssessmentRequest,
        name_prefix: &str,
    ) -> Result<AssessmentId, ServiceError> {
        let fiscal_year = request
            .fiscal_year
            .ok_or_else(|| ServiceError::invalid("fiscal_year", "fiscal year is required"))?;

        let assessment = Assessment {
            id: AssessmentId::new(),
            name: next_available_name(&**self.tx, name_prefix, fiscal_year),
            fiscal_year,
            status: AssessmentStatus::Draft,
            created_by: creator.clone(),
            created_at: self.now,
            updated_at: self.now,
        };
        let assessment_id = assessment.id;
        self.tx.insert_assessment(assessment)?;

        let items = request
            .items
            .iter()
            .filter_map(|item| kept_title(&item.title).map(|title| (title, item)));
        for (order_index, (title, item)) in (0u32..).zip(items) {
            let item_id = AssessmentItemId::new();
            self.tx.insert_assessment_item(AssessmentItem {
                id: item_id,
                assessment_id,
                title: title.to_string(),
                order_index,
                created_at: self.now,
            })?;

            let indicators = item
                .indicators
                .iter()
                .filter_map(|indicator| kept_title(&indicator.title).map(|title| (title, indicator)));
            for (order_index, (title, indicator)) in (0u32..).zip(indicators) {
                self.create_indicator(item_id, order_index, title, indicator)?;
            }
        }

        Ok(assessment_id)
    }

    fn create_indicator(
        &mut self,
        item_id: AssessmentItemId,
        order_index: u32,
        title: &str,
        payload: &NewIndicator,
    ) -> Result<(), ServiceError> {
        let indicator_id = IndicatorId::new();
        self.tx.insert_indicator(Indicator {
            id: indicator_id,
            assessment_item_id: item_id,
            title: title.to_string(),
            order_index,
            created_at: self.now,
        })?;

        let entries = payload
            .items
            .iter()
            .filter_map(|entry| kept_title(&entry.title).map(|title| (title, entry)));
        for (order_index, (title, entry)) in (0u32..).zip(entries) {
            self.tx.insert_indicator_item(IndicatorItem {
                id: IndicatorItemId::new(),
                indicator_id,
                title: title.to_string(),
                target_value: entry.target_value.clone(),
                actual_target: entry.actual_target.clone(),
                order_index,
                created_at: self.now,
            })?;
        }

        for grant in &payload.permissions {
            if let Some(user) = grant.user() {
                self.tx.insert_permission(UserPermission {
                    id: PermissionId::new(),
                    user_id: user.clone(),
                    indicator_id,
                    can_view: grant.can_view,
                    can_edit: grant.can_edit,
                    created_at: self.now,
                })?;
            }
        }

        Ok(())
    }

    /// Additive reconcile: matched children are mutated, unmatched ones inserted, and
    /// nothing absent from the payload is removed. A requested status is checked
    /// against the resulting tree before it is written.
    pub fn update(
        &mut self,
        assessment_id: &AssessmentId,
        request: &UpdateAssessmentRequest,
    ) -> Result<(), ServiceError> {
        let mut assessment = self
            .tx
            .assessment(assessment_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound("assessment".to_string()))?;

        let mut violations = Vec::new();
        for (pos, patch) in request.items.iter().flatten().enumerate() {
            self.sync_item(assessment_id, patch, &format!("items[{pos}]"), &mut violations)?;
        }
        if !violations.is_empty() {
            return Err(ServiceError::Validation(violations));
        }

        if let Some(status) = request.status {
            lifecycle::check_assessment_transition(&**self.tx, assessment_id, status)?;
            assessment.status = status;
        }
        assessment.updated_at = self.now;
        self.tx.update_assessment(assessment)?;
        Ok(())
    }

    fn sync_item(
        &mut self,
        assessment_id: &AssessmentId,
        patch: &AssessmentItemPatch,
        path: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<(), ServiceError> {
        let matched = match (patch.id, patch.order_index) {
            (Some(id), _) => Some(
                self.tx
                    .assessment_item(&id)
                    .filter(|item| item.assessment_id == *assessment_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::NotFound(format!("assessment item {id}")))?,
            ),
            (None, Some(order_index)) => self.tx.assessment_item_at(assessment_id, order_index).cloned(),
            (None, None) => None,
        };

        let item_id = match matched {
            Some(mut item) => {
                if let Some(title) = &patch.title {
                    item.title = title.clone();
                }
                if let Some(order_index) = patch.order_index {
                    item.order_index = order_index;
                }
                let item_id = item.id;
                self.tx.update_assessment_item(item)?;
                item_id
            }
            None => {
                let Some(title) = new_title(&patch.title) else {
                    violations.push(Violation::new(format!("{path}.title"), TITLE_REQUIRED));
                    return Ok(());
                };
                let order_index = match patch.order_index {
                    Some(order_index) => Some(order_index),
                    None => next_index(
                        self.tx
                            .assessment_items(assessment_id)
                            .iter()
                            .map(|item| item.order_index),
                    ),
                };
                let Some(order_index) = order_index else {
                    violations.push(Violation::new(format!("{path}.order_index"), NO_INDEX_LEFT));
                    return Ok(());
                };
                let item_id = AssessmentItemId::new();
                self.tx.insert_assessment_item(AssessmentItem {
                    id: item_id,
                    assessment_id: *assessment_id,
                    title,
                    order_index,
                    created_at: self.now,
                })?;
                item_id
            }
        };

        for (pos, indicator) in patch.indicators.iter().flatten().enumerate() {
            let indicator_path = format!("{path}.indicators[{pos}]");
            self.sync_indicator(&item_id, indicator, &indicator_path, violations)?;
        }
        Ok(())
    }

    fn sync_indicator(
        &mut self,
        item_id: &AssessmentItemId,
        patch: &IndicatorPatch,
        path: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<(), ServiceError> {
        let matched = match (patch.id, patch.order_index) {
            (Some(id), _) => Some(
                self.tx
                    .indicator(&id)
                    .filter(|indicator| indicator.assessment_item_id == *item_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::NotFound(format!("indicator {id}")))?,
            ),
            (None, Some(order_index)) => self.tx.indicator_at(item_id, order_index).cloned(),
            (None, None) => None,
        };

        let indicator_id = match matched {
            Some(mut indicator) => {
                if let Some(title) = &patch.title {
                    indicator.title = title.clone();
                }
                if let Some(order_index) = patch.order_index {
                    indicator.order_index = order_index;
                }
                let indicator_id = indicator.id;
                self.tx.update_indicator(indicator)?;
                indicator_id
            }
            None => {
                let Some(title) = new_title(&patch.title) else {
                    violations.push(Violation::new(format!("{path}.title"), TITLE_REQUIRED));
                    return Ok(());
                };
                let order_index = match patch.order_index {
                    Some(order_index) => Some(order_index),
                    None => next_index(
                        self.tx
                            .indicators(item_id)
                            .iter()
                            .map(|indicator| indicator.order_index),
                    ),
                };
                let Some(order_index) = order_index else {
                    violations.push(Violation::new(format!("{path}.order_index"), NO_INDEX_LEFT));
                    return Ok(());
                };
                let indicator_id = IndicatorId::new();
                self.tx.insert_indicator(Indicator {
                    id: indicator_id,
                    assessment_item_id: *item_id,
                    title,
                    order_index,
                    created_at: self.now,
                })?;
                indicator_id
            }
        };

        for (pos, entry) in patch.items.iter().flatten().enumerate() {
            let entry_path = format!("{path}.items[{pos}]");
            self.sync_indicator_item(&indicator_id, entry, &entry_path, violations)?;
        }
        for grant in patch.permissions.iter().flatten() {
            self.sync_permission(&indicator_id, grant)?;
        }
        Ok(())
    }

    fn sync_indicator_item(
        &mut self,
        indicator_id: &IndicatorId,
        patch: &IndicatorItemPatch,
        path: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<(), ServiceError> {
        let matched = match (patch.id, patch.order_index) {
            (Some(id), _) => Some(
                self.tx
                    .indicator_item(&id)
                    .filter(|entry| entry.indicator_id == *indicator_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::NotFound(format!("indicator item {id}")))?,
            ),
            (None, Some(order_index)) => {
                self.tx.indicator_item_at(indicator_id, order_index).cloned()
            }
            (None, None) => None,
        };

        match matched {
            Some(mut entry) => {
                if let Some(title) = &patch.title {
                    entry.title = title.clone();
                }
                if let Some(order_index) = patch.order_index {
                    entry.order_index = order_index;
                }
                if patch.target_value.is_some() {
                    entry.target_value = patch.target_value.clone();
                }
                if patch.actual_target.is_some() {
                    entry.actual_target = patch.actual_target.clone();
                }
                self.tx.update_indicator_item(entry)?;
            }
            None => {
                let Some(title) = new_title(&patch.title) else {
                    violations.push(Violation::new(format!("{path}.title"), TITLE_REQUIRED));
                    return Ok(());
                };
                let order_index = match patch.order_index {
                    Some(order_index) => Some(order_index),
                    None => next_index(
                        self.tx
                            .indicator_items(indicator_id)
                            .iter()
                            .map(|entry| entry.order_index),
                    ),
                };
                let Some(order_index) = order_index else {
                    violations.push(Violation::new(format!("{path}.order_index"), NO_INDEX_LEFT));
                    return Ok(());
                };
                self.tx.insert_indicator_item(IndicatorItem {
                    id: IndicatorItemId::new(),
                    indicator_id: *indicator_id,
                    title,
                    target_value: patch.target_value.clone(),
                    actual_target: patch.actual_target.clone(),
                    order_index,
                    created_at: self.now,
                })?;
            }
        }
        Ok(())
    }

    fn sync_permission(
        &mut self,
        indicator_id: &IndicatorId,
        grant: &PermissionGrant,
    ) -> Result<(), ServiceError> {
        let Some(user) = grant.user() else {
            return Ok(());
        };

        match self.tx.permission(user, indicator_id).cloned() {
            Some(mut existing) => {
                existing.can_view = grant.can_view;
                existing.can_edit = grant.can_edit;
                self.tx.update_permission(existing)?;
            }
            None => {
                self.tx.insert_permission(UserPermission {
                    id: PermissionId::new(),
                    user_id: user.clone(),
                    indicator_id: *indicator_id,
                    can_view: grant.can_view,
                    can_edit: grant.can_edit,
                    created_at: self.now,
                })?;
            }
        }
        Ok(())
    }
}
