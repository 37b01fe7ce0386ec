//! Arena-backed entity store.
//!
//! Rows live in one map per entity type. Parent/child relationships are kept in
//! index maps keyed by the parent id, with children slotted by `order_index` (or by
//! user for ACL and submission rows), so uniqueness is enforced at insert time and
//! cascades walk the indexes top-down.
//!
//! Every mutation goes through [`MemoryStore::transaction`], which works on a private
//! copy of the tables and swaps it in only when the closure succeeds.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{PoisonError, RwLock};

use super::domain::{
    Assessment, AssessmentId, AssessmentItem, AssessmentItemId, AssessmentItemNode,
    AssessmentTree, Indicator, IndicatorId, IndicatorItem, IndicatorItemId, IndicatorNode,
    PermissionId, SubmissionId, UserData, UserId, UserPermission,
};

/// Error enumeration for storage-boundary failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
}

/// Rows removed by a cascading delete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeSummary {
    pub assessment_items: usize,
    pub indicators: usize,
    pub indicator_items: usize,
    pub permissions: usize,
    pub submissions: usize,
    /// Stored image filenames referenced by the removed submissions.
    pub orphaned_images: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    assessments: HashMap<AssessmentId, Assessment>,
    assessment_items: HashMap<AssessmentItemId, AssessmentItem>,
    indicators: HashMap<IndicatorId, Indicator>,
    indicator_items: HashMap<IndicatorItemId, IndicatorItem>,
    permissions: HashMap<PermissionId, UserPermission>,
    submissions: HashMap<SubmissionId, UserData>,

    names: HashMap<String, AssessmentId>,
    items_by_assessment: HashMap<AssessmentId, BTreeMap<u32, AssessmentItemId>>,
    indicators_by_item: HashMap<AssessmentItemId, BTreeMap<u32, IndicatorId>>,
    entries_by_indicator: HashMap<IndicatorId, BTreeMap<u32, IndicatorItemId>>,
    permissions_by_indicator: HashMap<IndicatorId, BTreeMap<UserId, PermissionId>>,
    submissions_by_entry: HashMap<IndicatorItemId, BTreeMap<UserId, SubmissionId>>,
}

fn ordered<'a, K, I, V>(index: Option<&'a BTreeMap<K, I>>, rows: &'a HashMap<I, V>) -> Vec<&'a V>
where
    I: std::hash::Hash + Eq,
{
    index
        .map(|slots| slots.values().filter_map(|id| rows.get(id)).collect())
        .unwrap_or_default()
}

impl Tables {
    pub fn assessment(&self, id: &AssessmentId) -> Option<&Assessment> {
        self.assessments.get(id)
    }

    /// All assessments, oldest first.
    pub fn assessments(&self) -> Vec<&Assessment> {
        let mut rows: Vec<&Assessment> = self.assessments.values().collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        rows
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn assessment_item(&self, id: &AssessmentItemId) -> Option<&AssessmentItem> {
        self.assessment_items.get(id)
    }

    pub fn assessment_items(&self, assessment_id: &AssessmentId) -> Vec<&AssessmentItem> {
        ordered(
            self.items_by_assessment.get(assessment_id),
            &self.assessment_items,
        )
    }

    pub fn assessment_item_at(
        &self,
        assessment_id: &AssessmentId,
        order_index: u32,
    ) -> Option<&AssessmentItem> {
        self.items_by_assessment
            .get(assessment_id)
            .and_then(|slots| slots.get(&order_index))
            .and_then(|id| self.assessment_items.get(id))
    }

    pub fn indicator(&self, id: &IndicatorId) -> Option<&Indicator> {
        self.indicators.get(id)
    }

    pub fn indicators(&self, item_id: &AssessmentItemId) -> Vec<&Indicator> {
        ordered(self.indicators_by_item.get(item_id), &self.indicators)
    }

    pub fn indicator_at(&self, item_id: &AssessmentItemId, order_index: u32) -> Option<&Indicator> {
        self.indicators_by_item
            .get(item_id)
            .and_then(|slots| slots.get(&order_index))
            .and_then(|id| self.indicators.get(id))
    }

    pub fn indicator_item(&self, id: &IndicatorItemId) -> Option<&IndicatorItem> {
        self.indicator_items.get(id)
    }

    pub fn indicator_items(&self, indicator_id: &IndicatorId) -> Vec<&IndicatorItem> {
        ordered(
            self.entries_by_indicator.get(indicator_id),
            &self.indicator_items,
        )
    }

    pub fn indicator_item_at(
        &self,
        indicator_id: &IndicatorId,
        order_index: u32,
    ) -> Option<&IndicatorItem> {
        self.entries_by_indicator
            .get(indicator_id)
            .and_then(|slots| slots.get(&order_index))
            .and_then(|id| self.indicator_items.get(id))
    }

    pub fn permission(&self, user_id: &UserId, indicator_id: &IndicatorId) -> Option<&UserPermission> {
        self.permissions_by_indicator
            .get(indicator_id)
            .and_then(|slots| slots.get(user_id))
            .and_then(|id| self.permissions.get(id))
    }

    /// ACL rows of an indicator, ordered by user id.
    pub fn permissions(&self, indicator_id: &IndicatorId) -> Vec<&UserPermission> {
        ordered(
            self.permissions_by_indicator.get(indicator_id),
            &self.permissions,
        )
    }

    pub fn submission(&self, user_id: &UserId, item_id: &IndicatorItemId) -> Option<&UserData> {
        self.submissions_by_entry
            .get(item_id)
            .and_then(|slots| slots.get(user_id))
            .and_then(|id| self.submissions.get(id))
    }

    /// Every user's submission for an indicator item, ordered by user id.
    pub fn submissions(&self, item_id: &IndicatorItemId) -> Vec<&UserData> {
        ordered(self.submissions_by_entry.get(item_id), &self.submissions)
    }

    /// Assemble the nested read model for one assessment.
    pub fn tree(&self, id: &AssessmentId) -> Option<AssessmentTree> {
        let assessment = self.assessments.get(id)?.clone();
        let items = self
            .assessment_items(id)
            .into_iter()
            .map(|item| AssessmentItemNode {
                item: item.clone(),
                indicators: self
                    .indicators(&item.id)
                    .into_iter()
                    .map(|indicator| IndicatorNode {
                        indicator: indicator.clone(),
                        items: self
                            .indicator_items(&indicator.id)
                            .into_iter()
                            .cloned()
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Some(AssessmentTree { assessment, items })
    }
}

fn claim_slot<K, I>(
    slots: &mut BTreeMap<K, I>,
    key: K,
    id: I,
    describe: impl FnOnce() -> String,
) -> Result<(), StoreError>
where
    K: Ord,
{
    if slots.contains_key(&key) {
        return Err(StoreError::Conflict(describe()));
    }
    slots.insert(key, id);
    Ok(())
}

fn move_slot<I: Copy>(
    slots: &mut BTreeMap<u32, I>,
    from: u32,
    to: u32,
    id: I,
    describe: impl FnOnce() -> String,
) -> Result<(), StoreError> {
    if from == to {
        return Ok(());
    }
    claim_slot(slots, to, id, describe)?;
    slots.remove(&from);
    Ok(())
}

/// Mutable view over a working copy of the tables. Reads see uncommitted writes.
pub struct Transaction<'a> {
    tables: &'a mut Tables,
}

impl Deref for Transaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        self.tables
    }
}

impl Transaction<'_> {
    pub fn insert_assessment(&mut self, assessment: Assessment) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if tables.assessments.contains_key(&assessment.id) {
            return Err(StoreError::Conflict(format!(
                "assessment {} already exists",
                assessment.id
            )));
        }
        if tables.names.contains_key(&assessment.name) {
            return Err(StoreError::Conflict(format!(
                "assessment name '{}' already exists",
                assessment.name
            )));
        }

        tables.names.insert(assessment.name.clone(), assessment.id);
        tables.items_by_assessment.entry(assessment.id).or_default();
        tables.assessments.insert(assessment.id, assessment);
        Ok(())
    }

    pub fn update_assessment(&mut self, assessment: Assessment) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let current_name = tables
            .assessments
            .get(&assessment.id)
            .map(|existing| existing.name.clone())
            .ok_or_else(|| StoreError::NotFound(format!("assessment {}", assessment.id)))?;

        if current_name != assessment.name {
            if tables.names.contains_key(&assessment.name) {
                return Err(StoreError::Conflict(format!(
                    "assessment name '{}' already exists",
                    assessment.name
                )));
            }
            tables.names.remove(&current_name);
            tables.names.insert(assessment.name.clone(), assessment.id);
        }

        tables.assessments.insert(assessment.id, assessment);
        Ok(())
    }

    /// Remove an assessment and everything reachable from it.
    pub fn delete_assessment(&mut self, id: &AssessmentId) -> Result<CascadeSummary, StoreError> {
        let assessment = self
            .tables
            .assessments
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("assessment {id}")))?;
        self.tables.names.remove(&assessment.name);

        let mut summary = CascadeSummary::default();
        let children = self.tables.items_by_assessment.remove(id).unwrap_or_default();
        for item_id in children.into_values() {
            self.remove_assessment_item(&item_id, &mut summary);
        }
        Ok(summary)
    }

    pub fn insert_assessment_item(&mut self, item: AssessmentItem) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if !tables.assessments.contains_key(&item.assessment_id) {
            return Err(StoreError::NotFound(format!(
                "assessment {}",
                item.assessment_id
            )));
        }
        if tables.assessment_items.contains_key(&item.id) {
            return Err(StoreError::Conflict(format!(
                "assessment item {} already exists",
                item.id
            )));
        }

        let slots = tables.items_by_assessment.entry(item.assessment_id).or_default();
        claim_slot(slots, item.order_index, item.id, || {
            format!(
                "order_index {} is already used in assessment {}",
                item.order_index, item.assessment_id
            )
        })?;
        tables.indicators_by_item.entry(item.id).or_default();
        tables.assessment_items.insert(item.id, item);
        Ok(())
    }

    pub fn update_assessment_item(&mut self, item: AssessmentItem) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let existing = tables
            .assessment_items
            .get(&item.id)
            .ok_or_else(|| StoreError::NotFound(format!("assessment item {}", item.id)))?;
        if existing.assessment_id != item.assessment_id {
            return Err(StoreError::Conflict(format!(
                "assessment item {} cannot change its assessment",
                item.id
            )));
        }

        let slots = tables.items_by_assessment.entry(item.assessment_id).or_default();
        move_slot(slots, existing.order_index, item.order_index, item.id, || {
            format!(
                "order_index {} is already used in assessment {}",
                item.order_index, item.assessment_id
            )
        })?;
        tables.assessment_items.insert(item.id, item);
        Ok(())
    }

    pub fn delete_assessment_item(
        &mut self,
        id: &AssessmentItemId,
    ) -> Result<CascadeSummary, StoreError> {
        let item = self
            .tables
            .assessment_items
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("assessment item {id}")))?;
        if let Some(slots) = self.tables.items_by_assessment.get_mut(&item.assessment_id) {
            slots.remove(&item.order_index);
        }

        let mut summary = CascadeSummary::default();
        self.remove_assessment_item(id, &mut summary);
        Ok(summary)
    }

    pub fn insert_indicator(&mut self, indicator: Indicator) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if !tables
            .assessment_items
            .contains_key(&indicator.assessment_item_id)
        {
            return Err(StoreError::NotFound(format!(
                "assessment item {}",
                indicator.assessment_item_id
            )));
        }
        if tables.indicators.contains_key(&indicator.id) {
            return Err(StoreError::Conflict(format!(
                "indicator {} already exists",
                indicator.id
            )));
        }

        let slots = tables
            .indicators_by_item
            .entry(indicator.assessment_item_id)
            .or_default();
        claim_slot(slots, indicator.order_index, indicator.id, || {
            format!(
                "order_index {} is already used in assessment item {}",
                indicator.order_index, indicator.assessment_item_id
            )
        })?;
        tables.entries_by_indicator.entry(indicator.id).or_default();
        tables.permissions_by_indicator.entry(indicator.id).or_default();
        tables.indicators.insert(indicator.id, indicator);
        Ok(())
    }

    pub fn update_indicator(&mut self, indicator: Indicator) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let existing = tables
            .indicators
            .get(&indicator.id)
            .ok_or_else(|| StoreError::NotFound(format!("indicator {}", indicator.id)))?;
        if existing.assessment_item_id != indicator.assessment_item_id {
            return Err(StoreError::Conflict(format!(
                "indicator {} cannot change its assessment item",
                indicator.id
            )));
        }

        let slots = tables
            .indicators_by_item
            .entry(indicator.assessment_item_id)
            .or_default();
        move_slot(
            slots,
            existing.order_index,
            indicator.order_index,
            indicator.id,
            || {
                format!(
                    "order_index {} is already used in assessment item {}",
                    indicator.order_index, indicator.assessment_item_id
                )
            },
        )?;
        tables.indicators.insert(indicator.id, indicator);
        Ok(())
    }

    pub fn delete_indicator(&mut self, id: &IndicatorId) -> Result<CascadeSummary, StoreError> {
        let indicator = self
            .tables
            .indicators
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("indicator {id}")))?;
        if let Some(slots) = self
            .tables
            .indicators_by_item
            .get_mut(&indicator.assessment_item_id)
        {
            slots.remove(&indicator.order_index);
        }

        let mut summary = CascadeSummary::default();
        self.remove_indicator(id, &mut summary);
        Ok(summary)
    }

    pub fn insert_indicator_item(&mut self, entry: IndicatorItem) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if !tables.indicators.contains_key(&entry.indicator_id) {
            return Err(StoreError::NotFound(format!(
                "indicator {}",
                entry.indicator_id
            )));
        }
        if tables.indicator_items.contains_key(&entry.id) {
            return Err(StoreError::Conflict(format!(
                "indicator item {} already exists",
                entry.id
            )));
        }

        let slots = tables
            .entries_by_indicator
            .entry(entry.indicator_id)
            .or_default();
        claim_slot(slots, entry.order_index, entry.id, || {
            format!(
                "order_index {} is already used in indicator {}",
                entry.order_index, entry.indicator_id
            )
        })?;
        tables.submissions_by_entry.entry(entry.id).or_default();
        tables.indicator_items.insert(entry.id, entry);
        Ok(())
    }

    pub fn update_indicator_item(&mut self, entry: IndicatorItem) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let existing = tables
            .indicator_items
            .get(&entry.id)
            .ok_or_else(|| StoreError::NotFound(format!("indicator item {}", entry.id)))?;
        if existing.indicator_id != entry.indicator_id {
            return Err(StoreError::Conflict(format!(
                "indicator item {} cannot change its indicator",
                entry.id
            )));
        }

        let slots = tables
            .entries_by_indicator
            .entry(entry.indicator_id)
            .or_default();
        move_slot(slots, existing.order_index, entry.order_index, entry.id, || {
            format!(
                "order_index {} is already used in indicator {}",
                entry.order_index, entry.indicator_id
            )
        })?;
        tables.indicator_items.insert(entry.id, entry);
        Ok(())
    }

    pub fn delete_indicator_item(
        &mut self,
        id: &IndicatorItemId,
    ) -> Result<CascadeSummary, StoreError> {
        let entry = self
            .tables
            .indicator_items
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("indicator item {id}")))?;
        if let Some(slots) = self.tables.entries_by_indicator.get_mut(&entry.indicator_id) {
            slots.remove(&entry.order_index);
        }

        let mut summary = CascadeSummary::default();
        self.remove_indicator_item(id, &mut summary);
        Ok(summary)
    }

    pub fn insert_permission(&mut self, permission: UserPermission) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if !tables.indicators.contains_key(&permission.indicator_id) {
            return Err(StoreError::NotFound(format!(
                "indicator {}",
                permission.indicator_id
            )));
        }
        if tables.permissions.contains_key(&permission.id) {
            return Err(StoreError::Conflict(format!(
                "permission {} already exists",
                permission.id
            )));
        }

        let slots = tables
            .permissions_by_indicator
            .entry(permission.indicator_id)
            .or_default();
        claim_slot(slots, permission.user_id.clone(), permission.id, || {
            format!(
                "user {} already has a permission on indicator {}",
                permission.user_id, permission.indicator_id
            )
        })?;
        tables.permissions.insert(permission.id, permission);
        Ok(())
    }

    pub fn update_permission(&mut self, permission: UserPermission) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let existing = tables
            .permissions
            .get(&permission.id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {}", permission.id)))?;
        if existing.user_id != permission.user_id
            || existing.indicator_id != permission.indicator_id
        {
            return Err(StoreError::Conflict(format!(
                "permission {} cannot change its user or indicator",
                permission.id
            )));
        }
        tables.permissions.insert(permission.id, permission);
        Ok(())
    }

    pub fn delete_permission(&mut self, id: &PermissionId) -> Result<UserPermission, StoreError> {
        let tables = &mut *self.tables;
        let permission = tables
            .permissions
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {id}")))?;
        if let Some(slots) = tables
            .permissions_by_indicator
            .get_mut(&permission.indicator_id)
        {
            slots.remove(&permission.user_id);
        }
        Ok(permission)
    }

    pub fn insert_submission(&mut self, submission: UserData) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        if !tables
            .indicator_items
            .contains_key(&submission.indicator_item_id)
        {
            return Err(StoreError::NotFound(format!(
                "indicator item {}",
                submission.indicator_item_id
            )));
        }
        if tables.submissions.contains_key(&submission.id) {
            return Err(StoreError::Conflict(format!(
                "submission {} already exists",
                submission.id
            )));
        }

        let slots = tables
            .submissions_by_entry
            .entry(submission.indicator_item_id)
            .or_default();
        claim_slot(slots, submission.user_id.clone(), submission.id, || {
            format!(
                "user {} already has a submission for indicator item {}",
                submission.user_id, submission.indicator_item_id
            )
        })?;
        tables.submissions.insert(submission.id, submission);
        Ok(())
    }

    pub fn update_submission(&mut self, submission: UserData) -> Result<(), StoreError> {
        let tables = &mut *self.tables;
        let existing = tables
            .submissions
            .get(&submission.id)
            .ok_or_else(|| StoreError::NotFound(format!("submission {}", submission.id)))?;
        if existing.user_id != submission.user_id
            || existing.indicator_item_id != submission.indicator_item_id
        {
            return Err(StoreError::Conflict(format!(
                "submission {} cannot change its user or indicator item",
                submission.id
            )));
        }
        tables.submissions.insert(submission.id, submission);
        Ok(())
    }

    pub fn delete_submission(&mut self, id: &SubmissionId) -> Result<UserData, StoreError> {
        let tables = &mut *self.tables;
        let submission = tables
            .submissions
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("submission {id}")))?;
        if let Some(slots) = tables
            .submissions_by_entry
            .get_mut(&submission.indicator_item_id)
        {
            slots.remove(&submission.user_id);
        }
        Ok(submission)
    }

    // Cascade helpers assume the caller already detached `id` from its parent's slots.

    fn remove_assessment_item(&mut self, id: &AssessmentItemId, summary: &mut CascadeSummary) {
        if self.tables.assessment_items.remove(id).is_some() {
            summary.assessment_items += 1;
        }
        let children = self.tables.indicators_by_item.remove(id).unwrap_or_default();
        for indicator_id in children.into_values() {
            self.remove_indicator(&indicator_id, summary);
        }
    }

    fn remove_indicator(&mut self, id: &IndicatorId, summary: &mut CascadeSummary) {
        if self.tables.indicators.remove(id).is_some() {
            summary.indicators += 1;
        }
        let grants = self
            .tables
            .permissions_by_indicator
            .remove(id)
            .unwrap_or_default();
        for permission_id in grants.into_values() {
            if self.tables.permissions.remove(&permission_id).is_some() {
                summary.permissions += 1;
            }
        }
        let children = self.tables.entries_by_indicator.remove(id).unwrap_or_default();
        for entry_id in children.into_values() {
            self.remove_indicator_item(&entry_id, summary);
        }
    }

    fn remove_indicator_item(&mut self, id: &IndicatorItemId, summary: &mut CascadeSummary) {
        if self.tables.indicator_items.remove(id).is_some() {
            summary.indicator_items += 1;
        }
        let rows = self.tables.submissions_by_entry.remove(id).unwrap_or_default();
        for submission_id in rows.into_values() {
            if let Some(removed) = self.tables.submissions.remove(&submission_id) {
                summary.submissions += 1;
                summary.orphaned_images.extend(removed.image_path);
            }
        }
    }
}

/// Process-local store. Writers are serialized; readers never observe a partial transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a read-only projection against committed state.
    pub fn read<T>(&self, reader: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        reader(&guard)
    }

    /// Run `work` against a copy of the tables and commit it only on `Ok`.
    ///
    /// Every call clones all tables, so a write costs O(size of the store)
    /// regardless of how much it touches.
    ///
    /// Committed state is never mutated in place, so a poisoned lock still guards
    /// consistent data and is recovered rather than surfaced.
    pub fn transaction<T, E>(
        &self,
        work: impl FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut working = guard.clone();
        let outcome = work(&mut Transaction {
            tables: &mut working,
        })?;
        *guard = working;
        Ok(outcome)
    }
}
