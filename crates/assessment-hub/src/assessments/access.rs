use super::domain::{IndicatorId, User};
use super::error::ServiceError;
use super::store::Tables;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    View,
    Edit,
}

/// Resolves indicator-scoped access against the ACL rows visible to the current
/// transaction. Nothing is cached; construct one per read.
#[derive(Clone, Copy)]
pub struct AccessEvaluator<'a> {
    tables: &'a Tables,
}

impl<'a> AccessEvaluator<'a> {
    pub fn new(tables: &'a Tables) -> Self {
        Self { tables }
    }

    pub fn can_access(&self, actor: &User, indicator_id: &IndicatorId, mode: AccessMode) -> bool {
        if actor.is_privileged() {
            return true;
        }

        match self.tables.permission(&actor.id, indicator_id) {
            Some(grant) => match mode {
                AccessMode::View => grant.can_view,
                AccessMode::Edit => grant.can_edit,
            },
            None => false,
        }
    }

    pub fn require(
        &self,
        actor: &User,
        indicator_id: &IndicatorId,
        mode: AccessMode,
    ) -> Result<(), ServiceError> {
        if self.can_access(actor, indicator_id, mode) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden("access denied".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessments::domain::{
        Assessment, AssessmentId, AssessmentItem, AssessmentItemId, AssessmentStatus, Indicator,
        PermissionId, Role, UserId, UserPermission,
    };
    use crate::assessments::store::{MemoryStore, StoreError};
    use chrono::Utc;

    fn user(id: &str, role: Role) -> User {
        User {
            id: UserId(id.to_string()),
            username: id.to_string(),
            full_name: id.to_uppercase(),
            email: format!("{id}@example.org"),
            role,
            is_active: true,
        }
    }

    fn store_with_grants(grants: &[(&str, bool, bool)]) -> (MemoryStore, IndicatorId) {
        let store = MemoryStore::new();
        let indicator_id = store
            .transaction(|tx| {
                let now = Utc::now();
                let assessment = Assessment {
                    id: AssessmentId::new(),
                    name: "FY2025".to_string(),
                    fiscal_year: 2025,
                    status: AssessmentStatus::Draft,
                    created_by: UserId("root".to_string()),
                    created_at: now,
                    updated_at: now,
                };
                let item = AssessmentItem {
                    id: AssessmentItemId::new(),
                    assessment_id: assessment.id,
                    title: "Item".to_string(),
                    order_index: 0,
                    created_at: now,
                };
                let indicator = Indicator {
                    id: IndicatorId::new(),
                    assessment_item_id: item.id,
                    title: "Indicator".to_string(),
                    order_index: 0,
                    created_at: now,
                };
                let indicator_id = indicator.id;
                tx.insert_assessment(assessment)?;
                tx.insert_assessment_item(item)?;
                tx.insert_indicator(indicator)?;
                for (user_id, can_view, can_edit) in grants {
                    tx.insert_permission(UserPermission {
                        id: PermissionId::new(),
                        user_id: UserId(user_id.to_string()),
                        indicator_id,
                        can_view: *can_view,
                        can_edit: *can_edit,
                        created_at: now,
                    })?;
                }
                Ok::<_, StoreError>(indicator_id)
            })
            .expect("seed commits");
        (store, indicator_id)
    }

    #[test]
    fn privileged_roles_bypass_the_acl() {
        let (store, indicator) = store_with_grants(&[]);
        store.read(|tables| {
            let evaluator = AccessEvaluator::new(tables);
            for role in [Role::Admin, Role::Moderator] {
                let actor = user("boss", role);
                assert!(evaluator.can_access(&actor, &indicator, AccessMode::View));
                assert!(evaluator.can_access(&actor, &indicator, AccessMode::Edit));
            }
        });
    }

    #[test]
    fn plain_users_follow_the_acl_truth_table() {
        let (store, indicator) = store_with_grants(&[
            ("viewer", true, false),
            ("editor", false, true),
            ("both", true, true),
            ("neither", false, false),
        ]);

        let cases = [
            ("viewer", true, false),
            ("editor", false, true),
            ("both", true, true),
            ("neither", false, false),
            ("stranger", false, false),
        ];

        store.read(|tables| {
            let evaluator = AccessEvaluator::new(tables);
            for (name, view, edit) in cases {
                let actor = user(name, Role::User);
                assert_eq!(
                    evaluator.can_access(&actor, &indicator, AccessMode::View),
                    view,
                    "view for {name}"
                );
                assert_eq!(
                    evaluator.can_access(&actor, &indicator, AccessMode::Edit),
                    edit,
                    "edit for {name}"
                );
            }
        });
    }

    #[test]
    fn require_maps_denials_to_forbidden() {
        let (store, indicator) = store_with_grants(&[("viewer", true, false)]);
        store.read(|tables| {
            let evaluator = AccessEvaluator::new(tables);
            let actor = user("viewer", Role::User);
            assert!(evaluator.require(&actor, &indicator, AccessMode::View).is_ok());
            assert!(matches!(
                evaluator.require(&actor, &indicator, AccessMode::Edit),
                Err(ServiceError::Forbidden(_))
            ));
        });
    }
}
