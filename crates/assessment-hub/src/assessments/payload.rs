//! Request schemas for the tree synchronizer and the submission endpoints.
//!
//! Payloads are checked structurally before any transaction begins so a malformed
//! request fails once, with every violation listed, instead of partway down the tree.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

use super::domain::{
    AssessmentItemId, AssessmentStatus, IndicatorId, IndicatorItemId, SubmissionStatus, UserId,
};
use super::error::Violation;

/// Treat an explicit `null` list the same as an omitted one.
fn nullable_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAssessmentRequest {
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub items: Vec<NewAssessmentItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAssessmentItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub indicators: Vec<NewIndicator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIndicator {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub items: Vec<NewIndicatorItem>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub permissions: Vec<PermissionGrant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIndicatorItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub target_value: Option<String>,
    #[serde(default)]
    pub actual_target: Option<String>,
}

/// ACL entry carried inside an indicator payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    #[serde(default, alias = "user")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub can_view: bool,
    #[serde(default)]
    pub can_edit: bool,
}

impl PermissionGrant {
    /// The referenced user, when one is actually given.
    pub fn user(&self) -> Option<&UserId> {
        self.user_id.as_ref().filter(|user| !user.is_blank())
    }
}

/// Create-path titles: missing or empty entries are skipped rather than rejected.
pub(crate) fn kept_title(title: &Option<String>) -> Option<&str> {
    title.as_deref().filter(|text| !text.is_empty())
}

impl CreateAssessmentRequest {
    pub fn validate(&self) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();

        match self.fiscal_year {
            None => violations.push(Violation::new("fiscal_year", "fiscal year is required")),
            Some(year) if year <= 0 => violations.push(Violation::new(
                "fiscal_year",
                "fiscal year must be a positive number",
            )),
            Some(_) => {}
        }

        for (item_pos, item) in self.items.iter().enumerate() {
            if kept_title(&item.title).is_none() {
                continue;
            }
            for (indicator_pos, indicator) in item.indicators.iter().enumerate() {
                if kept_title(&indicator.title).is_none() {
                    continue;
                }
                let path = format!("items[{item_pos}].indicators[{indicator_pos}]");
                check_unique_grants(&path, &indicator.permissions, false, &mut violations);
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Users referenced by grants that will actually be inserted.
    pub fn referenced_users(&self) -> Vec<(String, UserId)> {
        let mut users = Vec::new();
        for (item_pos, item) in self.items.iter().enumerate() {
            if kept_title(&item.title).is_none() {
                continue;
            }
            for (indicator_pos, indicator) in item.indicators.iter().enumerate() {
                if kept_title(&indicator.title).is_none() {
                    continue;
                }
                for (grant_pos, grant) in indicator.permissions.iter().enumerate() {
                    if let Some(user) = grant.user() {
                        users.push((
                            format!(
                                "items[{item_pos}].indicators[{indicator_pos}].permissions[{grant_pos}].user_id"
                            ),
                            user.clone(),
                        ));
                    }
                }
            }
        }
        users
    }
}

/// Partial tree for the update path. Entries are matched to stored children by `id`
/// when given, otherwise by `order_index`; anything unmatched is inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAssessmentRequest {
    #[serde(default)]
    pub status: Option<AssessmentStatus>,
    #[serde(default)]
    pub items: Option<Vec<AssessmentItemPatch>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentItemPatch {
    #[serde(default)]
    pub id: Option<AssessmentItemId>,
    #[serde(default)]
    pub order_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub indicators: Option<Vec<IndicatorPatch>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorPatch {
    #[serde(default)]
    pub id: Option<IndicatorId>,
    #[serde(default)]
    pub order_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<IndicatorItemPatch>>,
    #[serde(default)]
    pub permissions: Option<Vec<PermissionGrant>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorItemPatch {
    #[serde(default)]
    pub id: Option<IndicatorItemId>,
    #[serde(default)]
    pub order_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub target_value: Option<String>,
    #[serde(default)]
    pub actual_target: Option<String>,
}

/// Shared view over the three patch levels so sibling checks are written once.
trait SiblingKey {
    fn id_key(&self) -> Option<String>;
    fn order_index(&self) -> Option<u32>;
}

impl SiblingKey for AssessmentItemPatch {
    fn id_key(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn order_index(&self) -> Option<u32> {
        self.order_index
    }
}

impl SiblingKey for IndicatorPatch {
    fn id_key(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn order_index(&self) -> Option<u32> {
        self.order_index
    }
}

impl SiblingKey for IndicatorItemPatch {
    fn id_key(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn order_index(&self) -> Option<u32> {
        self.order_index
    }
}

fn check_siblings<T: SiblingKey>(path: &str, siblings: &[T], violations: &mut Vec<Violation>) {
    let mut ids = HashSet::new();
    let mut positions = HashSet::new();
    for (pos, sibling) in siblings.iter().enumerate() {
        if let Some(id) = sibling.id_key() {
            if !ids.insert(id) {
                violations.push(Violation::new(
                    format!("{path}[{pos}].id"),
                    "id appears more than once among siblings",
                ));
            }
        } else if let Some(order_index) = sibling.order_index() {
            if !positions.insert(order_index) {
                violations.push(Violation::new(
                    format!("{path}[{pos}].order_index"),
                    "order_index appears more than once among siblings",
                ));
            }
        }
    }
}

fn check_unique_grants(
    path: &str,
    grants: &[PermissionGrant],
    require_user: bool,
    violations: &mut Vec<Violation>,
) {
    let mut seen = HashSet::new();
    for (pos, grant) in grants.iter().enumerate() {
        match grant.user() {
            Some(user) => {
                if !seen.insert(user.clone()) {
                    violations.push(Violation::new(
                        format!("{path}.permissions[{pos}].user_id"),
                        "user is granted more than once on this indicator",
                    ));
                }
            }
            None if require_user => violations.push(Violation::new(
                format!("{path}.permissions[{pos}].user_id"),
                "user_id is required",
            )),
            None => {}
        }
    }
}

impl UpdateAssessmentRequest {
    pub fn validate(&self) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();

        if self.status.is_none() && self.items.is_none() {
            violations.push(Violation::new("", "no data provided"));
        }

        let items = self.items.as_deref().unwrap_or_default();
        check_siblings("items", items, &mut violations);
        for (item_pos, item) in items.iter().enumerate() {
            let indicators = item.indicators.as_deref().unwrap_or_default();
            let indicators_path = format!("items[{item_pos}].indicators");
            check_siblings(&indicators_path, indicators, &mut violations);

            for (indicator_pos, indicator) in indicators.iter().enumerate() {
                let path = format!("{indicators_path}[{indicator_pos}]");
                let entries = indicator.items.as_deref().unwrap_or_default();
                check_siblings(&format!("{path}.items"), entries, &mut violations);
                let grants = indicator.permissions.as_deref().unwrap_or_default();
                check_unique_grants(&path, grants, true, &mut violations);
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn referenced_users(&self) -> Vec<(String, UserId)> {
        let mut users = Vec::new();
        for (item_pos, item) in self.items.iter().flatten().enumerate() {
            for (indicator_pos, indicator) in item.indicators.iter().flatten().enumerate() {
                for (grant_pos, grant) in indicator.permissions.iter().flatten().enumerate() {
                    if let Some(user) = grant.user() {
                        users.push((
                            format!(
                                "items[{item_pos}].indicators[{indicator_pos}].permissions[{grant_pos}].user_id"
                            ),
                            user.clone(),
                        ));
                    }
                }
            }
        }
        users
    }
}

/// Submission write. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPatch {
    #[serde(default)]
    pub performance: Option<String>,
    #[serde(default)]
    pub rate: Option<String>,
    #[serde(default)]
    pub score: Option<String>,
    #[serde(default)]
    pub status: Option<SubmissionStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_requires_fiscal_year() {
        let request: CreateAssessmentRequest =
            serde_json::from_value(json!({ "items": null })).expect("payload parses");
        let violations = request.validate().expect_err("missing year rejected");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "fiscal_year");
        assert!(request.items.is_empty());
    }

    #[test]
    fn create_accepts_user_alias_and_flags_duplicate_grants() {
        let request: CreateAssessmentRequest = serde_json::from_value(json!({
            "fiscal_year": 2025,
            "items": [{
                "title": "Teaching",
                "indicators": [{
                    "title": "Lesson plans",
                    "permissions": [
                        { "user": "u-1", "can_view": true },
                        { "user_id": "u-1", "can_edit": true },
                        { "user_id": "" }
                    ]
                }]
            }]
        }))
        .expect("payload parses");

        let violations = request.validate().expect_err("duplicate grant rejected");
        assert_eq!(
            violations[0].field,
            "items[0].indicators[0].permissions[1].user_id"
        );
        assert_eq!(request.referenced_users().len(), 2);
    }

    #[test]
    fn create_ignores_grants_under_skipped_indicators() {
        let request: CreateAssessmentRequest = serde_json::from_value(json!({
            "fiscal_year": 2025,
            "items": [{
                "title": "Teaching",
                "indicators": [{
                    "title": "",
                    "permissions": [{ "user_id": "u-1" }, { "user_id": "u-1" }]
                }]
            }]
        }))
        .expect("payload parses");

        assert!(request.validate().is_ok());
        assert!(request.referenced_users().is_empty());
    }

    #[test]
    fn update_rejects_empty_payloads() {
        let violations = UpdateAssessmentRequest::default()
            .validate()
            .expect_err("empty payload rejected");
        assert_eq!(violations[0].message, "no data provided");
    }

    #[test]
    fn update_collects_every_structural_problem() {
        let request: UpdateAssessmentRequest = serde_json::from_value(json!({
            "items": [
                { "order_index": 0, "title": "A" },
                { "order_index": 0, "title": "B", "indicators": [
                    { "order_index": 1, "title": "x", "permissions": [{ "can_view": true }] },
                    { "order_index": 1, "title": "y" }
                ]}
            ]
        }))
        .expect("payload parses");

        let violations = request.validate().expect_err("invalid payload");
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "items[1].order_index",
                "items[1].indicators[1].order_index",
                "items[1].indicators[0].permissions[0].user_id",
            ]
        );
    }

    #[test]
    fn unknown_status_is_a_parse_error() {
        let parsed = serde_json::from_value::<UpdateAssessmentRequest>(json!({ "status": "archived" }));
        assert!(parsed.is_err());
    }
}
