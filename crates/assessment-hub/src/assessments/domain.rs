use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(raw.trim()).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a top-level assessment.
    AssessmentId
);
entity_id!(
    /// Identifier of an item directly beneath an assessment.
    AssessmentItemId
);
entity_id!(IndicatorId);
entity_id!(IndicatorItemId);
entity_id!(PermissionId);
entity_id!(
    /// Identifier of a user's submission against an indicator item.
    SubmissionId
);

/// Opaque reference to a user held by the external directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse authorization axis. Only `User` is subject to indicator ACLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Moderator,
    User,
}

impl Role {
    pub const fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Moderator)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Moderator => "Moderator",
            Role::User => "User",
        }
    }
}

/// Directory record for an authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    pub role: Role,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl User {
    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    #[default]
    Draft,
    Published,
}

impl AssessmentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            AssessmentStatus::Draft => "draft",
            AssessmentStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    Draft,
    Complete,
}

impl SubmissionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: AssessmentId,
    pub name: String,
    pub fiscal_year: i32,
    pub status: AssessmentStatus,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentItem {
    pub id: AssessmentItemId,
    pub assessment_id: AssessmentId,
    pub title: String,
    pub order_index: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub id: IndicatorId,
    pub assessment_item_id: AssessmentItemId,
    pub title: String,
    pub order_index: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorItem {
    pub id: IndicatorItemId,
    pub indicator_id: IndicatorId,
    pub title: String,
    pub target_value: Option<String>,
    pub actual_target: Option<String>,
    pub order_index: u32,
    pub created_at: DateTime<Utc>,
}

/// ACL row granting a non-privileged user access to one indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermission {
    pub id: PermissionId,
    pub user_id: UserId,
    pub indicator_id: IndicatorId,
    pub can_view: bool,
    pub can_edit: bool,
    pub created_at: DateTime<Utc>,
}

/// A user's submission against one indicator item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub indicator_item_id: IndicatorItemId,
    pub performance: Option<String>,
    pub rate: Option<String>,
    pub score: Option<String>,
    pub image_path: Option<String>,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserData {
    /// Fresh draft row, created on the first write for a (user, item) pair.
    pub fn draft(
        user_id: UserId,
        indicator_item_id: IndicatorItemId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubmissionId::new(),
            user_id,
            indicator_item_id,
            performance: None,
            rate: None,
            score: None,
            image_path: None,
            status: SubmissionStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Full nested read model of an assessment, children ordered by `order_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssessmentTree {
    #[serde(flatten)]
    pub assessment: Assessment,
    pub items: Vec<AssessmentItemNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssessmentItemNode {
    #[serde(flatten)]
    pub item: AssessmentItem,
    pub indicators: Vec<IndicatorNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndicatorNode {
    #[serde(flatten)]
    pub indicator: Indicator,
    pub items: Vec<IndicatorItem>,
}

/// Returns true when the value is absent or only whitespace.
pub(crate) fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |text| text.trim().is_empty())
}
