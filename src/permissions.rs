//! Conditional permission engine.
//!
//! A user holds static grants keyed by category. A check walks a fixed
//! order and stops at the first failure:
//!
//! 1. the user has any grant
//! 2. a grant exists for the category
//! 3. the grant's levels include the requested level
//! 4. every requested field is inside the grant's field set (`"*"` in the
//!    grant lifts the restriction)
//! 5. conditions: time window, usage limit, recipient allow-list (only if a
//!    recipient is supplied), purpose allow-list (only if a purpose is
//!    supplied)
//!
//! Usage is not tied to delivery: callers invoke
//! [`PermissionEngine::record_usage`] exactly once per consumed access.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::persist;

/// Field value that matches every field of a category.
pub const WILDCARD_FIELD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Delete,
    Share,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Share => "share",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRestriction {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimit {
    pub max_uses: u32,
    #[serde(default)]
    pub current_uses: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restriction: Option<TimeRestriction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<UsageLimit>,
    /// Recipients allowed to receive data under this grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_restriction: Option<Vec<String>>,
    /// Purposes this grant may be used for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose_restriction: Option<Vec<String>>,
}

/// A static grant for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub category: String,
    /// `None` grants every field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    pub level: Vec<AccessLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<PermissionConditions>,
}

impl Permission {
    pub fn new(category: impl Into<String>, level: Vec<AccessLevel>) -> Self {
        Self {
            category: category.into(),
            fields: None,
            level,
            conditions: None,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_conditions(mut self, conditions: PermissionConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    fn conditions_mut(&mut self) -> &mut PermissionConditions {
        self.conditions.get_or_insert_with(PermissionConditions::default)
    }

    pub fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.conditions_mut().time_restriction = Some(TimeRestriction {
            valid_from: from,
            valid_until: until,
        });
        self
    }

    pub fn with_usage_limit(mut self, max_uses: u32) -> Self {
        self.conditions_mut().usage_limit = Some(UsageLimit {
            max_uses,
            current_uses: 0,
        });
        self
    }

    pub fn for_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions_mut().recipient_restriction =
            Some(recipients.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_purposes<I, S>(mut self, purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions_mut().purpose_restriction =
            Some(purposes.into_iter().map(Into::into).collect());
        self
    }
}

/// Optional context for condition checks.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub recipient: Option<String>,
    pub purpose: Option<String>,
}

/// Why a permission check denied access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    NoPermissions,
    CategoryNotGranted(String),
    LevelNotGranted(AccessLevel),
    FieldsNotPermitted(Vec<String>),
    NotYetValid,
    /// The grant's time window has closed.
    Expired,
    UsageLimitReached,
    RecipientNotAllowed(String),
    PurposeNotAllowed(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPermissions => write!(f, "no permissions granted"),
            Self::CategoryNotGranted(c) => write!(f, "no permission for category {c}"),
            Self::LevelNotGranted(l) => write!(f, "access level {l} not granted"),
            Self::FieldsNotPermitted(fields) => {
                write!(f, "fields not permitted: {}", fields.join(", "))
            }
            Self::NotYetValid => write!(f, "permission not yet valid"),
            Self::Expired => write!(f, "permission has expired"),
            Self::UsageLimitReached => write!(f, "usage limit reached"),
            Self::RecipientNotAllowed(r) => write!(f, "recipient not allowed: {r}"),
            Self::PurposeNotAllowed(p) => write!(f, "purpose not allowed: {p}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(reason),
        }
    }

    /// Convert a denial into an error, keeping expiry distinguishable.
    pub fn into_result(self) -> VaultResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(DenyReason::Expired) => Err(VaultError::Expired("permission".into())),
            Self::Denied(reason) => Err(VaultError::AuthFailure(reason.to_string())),
        }
    }
}

type Grants = HashMap<String, Vec<Permission>>;

pub struct PermissionEngine {
    path: Option<PathBuf>,
    grants: Grants,
}

impl PermissionEngine {
    /// Load `permissions.json` under the config root.
    pub fn open(config: &VaultConfig) -> VaultResult<Self> {
        let path = config.permissions_path();
        let grants: Grants = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            grants,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            grants: HashMap::new(),
        }
    }

    /// Apply `change` to a copy of the grants and swap it in once written.
    fn commit<T>(&mut self, change: impl FnOnce(&mut Grants) -> VaultResult<T>) -> VaultResult<T> {
        let mut next = self.grants.clone();
        let out = change(&mut next)?;
        if let Some(path) = &self.path {
            persist::write_json_atomic(path, &next)?;
        }
        self.grants = next;
        Ok(out)
    }

    /// Add a grant, replacing any existing grant for the same category.
    pub fn grant(&mut self, user_id: &str, permission: Permission) -> VaultResult<()> {
        if user_id.is_empty() || permission.category.is_empty() {
            return Err(VaultError::validation("user id and category are required"));
        }
        if permission.level.is_empty() {
            return Err(VaultError::validation("a grant needs at least one access level"));
        }

        let category = permission.category.clone();
        self.commit(|all| {
            let grants = all.entry(user_id.to_string()).or_default();
            grants.retain(|p| p.category != permission.category);
            grants.push(permission);
            Ok(())
        })?;

        info!(user_id, category = %category, "permission granted");
        Ok(())
    }

    /// Remove the grant for `category`. Returns whether one existed.
    pub fn revoke(&mut self, user_id: &str, category: &str) -> VaultResult<bool> {
        let exists = self
            .permissions_for(user_id)
            .iter()
            .any(|p| p.category == category);
        if !exists {
            return Ok(false);
        }
        self.commit(|all| {
            if let Some(grants) = all.get_mut(user_id) {
                grants.retain(|p| p.category != category);
                if grants.is_empty() {
                    all.remove(user_id);
                }
            }
            Ok(())
        })?;
        info!(user_id, category, "permission revoked");
        Ok(true)
    }

    pub fn permissions_for(&self, user_id: &str) -> &[Permission] {
        self.grants.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn check_permission(
        &self,
        user_id: &str,
        category: &str,
        fields: &[String],
        level: AccessLevel,
        context: Option<&AccessContext>,
    ) -> AccessDecision {
        self.check_permission_at(user_id, category, fields, level, context, Utc::now())
    }

    pub fn check_permission_at(
        &self,
        user_id: &str,
        category: &str,
        fields: &[String],
        level: AccessLevel,
        context: Option<&AccessContext>,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let decision = evaluate(self.grants.get(user_id), category, fields, level, context, now);
        debug!(user_id, category, %level, ?decision, "permission check");
        decision
    }

    /// Count one use against the category grant's usage limit. Returns the
    /// new use count, or `None` if the grant has no limit.
    pub fn record_usage(&mut self, user_id: &str, category: &str) -> VaultResult<Option<u32>> {
        let uses = self.commit(|all| {
            let permission = all
                .get_mut(user_id)
                .and_then(|grants| grants.iter_mut().find(|p| p.category == category))
                .ok_or_else(|| {
                    VaultError::not_found("permission", format!("{user_id}/{category}"))
                })?;
            let limit = permission
                .conditions
                .as_mut()
                .and_then(|c| c.usage_limit.as_mut());
            Ok(limit.map(|limit| {
                limit.current_uses = limit.current_uses.saturating_add(1);
                limit.current_uses
            }))
        })?;

        if let Some(uses) = uses {
            debug!(user_id, category, uses, "permission usage recorded");
        }
        Ok(uses)
    }
}

fn evaluate(
    grants: Option<&Vec<Permission>>,
    category: &str,
    fields: &[String],
    level: AccessLevel,
    context: Option<&AccessContext>,
    now: DateTime<Utc>,
) -> AccessDecision {
    use AccessDecision::Denied;

    let Some(grants) = grants.filter(|g| !g.is_empty()) else {
        return Denied(DenyReason::NoPermissions);
    };
    let Some(permission) = grants.iter().find(|p| p.category == category) else {
        return Denied(DenyReason::CategoryNotGranted(category.to_string()));
    };
    if !permission.level.contains(&level) {
        return Denied(DenyReason::LevelNotGranted(level));
    }

    if let Some(allowed) = &permission.fields {
        if !allowed.iter().any(|f| f == WILDCARD_FIELD) {
            let offending: Vec<String> = fields
                .iter()
                .filter(|f| !allowed.contains(f))
                .cloned()
                .collect();
            if !offending.is_empty() {
                return Denied(DenyReason::FieldsNotPermitted(offending));
            }
        }
    }

    let Some(conditions) = &permission.conditions else {
        return AccessDecision::Allowed;
    };

    if let Some(window) = &conditions.time_restriction {
        if window.valid_from.is_some_and(|from| now < from) {
            return Denied(DenyReason::NotYetValid);
        }
        if window.valid_until.is_some_and(|until| now > until) {
            return Denied(DenyReason::Expired);
        }
    }

    if let Some(limit) = &conditions.usage_limit {
        if limit.current_uses >= limit.max_uses {
            return Denied(DenyReason::UsageLimitReached);
        }
    }

    let context = context.cloned().unwrap_or_default();

    if let (Some(recipient), Some(allowed)) = (&context.recipient, &conditions.recipient_restriction)
    {
        if !allowed.contains(recipient) {
            return Denied(DenyReason::RecipientNotAllowed(recipient.clone()));
        }
    }

    if let (Some(purpose), Some(allowed)) = (&context.purpose, &conditions.purpose_restriction) {
        if !allowed.contains(purpose) {
            return Denied(DenyReason::PurposeNotAllowed(purpose.clone()));
        }
    }

    AccessDecision::Allowed
}

impl fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("path", &self.path)
            .field("users", &self.grants.len())
            .finish()
    }
}
