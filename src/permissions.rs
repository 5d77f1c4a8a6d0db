use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::db::{FolderRecord, ImageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Change,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Add, Action::Change, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub is_superuser: bool,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_superuser: false,
        }
    }

    pub fn superuser(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_superuser: true,
        }
    }
}

/// The record an instance-level permission is asked about.
#[derive(Debug, Clone, Copy)]
pub enum Instance<'a> {
    Folder(&'a FolderRecord),
    Image(&'a ImageRecord),
}

/// Opaque capability check supplied by the host application.
pub trait PermissionPolicy: Send + Sync {
    fn has_permission(&self, user: &User, action: Action) -> bool;

    fn has_permission_for_instance(&self, user: &User, action: Action, instance: Instance<'_>) -> bool {
        let _ = instance;
        self.has_permission(user, action)
    }

    fn has_any_permission(&self, user: &User, actions: &[Action]) -> bool {
        actions.iter().any(|action| self.has_permission(user, *action))
    }
}

/// Grants everything. Meant for scripts and tests.
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn has_permission(&self, _user: &User, _action: Action) -> bool {
        true
    }
}

/// Per-user action grants. Superusers bypass the table and uploaders may
/// change or delete their own images.
#[derive(Debug, Default)]
pub struct RolePolicy {
    grants: HashMap<String, HashSet<Action>>,
}

impl RolePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, username: &str, actions: &[Action]) -> Self {
        self.grants
            .entry(username.to_string())
            .or_default()
            .extend(actions.iter().copied());
        self
    }
}

impl PermissionPolicy for RolePolicy {
    fn has_permission(&self, user: &User, action: Action) -> bool {
        user.is_superuser
            || self
                .grants
                .get(&user.username)
                .map(|actions| actions.contains(&action))
                .unwrap_or(false)
    }

    fn has_permission_for_instance(&self, user: &User, action: Action, instance: Instance<'_>) -> bool {
        if self.has_permission(user, action) {
            return true;
        }
        match instance {
            Instance::Image(image) => {
                matches!(action, Action::Change | Action::Delete)
                    && image.uploaded_by.as_deref() == Some(user.username.as_str())
            }
            Instance::Folder(_) => false,
        }
    }
}
