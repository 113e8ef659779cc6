// Authorization and credential checks.

use std::collections::{HashMap, HashSet};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chronicle_common::types::{ProjectId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AccessConfig, UserConfig};

/// What a caller is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Commit,
    Squash,
    /// Pause or resume the server. Not tied to a project.
    Maintenance,
}

/// The "is this caller allowed" collaborator.
pub trait AccessPolicy: Send + Sync {
    fn is_authorized(&self, user: &UserId, operation: Operation, project: Option<&ProjectId>) -> bool;
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("failed to hash password: {0}")]
    Hash(String),
}

/// Policy and user directory loaded once from an [`AccessConfig`].
#[derive(Debug, Clone, Default)]
pub struct StaticAccessPolicy {
    users: HashMap<UserId, UserConfig>,
    grants: HashMap<ProjectId, HashMap<UserId, HashSet<Operation>>>,
}

impl StaticAccessPolicy {
    pub fn from_config(config: &AccessConfig) -> Self {
        let users = config.users.iter().map(|user| (user.id.clone(), user.clone())).collect();
        let grants = config
            .projects
            .iter()
            .map(|project| {
                let members = project
                    .members
                    .iter()
                    .map(|member| (member.user.clone(), member.operations.iter().copied().collect()))
                    .collect();
                (project.id.clone(), members)
            })
            .collect();
        Self { users, grants }
    }

    /// Check `password` against the user's stored Argon2 hash.
    ///
    /// Unknown users, malformed hashes and wrong passwords all return `None`.
    pub fn authenticate(&self, user_id: &UserId, password: &str) -> Option<&UserConfig> {
        let user = self.users.get(user_id)?;
        let parsed = PasswordHash::new(&user.password_hash).ok()?;
        Argon2::default().verify_password(password.as_bytes(), &parsed).ok()?;
        Some(user)
    }

    pub fn user(&self, user_id: &UserId) -> Option<&UserConfig> {
        self.users.get(user_id)
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn is_authorized(&self, user: &UserId, operation: Operation, project: Option<&ProjectId>) -> bool {
        match (operation, project) {
            (Operation::Maintenance, _) => self.users.get(user).is_some_and(|u| u.maintenance),
            (_, None) => false,
            (operation, Some(project)) => self
                .grants
                .get(project)
                .and_then(|members| members.get(user))
                .is_some_and(|ops| ops.contains(&operation)),
        }
    }
}

/// Access-file entry for a new user, with `password` hashed.
pub fn provision_user(id: UserId, name: impl Into<String>, password: &str) -> Result<UserConfig, AccessError> {
    Ok(UserConfig { id, name: name.into(), password_hash: hash_password(password)?, maintenance: false })
}

/// Produce an Argon2id PHC string for an access file entry.
pub fn hash_password(password: &str) -> Result<String, AccessError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| AccessError::Hash(error.to_string()))
}
