//! User directory for Parley.
//!
//! The directory keeps a validated set of users and is safe to share across
//! threads. It does not know about the broker; callers add a user here before
//! registering that user's delivery channel.

use crate::lifetime::Lifetime;
use crate::message::UserId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// User directory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    /// Name is empty.
    #[error("empty name")]
    InvalidName,

    /// Email is empty or has no `@`.
    #[error("invalid email")]
    InvalidEmail,

    /// Id is empty.
    #[error("empty id")]
    InvalidId,

    /// No user with this id.
    #[error("user not found: {0}")]
    NotFound(UserId),

    /// A user with this id is already present.
    #[error("user already exists: {0}")]
    AlreadyExists(UserId),

    /// The directory's lifetime has been cancelled.
    #[error("directory cancelled")]
    Cancelled,
}

/// A chat user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Primary identity.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: String,
}

impl User {
    /// Create a user. The user is not validated until [`User::validate`].
    #[must_use]
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }

    /// Check the user's fields.
    ///
    /// Name is checked first, then email, then id; the first failure wins.
    ///
    /// # Errors
    ///
    /// Returns the error for the first invalid field.
    pub fn validate(&self) -> Result<(), UserError> {
        if self.name.is_empty() {
            return Err(UserError::InvalidName);
        }
        if !self.email.contains('@') {
            return Err(UserError::InvalidEmail);
        }
        if self.id.is_empty() {
            return Err(UserError::InvalidId);
        }
        Ok(())
    }
}

/// Thread-safe directory of validated users.
#[derive(Debug, Default)]
pub struct Directory {
    users: DashMap<UserId, User>,
    lifetime: Option<Lifetime>,
}

impl Directory {
    /// Create a directory that is never cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory bound to a lifetime.
    ///
    /// Once the lifetime is cancelled every operation fails with
    /// [`UserError::Cancelled`].
    #[must_use]
    pub fn with_lifetime(lifetime: Lifetime) -> Self {
        Self {
            users: DashMap::new(),
            lifetime: Some(lifetime),
        }
    }

    fn ensure_live(&self) -> Result<(), UserError> {
        match &self.lifetime {
            Some(lifetime) if lifetime.is_cancelled() => Err(UserError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Add a user, replacing any user with the same id.
    ///
    /// # Errors
    ///
    /// Returns a validation error, or [`UserError::Cancelled`]. The directory
    /// is unchanged on error.
    pub fn add_user(&self, user: User) -> Result<(), UserError> {
        user.validate()?;
        self.ensure_live()?;

        debug!(user = %user.id, "Adding user");
        self.users.insert(user.id.clone(), user);
        Ok(())
    }

    /// Add a user only if no user with the same id is present.
    ///
    /// The presence check and the insert happen under one shard lock, so of
    /// several concurrent calls for the same id exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`UserError::Cancelled`], or
    /// [`UserError::AlreadyExists`]. The directory is unchanged on error.
    pub fn add_user_if_absent(&self, user: User) -> Result<(), UserError> {
        user.validate()?;
        self.ensure_live()?;

        match self.users.entry(user.id.clone()) {
            Entry::Occupied(_) => Err(UserError::AlreadyExists(user.id)),
            Entry::Vacant(slot) => {
                debug!(user = %user.id, "Adding user");
                slot.insert(user);
                Ok(())
            }
        }
    }

    /// Remove a user.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NotFound`] if the id is absent, or
    /// [`UserError::Cancelled`].
    pub fn remove_user(&self, id: &str) -> Result<(), UserError> {
        self.ensure_live()?;

        match self.users.remove(id) {
            Some(_) => {
                debug!(user = %id, "Removed user");
                Ok(())
            }
            None => Err(UserError::NotFound(id.to_string())),
        }
    }

    /// Look up a user.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NotFound`] if the id is absent, or
    /// [`UserError::Cancelled`].
    pub fn get_user(&self, id: &str) -> Result<User, UserError> {
        self.ensure_live()?;

        self.users
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UserError::NotFound(id.to_string()))
    }

    /// Check if a user is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.users.contains_key(id)
    }

    /// Number of users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Snapshot of all users, sorted by id.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }
}
