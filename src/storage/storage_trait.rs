//! Storage Trait
//!
//! This module defines the `Storage` trait, the catalog of users and inbounds
//! the agent reconciles against.
//!
//! Implementors of this trait are responsible for:
//! - Tracking which inbounds each user is attached to
//! - Tracking the inbounds the running backends expose
//!
//! The catalog is the agent's own view; it is rebuilt from the controller's
//! `RepopulateUsers` call after an agent restart.

use crate::error_handling::types::StorageError;
use crate::storage::types::{Inbound, User, UserRecord};

pub trait Storage: Send + Sync {
    /// Lists every stored user with its inbounds.
    fn list_users(&self) -> Vec<UserRecord>;

    /// Looks up a single user.
    fn get_user(&self, id: u32) -> Option<UserRecord>;

    /// Lists registered inbounds, restricted to `tags` when given.
    ///
    /// Unknown tags are skipped.
    fn list_inbounds(&self, tags: Option<&[String]>) -> Vec<Inbound>;

    /// Lists the users attached to the inbound `tag`.
    fn list_inbound_users(&self, tag: &str) -> Vec<User>;

    /// Creates or replaces a user and its inbound membership.
    fn update_user_inbounds(&self, user: &User, inbounds: &[Inbound]) -> Result<(), StorageError>;

    /// Removes a user.
    fn remove_user(&self, id: u32) -> Result<(), StorageError>;

    /// Registers an inbound exposed by a backend.
    fn register_inbound(&self, inbound: Inbound);

    /// Forgets an inbound, detaching it from every user.
    fn remove_inbound(&self, tag: &str);
}
