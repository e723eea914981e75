use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{Inbound, User, UserRecord};

#[derive(Debug, Default)]
struct Catalog {
    users: BTreeMap<u32, UserRecord>,
    inbounds: BTreeMap<String, Inbound>,
}

/// In-memory catalog. Lost on restart; the controller repopulates it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    catalog: Mutex<Catalog>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn list_users(&self) -> Vec<UserRecord> {
        self.catalog().users.values().cloned().collect()
    }

    fn get_user(&self, id: u32) -> Option<UserRecord> {
        self.catalog().users.get(&id).cloned()
    }

    fn list_inbounds(&self, tags: Option<&[String]>) -> Vec<Inbound> {
        let catalog = self.catalog();
        match tags {
            Some(tags) => tags
                .iter()
                .filter_map(|tag| catalog.inbounds.get(tag).cloned())
                .collect(),
            None => catalog.inbounds.values().cloned().collect(),
        }
    }

    fn list_inbound_users(&self, tag: &str) -> Vec<User> {
        self.catalog()
            .users
            .values()
            .filter(|record| record.tags().any(|t| t == tag))
            .map(|record| record.user.clone())
            .collect()
    }

    fn update_user_inbounds(&self, user: &User, inbounds: &[Inbound]) -> Result<(), StorageError> {
        let mut catalog = self.catalog();
        if let Some(missing) = inbounds
            .iter()
            .find(|i| !catalog.inbounds.contains_key(&i.tag))
        {
            return Err(StorageError::InboundNotFound(missing.tag.clone()));
        }
        debug!(
            "Storing user {} with {} inbound(s)",
            user.id,
            inbounds.len()
        );
        catalog.users.insert(
            user.id,
            UserRecord {
                user: user.clone(),
                inbounds: inbounds.to_vec(),
            },
        );
        Ok(())
    }

    fn remove_user(&self, id: u32) -> Result<(), StorageError> {
        match self.catalog().users.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StorageError::UserNotFound(id)),
        }
    }

    fn register_inbound(&self, inbound: Inbound) {
        debug!("Registering inbound {}", inbound.tag);
        self.catalog().inbounds.insert(inbound.tag.clone(), inbound);
    }

    fn remove_inbound(&self, tag: &str) {
        let mut catalog = self.catalog();
        catalog.inbounds.remove(tag);
        for record in catalog.users.values_mut() {
            record.inbounds.retain(|i| i.tag != tag);
        }
    }
}
