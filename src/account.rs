use super::common::Cents;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Balances for one user, keyed by currency. A currency that was never
/// touched reads as zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub balances: HashMap<String, Cents>,
}

impl User {
    pub fn balance(&self, currency: &str) -> Cents {
        self.balances.get(currency).copied().unwrap_or(0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user not found")]
    NotFound,
}

/// Process-wide user table. Users are created once and never deleted.
///
/// The store only promises entry-level atomicity: `create` is atomic against
/// concurrent creates for the same name and `update` swaps the whole balance
/// mapping in one step. Per-user write ordering is the gateway's business,
/// not ours.
#[derive(Clone, Default)]
pub struct UserStore {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str) -> Result<(), Error> {
        match self.write().entry(name.to_owned()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists),
            Entry::Vacant(vacant) => {
                vacant.insert(User::default());
                Ok(())
            }
        }
    }

    /// Owned snapshot of a user at the time of the call.
    pub fn get(&self, name: &str) -> Result<User, Error> {
        self.read().get(name).cloned().ok_or(Error::NotFound)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Replace the user's entire balance mapping in one step.
    pub fn update(&self, name: &str, balances: HashMap<String, Cents>) -> Result<(), Error> {
        match self.write().get_mut(name) {
            Some(user) => {
                user.balances = balances;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    #[cfg(test)]
    pub fn remove(&self, name: &str) {
        self.write().remove(name);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, User>> {
        self.users.read().expect("user table poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, User>> {
        self.users.write().expect("user table poisoned")
    }
}
