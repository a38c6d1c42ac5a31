//! User registry persisted as `users.json`.
//!
//! Usernames are case-insensitive and stored lowercase. The registry is
//! never empty on a fresh install: `open` seeds an `admin` account with a
//! random password that is printed once in the log.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{load_snapshot, persist_snapshot};
use crate::auth::{self, Role};

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 4;
const DEFAULT_ADMIN: &str = "admin";

#[derive(Error, Debug)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(String),
    #[error("User already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("Password must be at least 4 characters")]
    WeakPassword,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Hash(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    pub role: Role,
}

/// A user as seen by the rest of the server, without the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub username: String,
    pub role: Role,
}

/// Changes applied by [`UserStore::update`]; `None` keeps the current value.
#[derive(Debug, Default, Clone)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub password: Option<String>,
}

type UserMap = BTreeMap<String, UserRecord>;

pub struct UserStore {
    snapshot_path: PathBuf,
    writer: Mutex<()>,
    current: RwLock<Arc<UserMap>>,
}

/// Lowercase and validate a username.
pub fn normalize_username(raw: &str) -> Result<String, UserError> {
    let name = raw.trim().to_lowercase();
    let valid = name.chars().count() >= MIN_USERNAME_LEN
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(UserError::InvalidUsername(raw.to_string()));
    }
    Ok(name)
}

fn check_password(password: &str) -> Result<(), UserError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(UserError::WeakPassword);
    }
    Ok(())
}

fn random_password() -> String {
    let bytes: [u8; 12] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl UserStore {
    /// Load `users.json` from `data_dir`, creating the default admin when the
    /// registry is empty.
    pub fn open(data_dir: &Path) -> Result<Self, UserError> {
        let snapshot_path = data_dir.join("users.json");
        let users: UserMap = load_snapshot(&snapshot_path, "user registry")?;

        let store = Self {
            snapshot_path,
            writer: Mutex::new(()),
            current: RwLock::new(Arc::new(users)),
        };

        if store.snapshot().is_empty() {
            let password = random_password();
            store.create(DEFAULT_ADMIN, &password, Role::Admin)?;
            tracing::warn!(
                "Created default user '{}' with password '{}'; change it after logging in",
                DEFAULT_ADMIN,
                password
            );
        }

        Ok(store)
    }

    /// Read `users.json` without seeding, writing or holding it open.
    ///
    /// Safe next to a running server, which owns the file.
    pub fn peek(data_dir: &Path) -> io::Result<Vec<User>> {
        let users: UserMap = load_snapshot(&data_dir.join("users.json"), "user registry")?;
        Ok(users
            .into_iter()
            .map(|(username, record)| User {
                username,
                role: record.role,
            })
            .collect())
    }

    fn snapshot(&self) -> Arc<UserMap> {
        self.current.read().clone()
    }

    /// Persist `next` and publish it. Caller must hold the writer lock.
    fn commit(&self, next: UserMap) -> io::Result<()> {
        persist_snapshot(&self.snapshot_path, &next)?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, username: &str) -> Option<User> {
        let name = username.trim().to_lowercase();
        self.snapshot().get(&name).map(|record| User {
            username: name,
            role: record.role,
        })
    }

    /// Check a username/password pair.
    pub fn verify(&self, username: &str, password: &str) -> Result<User, UserError> {
        let name = username.trim().to_lowercase();
        let users = self.snapshot();
        match users.get(&name) {
            Some(record) if auth::verify_password(password, &record.password_hash) => Ok(User {
                username: name,
                role: record.role,
            }),
            _ => Err(UserError::InvalidCredentials),
        }
    }

    pub fn list(&self) -> Vec<User> {
        self.snapshot()
            .iter()
            .map(|(username, record)| User {
                username: username.clone(),
                role: record.role,
            })
            .collect()
    }

    pub fn create(&self, username: &str, password: &str, role: Role) -> Result<User, UserError> {
        let name = normalize_username(username)?;
        check_password(password)?;
        let password_hash = auth::hash_password(password)?;

        let _writer = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        if next.contains_key(&name) {
            return Err(UserError::AlreadyExists(name));
        }
        next.insert(
            name.clone(),
            UserRecord {
                password_hash,
                role,
            },
        );
        self.commit(next)?;

        tracing::info!("created user {} ({})", name, role);
        Ok(User {
            username: name,
            role,
        })
    }

    /// Rename, change role and/or reset the password of `username`.
    pub fn update(&self, username: &str, update: UserUpdate) -> Result<User, UserError> {
        let current_name = username.trim().to_lowercase();
        let new_name = match &update.username {
            Some(raw) => normalize_username(raw)?,
            None => current_name.clone(),
        };
        let new_hash = match &update.password {
            Some(password) => {
                check_password(password)?;
                Some(auth::hash_password(password)?)
            }
            None => None,
        };

        let _writer = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        let mut record = next
            .remove(&current_name)
            .ok_or_else(|| UserError::NotFound(current_name.clone()))?;
        if new_name != current_name && next.contains_key(&new_name) {
            return Err(UserError::AlreadyExists(new_name));
        }

        if let Some(role) = update.role {
            record.role = role;
        }
        if let Some(hash) = new_hash {
            record.password_hash = hash;
        }
        let role = record.role;
        next.insert(new_name.clone(), record);
        self.commit(next)?;

        tracing::info!("updated user {} ({})", new_name, role);
        Ok(User {
            username: new_name,
            role,
        })
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), UserError> {
        self.update(
            username,
            UserUpdate {
                password: Some(password.to_string()),
                ..Default::default()
            },
        )
        .map(|_| ())
    }

    pub fn delete(&self, username: &str) -> Result<(), UserError> {
        let name = username.trim().to_lowercase();

        let _writer = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        if next.remove(&name).is_none() {
            return Err(UserError::NotFound(name));
        }
        self.commit(next)?;

        tracing::info!("deleted user {}", name);
        Ok(())
    }
}
