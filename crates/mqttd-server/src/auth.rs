//! Credential store backed by an embedded SQLite database.
//!
//! Schema: `users(username TEXT PRIMARY KEY, secret TEXT NOT NULL)` where
//! `secret` is a bcrypt hash. The broker only reads this table; user
//! provisioning is external.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

/// Credential database location, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = "./store/store.db";

/// Authentication failures. `UserNotFound` and `BadPassword` map to CONNACK
/// 0x04; a store-level failure maps to 0x03.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown user")]
    UserNotFound,

    #[error("invalid password")]
    BadPassword,

    #[error("credential store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("credential check did not complete")]
    Internal,
}

/// Read-only view over the user table. Consulted only during CONNECT.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open the credential database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an empty in-memory store; every lookup yields `UserNotFound`.
    #[allow(dead_code)]
    pub fn open_in_memory() -> Result<Self, AuthError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (username TEXT PRIMARY KEY, secret TEXT NOT NULL)",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Direct connection access for test fixtures.
    #[cfg(test)]
    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Verify a username/password pair against the stored bcrypt hash.
    pub fn verify(&self, username: &str, password: &[u8]) -> Result<(), AuthError> {
        let secret: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT secret FROM users WHERE username = ?1",
                [username],
                |row| row.get(0),
            )
            .optional()?;

        let Some(hash) = secret else {
            return Err(AuthError::UserNotFound);
        };

        // An unparseable stored hash counts as a mismatch, not a panic
        match bcrypt::verify(password, &hash) {
            Ok(true) => Ok(()),
            _ => Err(AuthError::BadPassword),
        }
    }
}
