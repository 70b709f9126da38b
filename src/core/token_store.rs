use crate::core::keyring::KeyringAccessError;
use keyring::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

const KEYRING_SERVICE: &str = "mcp-search";

pub type CredentialError = Box<dyn std::error::Error + Send + Sync>;

/// Source of the API token for a search server.
pub trait CredentialStore: Send + Sync {
    fn get_token(&self, server_name: &str) -> Result<Option<String>, CredentialError>;

    /// True when a non-blank token is stored for `server_name`.
    fn has_token(&self, server_name: &str) -> bool {
        matches!(
            self.get_token(server_name),
            Ok(Some(token)) if !token.trim().is_empty()
        )
    }
}

/// Tokens kept in the operating system keyring.
#[derive(Debug, Clone, Copy)]
pub struct KeyringTokenStore {
    use_keyring: bool,
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self { use_keyring: true }
    }

    /// Construct a store, optionally disabling keyring access (useful for tests)
    pub fn new_with_keyring(use_keyring: bool) -> Self {
        Self { use_keyring }
    }

    pub fn set_token(&self, server_name: &str, token: &str) -> Result<(), CredentialError> {
        if !self.use_keyring {
            return Ok(());
        }

        let entry = Entry::new(KEYRING_SERVICE, server_name)?;
        entry
            .set_password(token)
            .map_err(|err| Box::new(KeyringAccessError::from(err)) as CredentialError)
    }

    pub fn remove_token(&self, server_name: &str) -> Result<bool, CredentialError> {
        if !self.use_keyring {
            return Ok(false);
        }

        let entry = Entry::new(KEYRING_SERVICE, server_name)?;
        match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(err) => Err(Box::new(KeyringAccessError::from(err))),
        }
    }
}

impl CredentialStore for KeyringTokenStore {
    fn get_token(&self, server_name: &str) -> Result<Option<String>, CredentialError> {
        if !self.use_keyring {
            return Ok(None);
        }

        let entry = Entry::new(KEYRING_SERVICE, server_name)?;
        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(Box::new(KeyringAccessError::from(err))),
        }
    }
}

/// In-process store, for embedding hosts that manage secrets themselves.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn with_token(server_name: &str, token: &str) -> Self {
        let store = Self::default();
        store.insert(server_name, token);
        store
    }

    pub fn insert(&self, server_name: &str, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_name.to_string(), token.to_string());
    }
}

impl CredentialStore for MemoryTokenStore {
    fn get_token(&self, server_name: &str) -> Result<Option<String>, CredentialError> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .cloned())
    }
}
