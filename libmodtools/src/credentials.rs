//! App password storage
//!
//! The Bluesky app password never lives in the config file. It is looked up
//! through a chain of [`CredentialStore`] backends:
//!
//! - `EnvStore`: the `MODTOOLS_APP_PASSWORD` environment variable (read-only)
//! - `KeyringStore`: the OS keyring, one entry per handle
//!
//! `CredentialManager` walks the chain and returns the first hit.

use secrecy::SecretString;

use crate::config::StorageBackend;
use crate::error::{CredentialError, Result};

pub const SERVICE: &str = "modtools.bluesky";
pub const PASSWORD_ENV: &str = "MODTOOLS_APP_PASSWORD";

/// A place app passwords can be kept
pub trait CredentialStore: Send + Sync {
    fn store(&self, handle: &str, password: &str) -> Result<()>;

    /// Returns `CredentialError::NotFound` when there is no entry
    fn retrieve(&self, handle: &str) -> Result<SecretString>;

    fn delete(&self, handle: &str) -> Result<()>;

    fn backend_name(&self) -> &str;
}

/// OS-native secure storage
pub struct KeyringStore;

impl KeyringStore {
    /// Fails with `KeyringUnavailable` when the OS keyring cannot be reached
    /// (e.g. headless Linux without Secret Service)
    pub fn new() -> Result<Self> {
        keyring::Entry::new(SERVICE, "availability_check").map_err(|e| {
            CredentialError::KeyringUnavailable(format!("OS keyring not accessible: {}", e))
        })?;
        Ok(Self)
    }

    fn entry(handle: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(SERVICE, handle)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()).into())
    }
}

impl CredentialStore for KeyringStore {
    fn store(&self, handle: &str, password: &str) -> Result<()> {
        Self::entry(handle)?
            .set_password(password)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        tracing::debug!("Stored app password for {} in OS keyring", handle);
        Ok(())
    }

    fn retrieve(&self, handle: &str) -> Result<SecretString> {
        match Self::entry(handle)?.get_password() {
            Ok(password) => {
                tracing::debug!("Retrieved app password for {} from OS keyring", handle);
                Ok(SecretString::from(password))
            }
            Err(keyring::Error::NoEntry) => {
                Err(CredentialError::NotFound(format!("{}/{}", SERVICE, handle)).into())
            }
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn delete(&self, handle: &str) -> Result<()> {
        match Self::entry(handle)?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                Err(CredentialError::NotFound(format!("{}/{}", SERVICE, handle)).into())
            }
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn backend_name(&self) -> &str {
        "keyring"
    }
}

/// Read-only store backed by an environment variable
pub struct EnvStore {
    var: String,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::with_var(PASSWORD_ENV)
    }

    pub fn with_var(var: &str) -> Self {
        Self {
            var: var.to_string(),
        }
    }
}

impl Default for EnvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvStore {
    fn store(&self, _handle: &str, _password: &str) -> Result<()> {
        Err(CredentialError::Keyring(format!(
            "the environment is read-only; export {} instead",
            self.var
        ))
        .into())
    }

    fn retrieve(&self, _handle: &str) -> Result<SecretString> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            _ => Err(CredentialError::NotFound(format!("${}", self.var)).into()),
        }
    }

    fn delete(&self, _handle: &str) -> Result<()> {
        Err(CredentialError::Keyring(format!(
            "the environment is read-only; unset {} instead",
            self.var
        ))
        .into())
    }

    fn backend_name(&self) -> &str {
        "env"
    }
}

/// Facade over the configured store chain
pub struct CredentialManager {
    stores: Vec<Box<dyn CredentialStore>>,
}

impl CredentialManager {
    /// Build the chain for a storage backend setting
    ///
    /// An unreachable keyring is logged and left out rather than failing, so
    /// the environment variable keeps working on headless machines.
    pub fn new(backend: StorageBackend) -> Self {
        let mut stores: Vec<Box<dyn CredentialStore>> = vec![Box::new(EnvStore::new())];
        if backend == StorageBackend::Keyring {
            match KeyringStore::new() {
                Ok(store) => stores.push(Box::new(store)),
                Err(e) => tracing::warn!("{}; falling back to ${}", e, PASSWORD_ENV),
            }
        }
        Self { stores }
    }

    pub fn with_stores(stores: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { stores }
    }

    /// First password found along the chain
    pub fn app_password(&self, handle: &str) -> Result<SecretString> {
        for store in &self.stores {
            match store.retrieve(handle) {
                Ok(secret) => return Ok(secret),
                Err(crate::ModToolsError::Credential(CredentialError::NotFound(_))) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CredentialError::NotFound(format!(
            "no app password for {} (checked: {}). Run `modtools-creds set` or export {}",
            handle,
            self.backends().join(", "),
            PASSWORD_ENV
        ))
        .into())
    }

    /// Store in the first writable backend
    pub fn store(&self, handle: &str, password: &str) -> Result<&str> {
        let mut last_err = None;
        for store in &self.stores {
            match store.store(handle, password) {
                Ok(()) => return Ok(store.backend_name()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| CredentialError::Keyring("no credential backend configured".to_string()).into()))
    }

    /// Delete from every writable backend that has an entry
    pub fn delete(&self, handle: &str) -> Result<usize> {
        let mut deleted = 0;
        for store in &self.stores {
            if store.backend_name() == "env" {
                continue;
            }
            match store.delete(handle) {
                Ok(()) => deleted += 1,
                Err(crate::ModToolsError::Credential(CredentialError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    pub fn backends(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.backend_name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store for exercising the chain
    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<String, String>>,
    }

    impl CredentialStore for MemoryStore {
        fn store(&self, handle: &str, password: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(handle.to_string(), password.to_string());
            Ok(())
        }

        fn retrieve(&self, handle: &str) -> Result<SecretString> {
            self.entries
                .lock()
                .unwrap()
                .get(handle)
                .map(|p| SecretString::from(p.clone()))
                .ok_or_else(|| CredentialError::NotFound(handle.to_string()).into())
        }

        fn delete(&self, handle: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .remove(handle)
                .map(|_| ())
                .ok_or_else(|| CredentialError::NotFound(handle.to_string()).into())
        }

        fn backend_name(&self) -> &str {
            "memory"
        }
    }

    #[test]
    #[serial]
    fn test_env_store_reads_variable() {
        std::env::set_var("MODTOOLS_TEST_PASSWORD", "abcd-efgh-ijkl-mnop");
        let store = EnvStore::with_var("MODTOOLS_TEST_PASSWORD");
        let secret = store.retrieve("me.bsky.social").unwrap();
        std::env::remove_var("MODTOOLS_TEST_PASSWORD");
        assert_eq!(secret.expose_secret(), "abcd-efgh-ijkl-mnop");
    }

    #[test]
    #[serial]
    fn test_env_store_blank_is_not_found() {
        std::env::set_var("MODTOOLS_TEST_PASSWORD", "  ");
        let store = EnvStore::with_var("MODTOOLS_TEST_PASSWORD");
        let result = store.retrieve("me.bsky.social");
        std::env::remove_var("MODTOOLS_TEST_PASSWORD");
        assert!(matches!(
            result,
            Err(crate::ModToolsError::Credential(CredentialError::NotFound(_)))
        ));
    }

    #[test]
    fn test_env_store_is_read_only() {
        let store = EnvStore::with_var("MODTOOLS_TEST_PASSWORD");
        assert!(store.store("me.bsky.social", "x").is_err());
        assert!(store.delete("me.bsky.social").is_err());
    }

    #[test]
    #[serial]
    fn test_manager_falls_through_to_next_store() {
        std::env::remove_var("MODTOOLS_TEST_PASSWORD");
        let memory = MemoryStore::default();
        memory.store("me.bsky.social", "from-memory").unwrap();

        let manager = CredentialManager::with_stores(vec![
            Box::new(EnvStore::with_var("MODTOOLS_TEST_PASSWORD")),
            Box::new(memory),
        ]);

        let secret = manager.app_password("me.bsky.social").unwrap();
        assert_eq!(secret.expose_secret(), "from-memory");
    }

    #[test]
    #[serial]
    fn test_manager_prefers_first_store() {
        std::env::set_var("MODTOOLS_TEST_PASSWORD", "from-env");
        let memory = MemoryStore::default();
        memory.store("me.bsky.social", "from-memory").unwrap();

        let manager = CredentialManager::with_stores(vec![
            Box::new(EnvStore::with_var("MODTOOLS_TEST_PASSWORD")),
            Box::new(memory),
        ]);

        let secret = manager.app_password("me.bsky.social").unwrap();
        std::env::remove_var("MODTOOLS_TEST_PASSWORD");
        assert_eq!(secret.expose_secret(), "from-env");
    }

    #[test]
    #[serial]
    fn test_manager_not_found_lists_backends() {
        std::env::remove_var("MODTOOLS_TEST_PASSWORD");
        let manager = CredentialManager::with_stores(vec![
            Box::new(EnvStore::with_var("MODTOOLS_TEST_PASSWORD")),
            Box::new(MemoryStore::default()),
        ]);

        let err = manager.app_password("me.bsky.social").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("env, memory"));
    }

    #[test]
    fn test_manager_store_skips_read_only_backend() {
        let manager = CredentialManager::with_stores(vec![
            Box::new(EnvStore::with_var("MODTOOLS_TEST_PASSWORD")),
            Box::new(MemoryStore::default()),
        ]);

        let backend = manager.store("me.bsky.social", "secret").unwrap();
        assert_eq!(backend, "memory");
        assert_eq!(manager.delete("me.bsky.social").unwrap(), 1);
        assert_eq!(manager.delete("me.bsky.social").unwrap(), 0);
    }
}
