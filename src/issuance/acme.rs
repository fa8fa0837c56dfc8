use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::info;
use zeroize::Zeroizing;

use crate::core::types::ApiEnvironment;
use crate::distribution::export::write_secure_file;

pub fn generate_account_key_pem() -> Result<String> {
    let key = rcgen::KeyPair::generate()?;
    Ok(key.serialize_pem())
}

/// ACME account key on disk, one per directory environment so a staging
/// registration is never replayed against production.
#[derive(Debug, Clone)]
pub struct AccountKeyStore {
    path: PathBuf,
}

impl AccountKeyStore {
    pub fn new(state_dir: &Path, environment: ApiEnvironment) -> Self {
        let file = format!("account-{}.pem", environment.as_str().to_ascii_lowercase());
        Self {
            path: state_dir.join(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored key, generating and saving one on first use.
    pub fn load_or_create(&self) -> Result<Zeroizing<String>> {
        if self.path.exists() {
            let pem = Zeroizing::new(
                fs::read_to_string(&self.path)
                    .with_context(|| format!("failed to read {}", self.path.display()))?,
            );
            if !pem.contains("PRIVATE KEY") {
                return Err(anyhow!(
                    "{} does not contain a PEM private key",
                    self.path.display()
                ));
            }
            return Ok(pem);
        }

        let pem = Zeroizing::new(generate_account_key_pem()?);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_secure_file(&self.path, pem.as_bytes(), false)?;
        info!("[acme] generated new account key at {}", self.path.display());
        Ok(pem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("acme-account-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn creates_key_once_and_reuses_it() {
        let dir = temp_dir();
        let store = AccountKeyStore::new(&dir, ApiEnvironment::Staging);
        let first = store.load_or_create().unwrap();
        let second = store.load_or_create().unwrap();
        assert_eq!(*first, *second);
        assert!(first.contains("PRIVATE KEY"));
        assert!(store.path().ends_with("account-staging.pem"));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn environments_use_distinct_files() {
        let dir = temp_dir();
        let staging = AccountKeyStore::new(&dir, ApiEnvironment::Staging);
        let production = AccountKeyStore::new(&dir, ApiEnvironment::Production);
        assert_ne!(staging.path(), production.path());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn rejects_garbage_key_file() {
        let dir = temp_dir();
        let store = AccountKeyStore::new(&dir, ApiEnvironment::Production);
        fs::write(store.path(), "not a key").unwrap();
        assert!(store.load_or_create().is_err());
        fs::remove_dir_all(dir).ok();
    }
}
