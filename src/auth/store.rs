use super::{ClientIdentity, Credential};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// The app-provisioned client secrets file as downloaded from the provider console.
#[derive(Deserialize)]
struct ClientSecrets {
    installed: Option<ClientIdentity>,
    web: Option<ClientIdentity>,
}

/// Loads and persists the authorized user credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    token_path: PathBuf,
    credentials_path: PathBuf,
}

impl CredentialStore {
    /// Creates a store persisting to `token_path` and reading the client identity from
    /// `credentials_path`.
    pub fn new(token_path: impl Into<PathBuf>, credentials_path: impl Into<PathBuf>) -> Self {
        CredentialStore {
            token_path: token_path.into(),
            credentials_path: credentials_path.into(),
        }
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Reads the persisted credential. Any read or parse failure yields `None`.
    pub async fn load(&self) -> Option<Credential> {
        let content = match fs::read(&self.token_path).await {
            Ok(content) => content,
            Err(err) => {
                log::debug!(
                    "no stored credential at {}: {err}",
                    self.token_path.display()
                );
                return None;
            }
        };

        match serde_json::from_slice(&content) {
            Ok(credential) => Some(credential),
            Err(err) => {
                log::warn!(
                    "ignoring malformed credential at {}: {err}",
                    self.token_path.display()
                );
                None
            }
        }
    }

    /// Reads the registered client identity, preferring the `installed` section over `web`.
    pub async fn client_identity(&self) -> Result<ClientIdentity> {
        let content = fs::read(&self.credentials_path).await?;
        let secrets: ClientSecrets = serde_json::from_slice(&content)?;

        secrets
            .installed
            .or(secrets.web)
            .ok_or(Error::MissingClientIdentity)
    }

    /// Persists the refresh capability of `credential` together with the registered client
    /// identity, replacing any previously stored credential.
    ///
    /// The record is written to a sibling temporary file first and then renamed over the target,
    /// so readers never observe a partially written file.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        let identity = self.client_identity().await?;
        let record = Credential::authorized_user(identity, credential.refresh_token.clone());
        let payload = serde_json::to_vec(&record)?;

        if let Some(parent) = self.token_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.token_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.token_path).await?;

        log::info!("stored credential at {}", self.token_path.display());

        Ok(())
    }
}
