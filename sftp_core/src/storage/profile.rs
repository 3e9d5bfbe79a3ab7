use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::errors::SftpError;
use crate::connections::transport::Credential;

/// Keyring service under which profile secrets are stored.
pub const KEYRING_SERVICE: &str = "sftp_rs";

fn default_port() -> u16 {
    22
}

/// Where the secret for a profile comes from.
///
/// The enum is `#[serde(tag = "kind")]` so JSON looks like:
/// `{ "kind":"KeyFile", "path":"/home/me/.ssh/id_ed25519", "passphrase_in_keyring":false }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum CredentialRef {
    /// Password held in the OS keyring under the profile id.
    Keyring,
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase_in_keyring: bool,
    },
    Agent,
    /// Password supplied by the caller. `ProfileStore::save` never writes it
    /// to disk: it moves it into the keyring when `remember` is set and drops
    /// it otherwise.
    Inline {
        password: String,
        #[serde(default)]
        remember: bool,
    },
}

impl CredentialRef {
    /// Look the secret up.
    pub fn resolve(&self, profile_id: &str) -> Result<Credential, SftpError> {
        match self {
            CredentialRef::Inline { password, .. } => Ok(Credential::Password(password.clone())),
            CredentialRef::Agent => Ok(Credential::Agent),
            CredentialRef::Keyring => Ok(Credential::Password(keyring_secret(profile_id)?)),
            CredentialRef::KeyFile {
                path,
                passphrase_in_keyring,
            } => {
                let passphrase = if *passphrase_in_keyring {
                    Some(keyring_secret(profile_id)?)
                } else {
                    None
                };
                Ok(Credential::KeyFile {
                    path: path.clone(),
                    passphrase,
                })
            }
        }
    }
}

fn keyring_secret(profile_id: &str) -> Result<String, SftpError> {
    keyring::Entry::new(KEYRING_SERVICE, profile_id)
        .and_then(|entry| entry.get_password())
        .map_err(|e| SftpError::MissingCredential(format!("{profile_id}: {e}")))
}

/// A saved remote endpoint. Immutable for as long as a session is open on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub credential: CredentialRef,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ConnectionProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: CredentialRef,
    ) -> Self {
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            credential,
            created_at: Utc::now(),
            last_used: None,
            description: None,
        }
    }

    /// `user@host:port`, for logs and titles.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Two profiles with the same host, port and user describe the same login.
    pub fn same_endpoint(&self, other: &ConnectionProfile) -> bool {
        self.host == other.host && self.port == other.port && self.username == other.username
    }

    /// Timestamp used for "most recent first" ordering.
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_used.unwrap_or(self.created_at)
    }
}

/// Connection record as kept by the desktop front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConnection {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub save_password: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<SavedConnection> for ConnectionProfile {
    fn from(saved: SavedConnection) -> Self {
        let credential = match saved.password {
            Some(password) if !password.is_empty() => CredentialRef::Inline {
                password,
                remember: saved.save_password,
            },
            _ => CredentialRef::Keyring,
        };
        ConnectionProfile {
            id: saved.id,
            name: saved.name,
            host: saved.host,
            port: saved.port,
            username: saved.username,
            credential,
            created_at: saved.created_at,
            last_used: saved.last_used,
            description: saved.description,
        }
    }
}
