//! Token exchange and durable credential persistence.
//!
//! The session is two key-value entries (the access token and the signed-in
//! user) written to one JSON vault file under the config dir and read back
//! at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::config::ClientConfig;

pub const VAULT_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// What the auth endpoint returns and what the vault persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub user: UserProfile,
}

// Vault entries keep their historical key names: the token entry is called
// "token", not "access_token".
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultEntries {
    token: String,
    user: UserProfile,
}

impl From<Credentials> for VaultEntries {
    fn from(credentials: Credentials) -> Self {
        Self {
            token: credentials.access_token,
            user: credentials.user,
        }
    }
}

impl From<VaultEntries> for Credentials {
    fn from(entries: VaultEntries) -> Self {
        Self {
            access_token: entries.token,
            user: entries.user,
        }
    }
}

/// Durable storage for the (token, user) pair.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    path: PathBuf,
}

impl CredentialVault {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        ClientConfig::default_config_dir().join(VAULT_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads persisted credentials; an absent or corrupt vault reads as
    /// signed out rather than failing startup.
    pub fn load(&self) -> Option<Credentials> {
        if !self.path.exists() {
            return None;
        }
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "failed to read credential vault");
                return None;
            }
        };
        match serde_json::from_str::<VaultEntries>(&raw) {
            Ok(entries) => Some(entries.into()),
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "failed to parse credential vault");
                None
            }
        }
    }

    pub fn store(&self, credentials: &Credentials) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context(CreateVaultDirSnafu {
                stage: "create-vault-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let entries = VaultEntries::from(credentials.clone());
        let content = serde_json::to_string_pretty(&entries).context(SerializeVaultSnafu {
            stage: "serialize-vault",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteVaultSnafu {
            stage: "write-temporary-vault-file",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(RenameVaultSnafu {
            stage: "rename-temporary-vault-file",
            from: temp_path,
            to: self.path.clone(),
        })?;

        tracing::info!(path = %self.path.display(), "persisted session credentials");
        Ok(())
    }

    pub fn clear(&self) -> AuthResult<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context(RemoveVaultSnafu {
                stage: "remove-vault-file",
                path: self.path.clone(),
            })?;
        }
        Ok(())
    }
}

/// Exchanges an identity-provider token for a session and keeps the current
/// credentials hot-swappable for the rest of the process.
pub struct AuthClient {
    http: reqwest::Client,
    api_base_url: String,
    vault: CredentialVault,
    current: ArcSwapOption<Credentials>,
}

impl AuthClient {
    pub fn new(config: &ClientConfig, vault: CredentialVault) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base_url: config.api_base_url.clone(),
            vault,
            current: ArcSwapOption::empty(),
        }
    }

    /// Reads the vault back at startup. Returns the restored user, if any.
    pub fn restore(&self) -> Option<Arc<Credentials>> {
        let credentials = self.vault.load()?;
        self.current.store(Some(Arc::new(credentials)));
        self.current.load_full()
    }

    pub fn current(&self) -> Option<Arc<Credentials>> {
        self.current.load_full()
    }

    pub async fn login(&self, provider_token: &str) -> AuthResult<Credentials> {
        let url = format!("{}/auth/google/login", self.api_base_url);
        tracing::info!("exchanging identity token for a session");

        let response = self
            .http
            .post(&url)
            .query(&[("token", provider_token)])
            .header("Accept", "application/json")
            .send()
            .await
            .context(LoginRequestSnafu {
                stage: "login-request",
            })?;

        let status = response.status();
        let body = response.text().await.context(LoginRequestSnafu {
            stage: "login-read-body",
        })?;
        if !status.is_success() {
            return LoginStatusSnafu {
                stage: "login-status",
                status: status.as_u16(),
            }
            .fail();
        }

        let credentials: Credentials =
            serde_json::from_str(&body).context(DecodeLoginSnafu {
                stage: "login-decode",
            })?;

        self.vault.store(&credentials)?;
        self.current.store(Some(Arc::new(credentials.clone())));
        tracing::info!(user = %credentials.user.email, "signed in");
        Ok(credentials)
    }

    /// Clears the in-memory session and both vault entries. The caller is
    /// responsible for resetting the conversation store.
    pub fn logout(&self) -> AuthResult<()> {
        self.current.store(None);
        self.vault.clear()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuthError {
    #[snafu(display("failed to create vault directory at {path:?} on `{stage}`"))]
    CreateVaultDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize credentials on `{stage}`"))]
    SerializeVault {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write vault file at {path:?} on `{stage}`"))]
    WriteVault {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace vault file from {from:?} to {to:?} on `{stage}`"))]
    RenameVault {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove vault file at {path:?} on `{stage}`"))]
    RemoveVault {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("login request failed on `{stage}`"))]
    LoginRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("login rejected with HTTP status {status}"))]
    LoginStatus { stage: &'static str, status: u16 },
    #[snafu(display("login response did not match the expected shape"))]
    DecodeLogin {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;
