use crate::common::config::Config;
use crate::common::garmin_client::{GarminSession, OAuth1Token, OAuth2Token};
use crate::common::types::{RemoteError, RemoteResult, SessionError};
use crate::session_store;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const OAUTH1_FILE: &str = "oauth1_token.json";
const OAUTH2_FILE: &str = "oauth2_token.json";

/// Login operations against the fitness tracking service.
#[async_trait]
pub trait TrackingAuthenticator: Send + Sync {
    /// Revalidates a cached session, refreshing its bearer token if needed.
    async fn resume(&self, session: GarminSession) -> RemoteResult<GarminSession>;

    async fn login(&self, username: &str, password: &str) -> RemoteResult<GarminSession>;
}

/// Loads the session from a token directory; `Ok(None)` when either token
/// file is missing.
pub fn load_session(dir: &Path) -> io::Result<Option<GarminSession>> {
    let oauth1: Option<OAuth1Token> = session_store::load_json(&dir.join(OAUTH1_FILE))?;
    let oauth2: Option<OAuth2Token> = session_store::load_json(&dir.join(OAUTH2_FILE))?;

    Ok(oauth1.zip(oauth2).map(|(oauth1, oauth2)| GarminSession { oauth1, oauth2 }))
}

pub fn dump_session(dir: &Path, session: &GarminSession) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    session_store::save_json(&dir.join(OAUTH1_FILE), &session.oauth1)?;
    session_store::save_json(&dir.join(OAUTH2_FILE), &session.oauth2)
}

pub struct GarminSessionManager {
    username: Option<String>,
    password: Option<String>,
    token_dir: PathBuf,
    token_base64_file: PathBuf,
}

impl GarminSessionManager {
    pub fn from_config(config: &Config) -> Self {
        Self {
            username: config.garmin_username.clone(),
            password: config.garmin_password.clone(),
            token_dir: config.garmin_token_dir.clone(),
            token_base64_file: config.garmin_token_base64.clone(),
        }
    }

    /// Restores the cached session or falls back to a single credential
    /// login. Only a missing, unreadable or rejected cache falls back; an
    /// unreachable service and any failure of the fallback are fatal.
    pub async fn establish(
        &self,
        auth: &impl TrackingAuthenticator,
    ) -> Result<GarminSession, SessionError> {
        match self.restore(auth).await {
            Ok(session) => {
                info!("Restored Garmin session from {}", self.token_dir.display());
                return Ok(session);
            }
            Err(
                e @ (RemoteError::NotFound(_) | RemoteError::Auth(_) | RemoteError::Io(_)),
            ) => warn!(
                "Could not restore Garmin session, logging in with credentials: {}",
                e
            ),
            Err(e) => {
                error!("Garmin API init error: {}", e);
                return Err(e.into());
            }
        }

        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            error!("Garmin API init error: GARMIN_USERNAME and GARMIN_PASSWORD are not set");
            return Err(SessionError::MissingCredentials(
                "GARMIN_USERNAME and GARMIN_PASSWORD must be set".to_string(),
            ));
        };

        let session = auth.login(username, password).await.inspect_err(|e| {
            error!("Garmin API init error: {}", e);
        })?;
        info!("Logged in to Garmin Connect as {}", username);

        self.persist(&session);
        Ok(session)
    }

    async fn restore(&self, auth: &impl TrackingAuthenticator) -> RemoteResult<GarminSession> {
        let cached = load_session(&self.token_dir)?.ok_or_else(|| {
            RemoteError::NotFound(format!(
                "No Garmin tokens in {}",
                self.token_dir.display()
            ))
        })?;

        let session = auth.resume(cached.clone()).await?;
        if session != cached {
            info!("Garmin OAuth2 token was refreshed, updating cache");
            if let Err(e) = dump_session(&self.token_dir, &session) {
                warn!("Failed to update Garmin token cache: {}", e);
            }
        }

        Ok(session)
    }

    fn persist(&self, session: &GarminSession) {
        match dump_session(&self.token_dir, session) {
            Ok(()) => info!("Saved Garmin tokens to {}", self.token_dir.display()),
            Err(e) => warn!(
                "Failed to save Garmin tokens to {}: {}",
                self.token_dir.display(),
                e
            ),
        }

        let encoded = match session.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode Garmin session: {}", e);
                return;
            }
        };
        if let Err(e) = session_store::save_text(&self.token_base64_file, &encoded) {
            warn!(
                "Failed to save encoded Garmin session to {}: {}",
                self.token_base64_file.display(),
                e
            );
        }
    }
}
