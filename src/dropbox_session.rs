//! Dropbox OAuth session bootstrap.
//!
//! A cached token file short-circuits straight to [`StorageAuthState::Authorized`].
//! Without one the user is sent to the authorization URL and the pasted code
//! is exchanged for an access/refresh token pair. Deployments without a
//! terminal can pre-seed the token file instead.

use crate::common::config::Config;
use crate::common::dropbox_client::{DropboxClient, DropboxOAuth};
use crate::common::types::{RemoteResult, SessionError, TokenSet};
use crate::session_store;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

/// Authorization-code exchange against the storage provider.
#[async_trait]
pub trait OAuthCodeExchange: Send + Sync {
    fn authorize_url(&self) -> String;

    async fn exchange_code(&self, code: &str) -> RemoteResult<TokenSet>;
}

/// Source of the authorization code the user obtains from the browser.
#[async_trait]
pub trait AuthCodePrompt: Send + Sync {
    async fn read_code(&self, authorize_url: &str) -> std::io::Result<String>;
}

/// Prompts on the terminal and reads one line from stdin.
pub struct StdinPrompt;

#[async_trait]
impl AuthCodePrompt for StdinPrompt {
    async fn read_code(&self, authorize_url: &str) -> std::io::Result<String> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(
                format!(
                    "1. Go to: {authorize_url}\n2. Click \"Allow\" (you might have to log in first).\n3. Copy the authorization code.\nEnter the authorization code here: "
                )
                .as_bytes(),
            )
            .await?;
        stdout.flush().await?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageAuthState {
    NoToken,
    AwaitingAuthCode { authorize_url: String },
    Authorized(TokenSet),
}

pub struct DropboxSessionManager {
    app_key: String,
    app_secret: String,
    token_file: PathBuf,
}

impl DropboxSessionManager {
    /// Fails when the app key or secret is not configured.
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let (Some(app_key), Some(app_secret)) = (
            config.dropbox_app_key.clone(),
            config.dropbox_app_secret.clone(),
        ) else {
            return Err(SessionError::MissingCredentials(
                "DROPBOX_APP_KEY and DROPBOX_APP_SECRET must be set".to_string(),
            ));
        };

        Ok(Self {
            app_key,
            app_secret,
            token_file: config.dropbox_token_file.clone(),
        })
    }

    /// Establishes the session with the production endpoints and returns a
    /// client that refreshes its own access token.
    pub async fn connect(&self, prompt: &impl AuthCodePrompt) -> Result<DropboxClient, SessionError> {
        let oauth = DropboxOAuth::new(&self.app_key, &self.app_secret);
        let tokens = self.establish(&oauth, prompt).await?;
        info!("Connected to Dropbox.");
        Ok(DropboxClient::new(&self.app_key, &self.app_secret, tokens))
    }

    /// Initial state derived from the token file.
    pub fn load_state(&self) -> StorageAuthState {
        match session_store::load_json::<TokenSet>(&self.token_file) {
            Ok(Some(tokens)) => StorageAuthState::Authorized(tokens),
            Ok(None) => StorageAuthState::NoToken,
            Err(e) => {
                warn!(
                    "Ignoring unreadable Dropbox token file {}: {}",
                    self.token_file.display(),
                    e
                );
                StorageAuthState::NoToken
            }
        }
    }

    pub async fn establish(
        &self,
        oauth: &impl OAuthCodeExchange,
        prompt: &impl AuthCodePrompt,
    ) -> Result<TokenSet, SessionError> {
        let mut state = self.load_state();

        loop {
            state = match state {
                StorageAuthState::NoToken => {
                    info!("No Dropbox token found, starting authorization flow");
                    StorageAuthState::AwaitingAuthCode {
                        authorize_url: oauth.authorize_url(),
                    }
                }
                StorageAuthState::AwaitingAuthCode { authorize_url } => {
                    let code = prompt.read_code(&authorize_url).await?;
                    let code = code.trim();
                    if code.is_empty() {
                        return Err(SessionError::EmptyAuthCode);
                    }

                    let tokens = oauth.exchange_code(code).await.inspect_err(|e| {
                        error!("Dropbox authorization code exchange failed: {}", e);
                    })?;

                    match session_store::save_json(&self.token_file, &tokens) {
                        Ok(()) => info!("Saved Dropbox tokens to {}", self.token_file.display()),
                        Err(e) => warn!(
                            "Failed to save Dropbox tokens to {}: {}",
                            self.token_file.display(),
                            e
                        ),
                    }

                    StorageAuthState::Authorized(tokens)
                }
                StorageAuthState::Authorized(tokens) => return Ok(tokens),
            };
        }
    }
}
