use crate::common::types::Disposition;
use std::env;
use std::path::PathBuf;

const DEFAULT_GARMIN_TOKENS: &str = "~/.garminconnect";
const DEFAULT_GARMIN_TOKENS_BASE64: &str = "~/.garminconnect_base64";
const DEFAULT_DROPBOX_TOKEN_FILE: &str = "~/.dropbox_token.json";
const DEFAULT_DROPBOX_FOLDER: &str = "/Apps/TrainerDay";
const PROCESSED_SUBFOLDER: &str = "Processed";

/// Process-wide settings, read once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub garmin_username: Option<String>,
    pub garmin_password: Option<String>,
    /// Directory holding the cached Garmin OAuth tokens
    pub garmin_token_dir: PathBuf,
    /// File receiving the base64-encoded Garmin session
    pub garmin_token_base64: PathBuf,
    pub garmin_is_cn: bool,
    pub dropbox_app_key: Option<String>,
    pub dropbox_app_secret: Option<String>,
    pub dropbox_token_file: PathBuf,
    pub dropbox_folder: String,
    pub disposition: Disposition,
    pub download_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let home = lookup("HOME");
        let path_or = |key: &str, default: &str| {
            expand_home(&get(key).unwrap_or_else(|| default.to_string()), home.as_deref())
        };

        let dropbox_folder = get("DROPBOX_FOLDER")
            .map(|f| f.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_DROPBOX_FOLDER.to_string());

        Self {
            garmin_username: get("GARMIN_USERNAME"),
            garmin_password: get("GARMIN_PASSWORD"),
            garmin_token_dir: path_or("GARMINTOKENS", DEFAULT_GARMIN_TOKENS),
            garmin_token_base64: path_or("GARMINTOKENS_BASE64", DEFAULT_GARMIN_TOKENS_BASE64),
            garmin_is_cn: get("GARMIN_IS_CN")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            dropbox_app_key: get("DROPBOX_APP_KEY"),
            dropbox_app_secret: get("DROPBOX_APP_SECRET"),
            dropbox_token_file: path_or("DROPBOX_TOKEN_FILE", DEFAULT_DROPBOX_TOKEN_FILE),
            dropbox_folder,
            disposition: get("POST_UPLOAD_STRATEGY")
                .map(|v| Disposition::parse(&v))
                .unwrap_or_default(),
            download_dir: path_or("DOWNLOAD_DIR", "downloads"),
            log_dir: path_or("LOG_DIR", "logs"),
        }
    }

    /// Archive folder used by the `move` disposition.
    pub fn processed_folder(&self) -> String {
        format!("{}/{}", self.dropbox_folder, PROCESSED_SUBFOLDER)
    }
}

/// Expands a leading `~` to the home directory, when one is known.
pub fn expand_home(path: &str, home: Option<&str>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            PathBuf::from(format!("{home}{rest}"))
        }
        _ => PathBuf::from(path),
    }
}
