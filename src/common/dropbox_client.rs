use crate::common::metrics;
use crate::common::ports::FileStorage;
use crate::common::types::{EntryKind, FileEntry, RemoteError, RemoteResult, TokenSet};
use crate::dropbox_session::OAuthCodeExchange;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Refresh the access token this many seconds before it expires.
const REFRESH_LEEWAY_SECS: i64 = 60;

/// Base URLs of the Dropbox API v2 hosts.
#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    pub api: String,
    pub content: String,
    pub authorize: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            api: "https://api.dropboxapi.com".to_string(),
            content: "https://content.dropboxapi.com".to_string(),
            authorize: "https://www.dropbox.com/oauth2/authorize".to_string(),
        }
    }
}

impl DropboxEndpoints {
    /// Points every host at one base URL (mock servers).
    pub fn single(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            api: base.to_string(),
            content: base.to_string(),
            authorize: format!("{base}/oauth2/authorize"),
        }
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct MetadataFields {
    name: String,
    path_lower: Option<String>,
    path_display: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Metadata {
    File(MetadataFields),
    Folder(MetadataFields),
    Deleted(MetadataFields),
}

impl Metadata {
    fn into_entry(self) -> Option<FileEntry> {
        let (fields, kind) = match self {
            Metadata::File(fields) => (fields, EntryKind::File),
            Metadata::Folder(fields) => (fields, EntryKind::Folder),
            Metadata::Deleted(_) => return None,
        };
        let path = fields
            .path_lower
            .or(fields.path_display)
            .unwrap_or_else(|| format!("/{}", fields.name));

        Some(FileEntry {
            path,
            name: fields.name,
            kind,
        })
    }
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

fn retrying_client(http: reqwest::Client) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
    ClientBuilder::new(http)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

fn track<T>(result: RemoteResult<T>) -> RemoteResult<T> {
    match &result {
        Ok(_) => metrics::increment_dropbox_api_success(),
        Err(_) => metrics::increment_dropbox_api_failure(),
    }
    result
}

/// Turns an error response into a `RemoteError`.
///
/// Endpoint-specific failures arrive as HTTP 409 with a nested `.tag` chain,
/// e.g. `{"error": {".tag": "path", "path": {".tag": "not_found"}}}`.
async fn error_from_response(response: Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if status != StatusCode::CONFLICT {
        return RemoteError::from_status(status, &body);
    }

    let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
        return RemoteError::Other(format!("HTTP {status}: {body}"));
    };
    let summary = parsed
        .get("error_summary")
        .and_then(Value::as_str)
        .unwrap_or(&body)
        .to_string();
    let tags = error_tags(parsed.get("error").unwrap_or(&Value::Null));

    if tags.iter().any(|t| t == "not_found") {
        RemoteError::NotFound(summary)
    } else if tags.iter().any(|t| t == "conflict") {
        RemoteError::Conflict(summary)
    } else {
        RemoteError::Other(summary)
    }
}

fn error_tags(error: &Value) -> Vec<String> {
    let mut tags = Vec::new();
    let mut current = error;

    while let Some(tag) = current.get(".tag").and_then(Value::as_str) {
        tags.push(tag.to_string());
        match current.get(tag) {
            Some(next) if next.is_object() => current = next,
            _ => break,
        }
    }

    tags
}

/// Serializes the `Dropbox-API-Arg` header value; HTTP headers must be ASCII
/// so 0x7F and everything above it is written as a JSON `\u` escape.
fn api_arg_header(arg: &Value) -> String {
    let raw = arg.to_string();
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() && c != '\x7f' {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

async fn request_token(
    client: &ClientWithMiddleware,
    endpoints: &DropboxEndpoints,
    form: &[(&str, &str)],
) -> RemoteResult<OAuthTokenResponse> {
    let response = client
        .post(format!("{}/oauth2/token", endpoints.api))
        .form(form)
        .send()
        .await?;

    if !response.status().is_success() {
        let err = match error_from_response(response).await {
            RemoteError::Other(msg) => RemoteError::Auth(msg),
            other => other,
        };
        return Err(err);
    }

    Ok(response.json::<OAuthTokenResponse>().await?)
}

/// Authorization-code half of the Dropbox OAuth flow.
pub struct DropboxOAuth {
    client: ClientWithMiddleware,
    endpoints: DropboxEndpoints,
    app_key: String,
    app_secret: String,
}

impl DropboxOAuth {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self::with_endpoints(app_key, app_secret, DropboxEndpoints::default())
    }

    pub fn with_endpoints(app_key: &str, app_secret: &str, endpoints: DropboxEndpoints) -> Self {
        Self {
            client: retrying_client(reqwest::Client::new()),
            endpoints,
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
        }
    }
}

#[async_trait]
impl OAuthCodeExchange for DropboxOAuth {
    fn authorize_url(&self) -> String {
        format!(
            "{}?client_id={}&response_type=code&token_access_type=offline",
            self.endpoints.authorize,
            urlencoding::encode(&self.app_key)
        )
    }

    async fn exchange_code(&self, code: &str) -> RemoteResult<TokenSet> {
        let response = track(
            request_token(
                &self.client,
                &self.endpoints,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", self.app_key.as_str()),
                    ("client_secret", self.app_secret.as_str()),
                ],
            )
            .await,
        )?;

        let refresh_token = response.refresh_token.ok_or_else(|| {
            RemoteError::Auth("Token response did not include a refresh token".to_string())
        })?;

        Ok(TokenSet::from_expires_in(
            response.access_token,
            refresh_token,
            response.expires_in,
        ))
    }
}

/// Dropbox API v2 client that refreshes its access token on demand.
pub struct DropboxClient {
    client: ClientWithMiddleware,
    /// Sends each request exactly once, for routes that are not idempotent
    once: ClientWithMiddleware,
    endpoints: DropboxEndpoints,
    app_key: String,
    app_secret: String,
    tokens: Mutex<TokenSet>,
}

impl DropboxClient {
    pub fn new(app_key: &str, app_secret: &str, tokens: TokenSet) -> Self {
        Self::with_endpoints(app_key, app_secret, tokens, DropboxEndpoints::default())
    }

    pub fn with_endpoints(
        app_key: &str,
        app_secret: &str,
        tokens: TokenSet,
        endpoints: DropboxEndpoints,
    ) -> Self {
        let http = reqwest::Client::new();
        Self {
            client: retrying_client(http.clone()),
            once: ClientBuilder::new(http).build(),
            endpoints,
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            tokens: Mutex::new(tokens),
        }
    }

    async fn access_token(&self) -> RemoteResult<String> {
        let mut tokens = self.tokens.lock().await;

        if tokens.expires_within(REFRESH_LEEWAY_SECS) {
            debug!("Dropbox access token expired, refreshing");
            let refresh_token = tokens.refresh_token.clone();
            let response = track(
                request_token(
                    &self.client,
                    &self.endpoints,
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.as_str()),
                        ("client_id", self.app_key.as_str()),
                        ("client_secret", self.app_secret.as_str()),
                    ],
                )
                .await,
            )?;

            *tokens = TokenSet::from_expires_in(
                response.access_token,
                response.refresh_token.unwrap_or(refresh_token),
                response.expires_in,
            );
            info!("Refreshed Dropbox access token");
        }

        Ok(tokens.access_token.clone())
    }

    async fn rpc<B, R>(&self, route: &str, body: &B) -> RemoteResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(&self.client, route, body).await
    }

    /// Like `rpc`, but a failed request is never replayed. A write that
    /// reached the server before the connection failed must not run twice.
    async fn rpc_once<B, R>(&self, route: &str, body: &B) -> RemoteResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(&self.once, route, body).await
    }

    async fn call<B, R>(&self, client: &ClientWithMiddleware, route: &str, body: &B) -> RemoteResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let access_token = self.access_token().await?;
        let result: RemoteResult<_> = async {
            let response = client
                .post(format!("{}/2/{route}", self.endpoints.api))
                .header("Authorization", format!("Bearer {access_token}"))
                .json(body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            Ok(response.json::<R>().await?)
        }
        .await;

        track(result)
    }

    /// Current token set, including any refresh made during this run.
    pub async fn tokens(&self) -> TokenSet {
        self.tokens.lock().await.clone()
    }
}

#[async_trait]
impl FileStorage for DropboxClient {
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<FileEntry>> {
        let mut page: ListFolderResponse = self
            .rpc("files/list_folder", &json!({ "path": folder }))
            .await?;
        let mut entries: Vec<FileEntry> = Vec::new();

        loop {
            entries.extend(page.entries.into_iter().filter_map(Metadata::into_entry));
            if !page.has_more {
                break;
            }
            page = self
                .rpc("files/list_folder/continue", &json!({ "cursor": page.cursor }))
                .await?;
        }

        debug!("Listed {} entries under {}", entries.len(), folder);
        Ok(entries)
    }

    async fn download(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let access_token = self.access_token().await?;
        let result: RemoteResult<_> = async {
            let response = self
                .client
                .post(format!("{}/2/files/download", self.endpoints.content))
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Dropbox-API-Arg", api_arg_header(&json!({ "path": path })))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            Ok(response.bytes().await?.to_vec())
        }
        .await;

        track(result)
    }

    async fn get_metadata(&self, path: &str) -> RemoteResult<FileEntry> {
        let metadata: Metadata = self
            .rpc("files/get_metadata", &json!({ "path": path }))
            .await?;

        metadata
            .into_entry()
            .ok_or_else(|| RemoteError::NotFound(format!("{path} has been deleted")))
    }

    async fn create_folder(&self, path: &str) -> RemoteResult<()> {
        let _: Value = self
            .rpc_once(
                "files/create_folder_v2",
                &json!({ "path": path, "autorename": false }),
            )
            .await?;
        Ok(())
    }

    async fn move_file(&self, from_path: &str, to_path: &str) -> RemoteResult<()> {
        let _: Value = self
            .rpc_once(
                "files/move_v2",
                &json!({ "from_path": from_path, "to_path": to_path, "autorename": false }),
            )
            .await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> RemoteResult<()> {
        let _: Value = self
            .rpc_once("files/delete_v2", &json!({ "path": path }))
            .await?;
        Ok(())
    }
}
