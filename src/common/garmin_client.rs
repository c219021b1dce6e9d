use crate::common::metrics;
use crate::common::ports::ActivityUploader;
use crate::common::types::{RemoteError, RemoteResult};
use crate::garmin_session::TrackingAuthenticator;
use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

const USER_AGENT: &str = "com.garmin.android.apps.connectmobile";
const CONSUMER_URL: &str = "https://thegarth.s3.amazonaws.com/oauth_consumer.json";
const SUPPORTED_FORMATS: &[&str] = &["fit", "gpx", "tcx"];

static CSRF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="_csrf"\s+value="(.+?)""#).expect("valid regex"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>(.+?)</title>").expect("valid regex"));
static TICKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"embed\?ticket=([^"]+)""#).expect("valid regex"));

/// Base URLs of the Garmin SSO and Connect API hosts.
#[derive(Debug, Clone)]
pub struct GarminEndpoints {
    pub domain: String,
    pub sso: String,
    pub connectapi: String,
    pub consumer_url: String,
}

impl GarminEndpoints {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            sso: format!("https://sso.{domain}/sso"),
            connectapi: format!("https://connectapi.{domain}"),
            consumer_url: CONSUMER_URL.to_string(),
        }
    }

    pub fn global() -> Self {
        Self::for_domain("garmin.com")
    }

    pub fn china() -> Self {
        Self::for_domain("garmin.cn")
    }

    /// Points every host at one base URL (mock servers).
    pub fn single(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            domain: "garmin.com".to_string(),
            sso: format!("{base}/sso"),
            connectapi: base.to_string(),
            consumer_url: format!("{base}/oauth_consumer.json"),
        }
    }

    fn sso_embed(&self) -> String {
        format!("{}/embed", self.sso)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth1Token {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    #[serde(default)]
    pub mfa_token: Option<String>,
    #[serde(default)]
    pub mfa_expiration_timestamp: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Token {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub refresh_token_expires_in: i64,
    #[serde(default)]
    pub refresh_token_expires_at: i64,
}

impl OAuth2Token {
    /// Converts the relative lifetimes of a fresh token into timestamps.
    fn stamped(mut self) -> Self {
        let now = Utc::now().timestamp();
        self.expires_at = now + self.expires_in;
        self.refresh_token_expires_at = now + self.refresh_token_expires_in;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now().timestamp()
    }
}

/// Authenticated Garmin Connect session: the long-lived OAuth1 token and the
/// OAuth2 bearer token derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct GarminSession {
    pub oauth1: OAuth1Token,
    pub oauth2: OAuth2Token,
}

impl GarminSession {
    /// Base64 of the JSON array `[oauth1, oauth2]`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(&(&self.oauth1, &self.oauth2))?;
        Ok(BASE64_STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> RemoteResult<Self> {
        let json = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| RemoteError::Other(format!("Invalid session encoding: {e}")))?;
        let (oauth1, oauth2) = serde_json::from_slice(&json)?;
        Ok(Self { oauth1, oauth2 })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthConsumer {
    consumer_key: String,
    consumer_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialProfile {
    display_name: Option<String>,
    full_name: Option<String>,
}

type HmacSha1 = Hmac<Sha1>;

fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// OAuth 1.0a signature base string (RFC 5849 section 3.4.1).
fn signature_base_string(method: &str, url: &str, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

fn hmac_sha1_signature(base: &str, consumer_secret: &str, token_secret: &str) -> RemoteResult<String> {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| RemoteError::Other(format!("Invalid signing key: {e}")))?;
    mac.update(base.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Builds the `Authorization: OAuth ...` header for a signed request.
/// `params` are the query and form parameters that travel with the request.
fn oauth1_header(
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    consumer: &OAuthConsumer,
    token: Option<&OAuth1Token>,
) -> RemoteResult<String> {
    let nonce: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    let mut oauth_params = vec![
        ("oauth_consumer_key".to_string(), consumer.consumer_key.clone()),
        ("oauth_nonce".to_string(), nonce),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), Utc::now().timestamp().to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(token) = token {
        oauth_params.push(("oauth_token".to_string(), token.oauth_token.clone()));
    }

    let mut all_params = oauth_params.clone();
    all_params.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    let base = signature_base_string(method, url, &all_params);
    let signature = hmac_sha1_signature(
        &base,
        &consumer.consumer_secret,
        token.map(|t| t.oauth_token_secret.as_str()).unwrap_or(""),
    )?;
    oauth_params.push(("oauth_signature".to_string(), signature));

    let fields = oauth_params
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {fields}"))
}

fn parse_form_body(body: &str) -> HashMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter_map(|(k, v)| {
            let key = urlencoding::decode(&k.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn track<T>(result: RemoteResult<T>) -> RemoteResult<T> {
    match &result {
        Ok(_) => metrics::increment_garmin_api_success(),
        Err(_) => metrics::increment_garmin_api_failure(),
    }
    result
}

async fn check_status(response: reqwest::Response) -> RemoteResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status, &body))
}

pub struct GarminClient {
    api: ClientWithMiddleware,
    http: reqwest::Client,
    endpoints: GarminEndpoints,
}

impl GarminClient {
    pub fn new(is_cn: bool) -> RemoteResult<Self> {
        let endpoints = if is_cn {
            GarminEndpoints::china()
        } else {
            GarminEndpoints::global()
        };
        Self::with_endpoints(endpoints)
    }

    pub fn with_endpoints(endpoints: GarminEndpoints) -> RemoteResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

        // SSO relies on cookies set by the embed page
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let api = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            api,
            http,
            endpoints,
        })
    }

    /// Full credential login: SSO sign-in, OAuth1 pre-authorization and
    /// OAuth2 exchange.
    pub async fn login(&self, username: &str, password: &str) -> RemoteResult<GarminSession> {
        let result: RemoteResult<_> = async {
            let ticket = self.sso_ticket(username, password).await?;
            let consumer = self.consumer().await?;
            let oauth1 = self.preauthorize(&consumer, &ticket).await?;
            let oauth2 = self.exchange(&consumer, &oauth1).await?;
            Ok(GarminSession { oauth1, oauth2 })
        }
        .await;

        track(result)
    }

    /// Re-exchanges an expired OAuth2 token, then validates the session
    /// against the profile endpoint.
    pub async fn resume(&self, mut session: GarminSession) -> RemoteResult<GarminSession> {
        let result: RemoteResult<_> = async move {
            if session.oauth2.is_expired() {
                debug!("Garmin OAuth2 token expired, exchanging OAuth1 token");
                let consumer = self.consumer().await?;
                session.oauth2 = self.exchange(&consumer, &session.oauth1).await?;
            }

            let profile = self.social_profile(&session).await?;
            info!(
                "Garmin session valid for {}",
                profile
                    .full_name
                    .or(profile.display_name)
                    .unwrap_or_else(|| "unknown user".to_string())
            );
            Ok(session)
        }
        .await;

        track(result)
    }

    pub async fn upload_activity(&self, session: &GarminSession, file: &Path) -> RemoteResult<()> {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RemoteError::Other(format!("Invalid file name: {}", file.display())))?
            .to_string();

        let extension = file
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_FORMATS.contains(&extension.as_str()) {
            return Err(RemoteError::Other(format!(
                "Unsupported activity format '{extension}' for {file_name}"
            )));
        }

        let data = tokio::fs::read(file).await?;
        let form = Form::new().part("file", Part::bytes(data).file_name(file_name));

        let result: RemoteResult<_> = async {
            let response = self
                .http
                .post(format!("{}/upload-service/upload", self.endpoints.connectapi))
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", session.oauth2.access_token),
                )
                .multipart(form)
                .send()
                .await?;
            check_status(response).await.map(|_| ())
        }
        .await;

        track(result)
    }

    async fn sso_ticket(&self, username: &str, password: &str) -> RemoteResult<String> {
        let sso = &self.endpoints.sso;
        let sso_embed = self.endpoints.sso_embed();

        let embed_params = [
            ("id", "gauth-widget"),
            ("embedWidget", "true"),
            ("gauthHost", sso.as_str()),
        ];
        let signin_params = [
            ("id", "gauth-widget"),
            ("embedWidget", "true"),
            ("gauthHost", sso_embed.as_str()),
            ("service", sso_embed.as_str()),
            ("source", sso_embed.as_str()),
            ("redirectAfterAccountLoginUrl", sso_embed.as_str()),
            ("redirectAfterAccountCreationUrl", sso_embed.as_str()),
        ];
        let signin_url = format!("{sso}/signin");

        let response = self.http.get(&sso_embed).query(&embed_params).send().await?;
        check_status(response).await?;

        let response = self.http.get(&signin_url).query(&signin_params).send().await?;
        let page = check_status(response).await?.text().await?;
        let csrf = CSRF_RE
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| RemoteError::Other("CSRF token not found on sign-in page".into()))?;

        let response = self
            .http
            .post(&signin_url)
            .query(&signin_params)
            .header(header::REFERER, signin_url.as_str())
            .form(&[
                ("username", username),
                ("password", password),
                ("embed", "true"),
                ("_csrf", csrf.as_str()),
            ])
            .send()
            .await?;
        let page = check_status(response).await?.text().await?;

        let title = TITLE_RE
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        if title.contains("MFA") {
            return Err(RemoteError::Auth(
                "Multi-factor authentication is not supported".into(),
            ));
        }
        if title != "Success" {
            return Err(RemoteError::Auth(format!(
                "Sign-in rejected (page title: '{title}')"
            )));
        }

        TICKET_RE
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| RemoteError::Auth("Service ticket not found after sign-in".into()))
    }

    async fn consumer(&self) -> RemoteResult<OAuthConsumer> {
        let response = self.api.get(&self.endpoints.consumer_url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<OAuthConsumer>().await?)
    }

    async fn preauthorize(&self, consumer: &OAuthConsumer, ticket: &str) -> RemoteResult<OAuth1Token> {
        let url = format!(
            "{}/oauth-service/oauth/preauthorized",
            self.endpoints.connectapi
        );
        let login_url = self.endpoints.sso_embed();
        let query = [
            ("ticket", ticket),
            ("login-url", login_url.as_str()),
            ("accepts-mfa-tokens", "true"),
        ];
        let authorization = oauth1_header("GET", &url, &query, consumer, None)?;

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;

        let mut fields = parse_form_body(&body);
        let (Some(oauth_token), Some(oauth_token_secret)) = (
            fields.remove("oauth_token"),
            fields.remove("oauth_token_secret"),
        ) else {
            return Err(RemoteError::Auth(
                "Pre-authorization response is missing the OAuth1 token".into(),
            ));
        };

        Ok(OAuth1Token {
            oauth_token,
            oauth_token_secret,
            mfa_token: fields.remove("mfa_token"),
            mfa_expiration_timestamp: fields.remove("mfa_expiration_timestamp"),
            domain: Some(self.endpoints.domain.clone()),
        })
    }

    async fn exchange(&self, consumer: &OAuthConsumer, oauth1: &OAuth1Token) -> RemoteResult<OAuth2Token> {
        let url = format!(
            "{}/oauth-service/oauth/exchange/user/2.0",
            self.endpoints.connectapi
        );
        let form: Vec<(&str, &str)> = oauth1
            .mfa_token
            .as_deref()
            .map(|token| vec![("mfa_token", token)])
            .unwrap_or_default();
        let authorization = oauth1_header("POST", &url, &form, consumer, Some(oauth1))?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, authorization)
            .form(&form)
            .send()
            .await?;
        let token = check_status(response)
            .await?
            .json::<OAuth2Token>()
            .await?;

        Ok(token.stamped())
    }

    async fn social_profile(&self, session: &GarminSession) -> RemoteResult<SocialProfile> {
        let response = self
            .api
            .get(format!(
                "{}/userprofile-service/socialProfile",
                self.endpoints.connectapi
            ))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", session.oauth2.access_token),
            )
            .send()
            .await?;
        Ok(check_status(response).await?.json::<SocialProfile>().await?)
    }
}

#[async_trait]
impl TrackingAuthenticator for GarminClient {
    async fn resume(&self, session: GarminSession) -> RemoteResult<GarminSession> {
        GarminClient::resume(self, session).await
    }

    async fn login(&self, username: &str, password: &str) -> RemoteResult<GarminSession> {
        GarminClient::login(self, username, password).await
    }
}

/// An established Garmin session bound to its client, ready for uploads.
pub struct GarminConnection {
    client: GarminClient,
    session: GarminSession,
}

impl GarminConnection {
    pub fn new(client: GarminClient, session: GarminSession) -> Self {
        Self { client, session }
    }
}

#[async_trait]
impl ActivityUploader for GarminConnection {
    async fn upload_activity(&self, file: &Path) -> RemoteResult<()> {
        self.client.upload_activity(&self.session, file).await
    }
}
