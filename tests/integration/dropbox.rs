use dropbox_garmin_sync::common::dropbox_client::{DropboxClient, DropboxEndpoints, DropboxOAuth};
use dropbox_garmin_sync::common::ports::FileStorage;
use dropbox_garmin_sync::common::types::{EntryKind, RemoteError, TokenSet};
use dropbox_garmin_sync::dropbox_session::OAuthCodeExchange;
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn valid_tokens() -> TokenSet {
    TokenSet {
        access_token: "live-token".into(),
        refresh_token: "refresh-token".into(),
        expires_at: 4_000_000_000,
    }
}

async fn setup() -> (MockServer, DropboxClient) {
    let server = MockServer::start().await;
    let client = DropboxClient::with_endpoints(
        "app-key",
        "app-secret",
        valid_tokens(),
        DropboxEndpoints::single(&server.uri()),
    );
    (server, client)
}

fn not_found_body() -> serde_json::Value {
    json!({
        "error_summary": "path/not_found/..",
        "error": { ".tag": "path", "path": { ".tag": "not_found" } }
    })
}

#[tokio::test]
async fn test_list_folder_follows_cursor() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .and(header("Authorization", "Bearer live-token"))
        .and(body_json(json!({ "path": "/Apps/TrainerDay" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {
                    ".tag": "file",
                    "name": "Ride1.fit",
                    "path_lower": "/apps/trainerday/ride1.fit",
                    "path_display": "/Apps/TrainerDay/Ride1.fit",
                    "id": "id:1",
                    "size": 2048
                },
                {
                    ".tag": "folder",
                    "name": "Processed",
                    "path_lower": "/apps/trainerday/processed",
                    "path_display": "/Apps/TrainerDay/Processed",
                    "id": "id:2"
                }
            ],
            "cursor": "cursor-1",
            "has_more": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/continue"))
        .and(body_json(json!({ "cursor": "cursor-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {
                    ".tag": "file",
                    "name": "ride2.fit",
                    "path_lower": "/apps/trainerday/ride2.fit",
                    "id": "id:3"
                }
            ],
            "cursor": "cursor-2",
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let entries = client.list_folder("/Apps/TrainerDay").await.unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].path, "/apps/trainerday/ride1.fit");
    assert_eq!(entries[0].name, "Ride1.fit");
    assert_eq!(entries[1].kind, EntryKind::Folder);
    assert_eq!(entries[2].name, "ride2.fit");
    assert_eq!(entries.iter().filter(|e| e.is_file()).count(), 2);
}

#[tokio::test]
async fn test_list_folder_missing_folder_is_not_found() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(409).set_body_json(not_found_body()))
        .mount(&server)
        .await;

    let err = client.list_folder("/Apps/Missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_download_returns_content() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .and(header("Dropbox-API-Arg", r#"{"path":"/apps/trainerday/ride1.fit"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b".FIT payload".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let data = client.download("/apps/trainerday/ride1.fit").await.unwrap();
    assert_eq!(data, b".FIT payload");
}

#[tokio::test]
async fn test_get_metadata_not_found_is_classified() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/get_metadata"))
        .respond_with(ResponseTemplate::new(409).set_body_json(not_found_body()))
        .mount(&server)
        .await;

    let err = client
        .get_metadata("/Apps/TrainerDay/Processed")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(summary) if summary.starts_with("path/not_found")));
}

#[tokio::test]
async fn test_get_metadata_returns_folder() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/get_metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            ".tag": "folder",
            "name": "Processed",
            "path_lower": "/apps/trainerday/processed",
            "id": "id:2"
        })))
        .mount(&server)
        .await;

    let entry = client.get_metadata("/Apps/TrainerDay/Processed").await.unwrap();
    assert_eq!(entry.kind, EntryKind::Folder);
}

#[tokio::test]
async fn test_create_existing_folder_is_conflict() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/create_folder_v2"))
        .and(body_json(json!({ "path": "/Apps/TrainerDay/Processed", "autorename": false })))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/conflict/folder/..",
            "error": { ".tag": "path", "path": { ".tag": "conflict", "conflict": { ".tag": "folder" } } }
        })))
        .mount(&server)
        .await;

    let err = client
        .create_folder("/Apps/TrainerDay/Processed")
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_move_sends_both_paths() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .and(body_json(json!({
            "from_path": "/apps/trainerday/ride3.fit",
            "to_path": "/Apps/TrainerDay/Processed/ride3.fit",
            "autorename": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { ".tag": "file", "name": "ride3.fit" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    client
        .move_file("/apps/trainerday/ride3.fit", "/Apps/TrainerDay/Processed/ride3.fit")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_with_revoked_token_is_auth_error() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error_summary": "invalid_access_token/..",
            "error": { ".tag": "invalid_access_token" }
        })))
        .mount(&server)
        .await;

    let err = client.delete_file("/apps/trainerday/ride1.fit").await.unwrap_err();
    assert!(matches!(err, RemoteError::Auth(_)));
}

#[tokio::test]
async fn test_expired_access_token_is_refreshed_before_call() {
    let server = MockServer::start().await;
    let client = DropboxClient::with_endpoints(
        "app-key",
        "app-secret",
        TokenSet {
            access_token: "stale-token".into(),
            refresh_token: "refresh-token".into(),
            expires_at: 0,
        },
        DropboxEndpoints::single(&server.uri()),
    );

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "token_type": "bearer",
            "expires_in": 14400
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .and(header("Authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "metadata": {} })))
        .expect(2)
        .mount(&server)
        .await;

    client.delete_file("/apps/trainerday/a.fit").await.unwrap();
    client.delete_file("/apps/trainerday/b.fit").await.unwrap();

    let tokens = client.tokens().await;
    assert_eq!(tokens.access_token, "fresh-token");
    assert_eq!(tokens.refresh_token, "refresh-token");
}

#[tokio::test]
async fn test_authorization_code_exchange() {
    let server = MockServer::start().await;
    let oauth = DropboxOAuth::with_endpoints(
        "app-key",
        "app-secret",
        DropboxEndpoints::single(&server.uri()),
    );

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=pasted-code"))
        .and(body_string_contains("client_id=app-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "sl.new",
            "token_type": "bearer",
            "expires_in": 14400,
            "refresh_token": "long-lived",
            "scope": "files.content.read files.content.write",
            "uid": "12345",
            "account_id": "dbid:abc"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = oauth.exchange_code("pasted-code").await.unwrap();
    assert_eq!(tokens.access_token, "sl.new");
    assert_eq!(tokens.refresh_token, "long-lived");
    assert!(!tokens.expires_within(60));
    assert!(oauth.authorize_url().starts_with(&format!("{}/oauth2/authorize?", server.uri())));
}

#[tokio::test]
async fn test_rejected_authorization_code_is_auth_error() {
    let server = MockServer::start().await;
    let oauth = DropboxOAuth::with_endpoints(
        "app-key",
        "app-secret",
        DropboxEndpoints::single(&server.uri()),
    );

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "code doesn't exist or has expired"
        })))
        .mount(&server)
        .await;

    let err = oauth.exchange_code("stale-code").await.unwrap_err();
    assert!(matches!(err, RemoteError::Auth(_)));
}

#[tokio::test]
async fn test_failed_writes_are_sent_once() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/create_folder_v2"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .move_file("/apps/trainerday/ride3.fit", "/Apps/TrainerDay/Processed/ride3.fit")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Transient(_)));

    let err = client.delete_file("/apps/trainerday/ride3.fit").await.unwrap_err();
    assert!(matches!(err, RemoteError::Transient(_)));

    let err = client
        .create_folder("/Apps/TrainerDay/Processed")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Transient(_)));

    server.verify().await;
}

#[tokio::test]
async fn test_listing_is_retried_after_server_error() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [],
            "cursor": "cursor-1",
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let entries = client.list_folder("/Apps/TrainerDay").await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_malformed_success_body_is_not_transient() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/2/files/get_metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client
        .get_metadata("/Apps/TrainerDay/Processed")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Other(msg) if msg.starts_with("Invalid response")));
}
