//! Token issuance against a mock identity server
//!
//! The OIDC issuer talks to a wiremock server; the credential provider on
//! top of it is checked for the username/password it hands to the broker.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use topic_dispatch::auth::{
    AuthError, CredentialProvider, Credentials, OidcTokenIssuer, OidcTokenIssuerConfig,
    TokenIssuer,
};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/realms/fleet/protocol/openid-connect/token";

fn issuer(server: &MockServer) -> OidcTokenIssuer {
    OidcTokenIssuer::new(OidcTokenIssuerConfig {
        issuer_url: server.uri(),
        realm: "fleet".to_string(),
        client_id: "dispatcher".to_string(),
        client_secret: "s3cret".to_string(),
        timeout: Duration::from_secs(2),
    })
}

#[tokio::test]
async fn test_client_credentials_grant_returns_token() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=dispatcher"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "abc", "expires_in": 300})),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Act
    let token = issuer(&server).issue_token().await.unwrap();

    // Assert
    assert_eq!(token.access_token, "abc");
    let remaining = token.expires_at - Utc::now();
    assert!(remaining > chrono::Duration::seconds(290));
    assert!(remaining <= chrono::Duration::seconds(300));
}

#[tokio::test]
async fn test_rejected_request_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;

    let err = issuer(&server).issue_token().await.unwrap_err();

    match err {
        AuthError::Status { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid_client");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_response_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc"})))
        .mount(&server)
        .await;

    assert!(matches!(
        issuer(&server).issue_token().await,
        Err(AuthError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_provider_presents_client_id_and_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "tok-1", "expires_in": 3600})),
        )
        .mount(&server)
        .await;
    let provider = CredentialProvider::issued(
        Arc::new(issuer(&server)),
        "dispatcher",
        Duration::from_secs(60),
    );

    let credentials = provider.initial_credentials().await;

    assert_eq!(credentials, Some(Credentials::new("dispatcher", "tok-1")));
    assert_eq!(provider.refresh_if_needed().await, None);
}

#[tokio::test]
async fn test_provider_keeps_token_when_refresh_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "first", "expires_in": 30})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let provider = CredentialProvider::issued(
        Arc::new(issuer(&server)),
        "dispatcher",
        Duration::from_secs(60),
    );
    provider.initial_credentials().await;

    // Token expires within the margin, so a refresh is attempted and fails
    let refreshed = provider.refresh_if_needed().await;

    assert_eq!(refreshed, None);
    assert_eq!(
        provider.credentials().await,
        Some(Credentials::new("dispatcher", "first"))
    );
}
