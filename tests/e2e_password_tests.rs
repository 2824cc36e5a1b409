//! End-to-end tests for the local password DB: the password grant and the
//! browser login form.

mod common;

use common::*;
use reqwest::StatusCode;

#[tokio::test]
async fn password_grant_with_valid_credentials() {
    let server = TestServer::spawn_full().await;
    let client = http_client();

    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "password"),
            ("username", ADMIN_EMAIL),
            ("password", ADMIN_PASSWORD),
            ("scope", "openid email"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    let claims = decode_jwt_payload(body["id_token"].as_str().unwrap());
    assert_eq!(claims["email"], ADMIN_EMAIL);
    assert_eq!(claims["sub"], "08a8684b-db88-4b73-90a9-3cd1661f5466");
}

#[tokio::test]
async fn password_grant_with_wrong_password() {
    let server = TestServer::spawn_full().await;
    let client = http_client();

    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "password"),
            ("username", ADMIN_EMAIL),
            ("password", "not-the-password"),
            ("scope", "openid"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn password_grant_is_disabled_without_a_connector() {
    // Default spawn has no password_connector configured.
    let server = TestServer::spawn().await;
    let client = http_client();

    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "password"),
            ("username", ADMIN_EMAIL),
            ("password", ADMIN_PASSWORD),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn browser_login_form_round_trip() {
    let server = TestServer::spawn_full().await;
    let client = http_client();

    // Pin the local connector: the password form is rendered.
    let response = client
        .get(server.url("/auth"))
        .query(&[
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid email"),
            ("state", "teststate"),
            ("connector_id", "local"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    let state = extract_form_state(&html);

    // Wrong password re-renders the form.
    let response = client
        .post(server.url("/auth/login"))
        .form(&[
            ("state", state.as_str()),
            ("login", ADMIN_EMAIL),
            ("password", "nope"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("Invalid credentials"));

    // Correct password finishes the flow with a code redirect.
    let response = client
        .post(server.url("/auth/login"))
        .form(&[
            ("state", state.as_str()),
            ("login", ADMIN_EMAIL),
            ("password", ADMIN_PASSWORD),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.starts_with(REDIRECT_URI));
    assert!(target.contains("code="));
    assert!(target.contains("state=teststate"));
}

/// Pulls the hidden MAC-bound state out of the rendered login form.
fn extract_form_state(html: &str) -> String {
    let marker = "name=\"state\" value=\"";
    let start = html.find(marker).expect("form carries the state") + marker.len();
    let end = html[start..].find('"').unwrap() + start;
    html[start..end].to_string()
}
