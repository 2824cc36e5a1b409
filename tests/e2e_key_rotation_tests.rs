//! End-to-end tests for signing-key rotation against the live endpoints.

mod common;

use chrono::{Duration, Utc};
use common::*;
use reqwest::StatusCode;

async fn obtain_access_token(server: &TestServer, client: &reqwest::Client) -> String {
    let code = run_code_flow(server, client, CLIENT_ID, "openid email", &[]).await;
    let body: serde_json::Value = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn tokens_survive_a_rotation_until_the_old_key_expires() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let access_token = obtain_access_token(&server, &client).await;

    // Force one rotation (signing period is 6h, jump past it).
    let signer = server.signer.clone();
    tokio::task::spawn_blocking(move || signer.rotate(Utc::now() + Duration::hours(7)))
        .await
        .unwrap()
        .unwrap();

    // The demoted key is still in the JWKS...
    let jwks: serde_json::Value = client
        .get(server.url("/keys"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 2);

    // ...so the pre-rotation token still works at /userinfo.
    let response = client
        .get(server.url("/userinfo"))
        .bearer_auth(&access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // After the ID-token validity window (24h) passes, the next rotation
    // prunes the demoted key and old tokens stop verifying.
    let signer = server.signer.clone();
    tokio::task::spawn_blocking(move || signer.rotate(Utc::now() + Duration::hours(40)))
        .await
        .unwrap()
        .unwrap();

    let response = client
        .get(server.url("/userinfo"))
        .bearer_auth(&access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
