//! End-to-end tests for discovery, JWKS and the authorization-code flow.

mod common;

use base64::Engine;
use common::*;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

#[tokio::test]
async fn discovery_document_advertises_endpoints() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let doc: serde_json::Value = client
        .get(server.url("/.well-known/openid-configuration"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(doc["issuer"], server.base_url);
    assert_eq!(doc["authorization_endpoint"], server.url("/auth"));
    assert_eq!(doc["token_endpoint"], server.url("/token"));
    assert_eq!(doc["jwks_uri"], server.url("/keys"));
    assert_eq!(doc["subject_types_supported"][0], "public");
    assert_eq!(doc["id_token_signing_alg_values_supported"][0], "RS256");
    let methods: Vec<&str> = doc["code_challenge_methods_supported"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(methods, vec!["plain", "S256"]);
}

#[tokio::test]
async fn jwks_serves_rsa_signing_keys() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let jwks: serde_json::Value = client
        .get(server.url("/keys"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["use"], "sig");
    assert_eq!(keys[0]["alg"], "RS256");
    assert!(!keys[0]["kid"].as_str().unwrap().is_empty());
    assert!(!keys[0]["n"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn code_flow_issues_verifiable_tokens() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let code = run_code_flow(&server, &client, CLIENT_ID, "openid email", &[]).await;

    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();

    let id_token = body["id_token"].as_str().unwrap();
    let access_token = body["access_token"].as_str().unwrap();
    assert_eq!(body["token_type"], "bearer");

    let claims = decode_jwt_payload(id_token);
    assert_eq!(claims["iss"], server.base_url);
    assert_eq!(claims["sub"], MOCK_USER_ID);
    assert_eq!(claims["aud"], CLIENT_ID);
    assert_eq!(claims["email"], MOCK_EMAIL);
    assert_eq!(claims["nonce"], "a-nonce");

    // at_hash binds the access token.
    let digest = Sha256::digest(access_token.as_bytes());
    let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..16]);
    assert_eq!(claims["at_hash"], expected);

    // The signature verifies against the served JWKS.
    let jwks: serde_json::Value = client
        .get(server.url("/keys"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let header: serde_json::Value = {
        let segment = id_token.split('.').next().unwrap();
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(segment)
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    };
    let jwk = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .find(|k| k["kid"] == header["kid"])
        .expect("id_token kid is in the JWKS");
    let decoding_key = jsonwebtoken::DecodingKey::from_rsa_components(
        jwk["n"].as_str().unwrap(),
        jwk["e"].as_str().unwrap(),
    )
    .unwrap();
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&[CLIENT_ID]);
    jsonwebtoken::decode::<serde_json::Value>(id_token, &decoding_key, &validation)
        .expect("id_token signature verifies against /keys");
}

#[tokio::test]
async fn userinfo_returns_identity_claims() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let code = run_code_flow(&server, &client, CLIENT_ID, "openid email profile", &[]).await;
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

    let response = client
        .get(server.url("/userinfo"))
        .bearer_auth(body["access_token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info: serde_json::Value = response.json().await.unwrap();
    assert_eq!(info["sub"], MOCK_USER_ID);
    assert_eq!(info["email"], MOCK_EMAIL);
    assert_eq!(info["name"], "Kilgore Trout");
    // Token-delivery claims are stripped.
    assert!(info.get("aud").is_none());
    assert!(info.get("nonce").is_none());
}

#[tokio::test]
async fn userinfo_rejects_garbage_tokens() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let response = client
        .get(server.url("/userinfo"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client.get(server.url("/userinfo")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn redirect_uri_match_is_byte_exact() {
    let server = TestServer::spawn().await;
    let client = http_client();

    // Trailing slash only: must be rejected, and must NOT redirect.
    let response = client
        .get(server.url("/auth"))
        .query(&[
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", "http://127.0.0.1:5555/callback/"),
            ("scope", "openid"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auth_codes_are_single_use() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let code = run_code_flow(&server, &client, CLIENT_ID, "openid", &[]).await;
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", REDIRECT_URI),
    ];

    let first = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&form)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&form)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_client_secret_is_rejected() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let code = run_code_flow(&server, &client, CLIENT_ID, "openid", &[]).await;
    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some("wrong-secret"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn pkce_s256_binds_the_code() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let verifier = "a-code-verifier-for-the-cli";
    let challenge = {
        let digest = Sha256::digest(verifier.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
    };

    // Public client: no secret, PKCE mandatory.
    let code = run_code_flow(
        &server,
        &client,
        PUBLIC_CLIENT_ID,
        "openid",
        &[
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ],
    )
    .await;

    // Wrong verifier fails with invalid_grant...
    let response = client
        .post(server.url("/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", PUBLIC_CLIENT_ID),
            ("code_verifier", "wrong-verifier"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");

    // ...and the code burned with it; even the right verifier is now late.
    let response = client
        .post(server.url("/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", PUBLIC_CLIENT_ID),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn pkce_happy_path_for_public_clients() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let verifier = "another-code-verifier";
    let challenge = {
        let digest = Sha256::digest(verifier.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
    };
    let code = run_code_flow(
        &server,
        &client,
        PUBLIC_CLIENT_ID,
        "openid",
        &[
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ],
    )
    .await;

    let response = client
        .post(server.url("/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", PUBLIC_CLIENT_ID),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_clients_without_pkce_are_turned_away() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let response = client
        .get(server.url("/auth"))
        .query(&[
            ("response_type", "code"),
            ("client_id", PUBLIC_CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid"),
            ("state", "s"),
        ])
        .send()
        .await
        .unwrap();
    // Validated client + URI: the failure redirects back with an error.
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.contains("error=invalid_request"));
}

#[tokio::test]
async fn token_exchange_respects_trusted_peers() {
    let server = TestServer::spawn().await;
    let client = http_client();

    let code = run_code_flow(&server, &client, CLIENT_ID, "openid email", &[]).await;
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
    let id_token = body["id_token"].as_str().unwrap();

    // "backend" is a trusted peer of "example-app": exchange succeeds.
    let response = client
        .post(server.url("/token"))
        .basic_auth(PEER_CLIENT_ID, Some(PEER_CLIENT_SECRET))
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
            ("subject_token", id_token),
            (
                "subject_token_type",
                "urn:ietf:params:oauth:token-type:id_token",
            ),
            ("audience", CLIENT_ID),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let exchanged: serde_json::Value = response.json().await.unwrap();
    let claims = decode_jwt_payload(exchanged["access_token"].as_str().unwrap());
    assert_eq!(claims["aud"], CLIENT_ID);
    assert_eq!(claims["azp"], PEER_CLIENT_ID);
    assert_eq!(claims["sub"], MOCK_USER_ID);

    // The reverse direction is not trusted.
    let response = client
        .post(server.url("/token"))
        .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
            ("subject_token", id_token),
            (
                "subject_token_type",
                "urn:ietf:params:oauth:token-type:id_token",
            ),
            ("audience", PEER_CLIENT_ID),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized_client");
}

#[tokio::test]
async fn connector_selection_page_lists_all_connectors() {
    let server = TestServer::spawn_full().await;
    let client = http_client();

    // Two connectors, none pinned: the picker is served.
    let response = client
        .get(server.url("/auth"))
        .query(&[
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    assert!(html.contains("connector_id=mock"));
    assert!(html.contains("connector_id=local"));
}
