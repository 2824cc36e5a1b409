//! End-to-end tests for the approval screen.

mod common;

use common::*;
use reqwest::StatusCode;

async fn reach_approval(server: &TestServer, client: &reqwest::Client) -> String {
    let response = client
        .get(server.url("/auth"))
        .query(&[
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid email"),
            ("state", "teststate"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let connector_url = location(&response);

    let response = client.get(&connector_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let approval_url = location(&response);
    assert!(approval_url.starts_with("/approval?"), "got {approval_url}");
    approval_url
}

fn parse_approval_params(approval_url: &str) -> (String, String) {
    let url = url::Url::parse(&format!("http://x{approval_url}")).unwrap();
    let mut req = None;
    let mut hmac = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "req" => req = Some(value.into_owned()),
            "hmac" => hmac = Some(value.into_owned()),
            _ => {}
        }
    }
    (req.unwrap(), hmac.unwrap())
}

#[tokio::test]
async fn approval_screen_gates_code_issuance() {
    let server = TestServer::spawn_with(TestOptions {
        skip_approval: false,
        ..Default::default()
    })
    .await;
    let client = http_client();

    let approval_url = reach_approval(&server, &client).await;
    let (req, hmac) = parse_approval_params(&approval_url);

    // The page renders the grant form.
    let response = client
        .get(server.url(&approval_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    assert!(html.contains("Grant access"));
    assert!(html.contains(MOCK_EMAIL));

    // Approving issues the code.
    let response = client
        .post(server.url("/approval"))
        .form(&[
            ("req", req.as_str()),
            ("hmac", hmac.as_str()),
            ("approval", "approve"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.starts_with(REDIRECT_URI));
    assert!(target.contains("code="));
}

#[tokio::test]
async fn denying_returns_access_denied() {
    let server = TestServer::spawn_with(TestOptions {
        skip_approval: false,
        ..Default::default()
    })
    .await;
    let client = http_client();

    let approval_url = reach_approval(&server, &client).await;
    let (req, hmac) = parse_approval_params(&approval_url);

    let response = client
        .post(server.url("/approval"))
        .form(&[
            ("req", req.as_str()),
            ("hmac", hmac.as_str()),
            ("approval", "reject"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.contains("error=access_denied"));
    assert!(target.contains("state=teststate"));
}

#[tokio::test]
async fn forged_approval_mac_is_rejected() {
    let server = TestServer::spawn_with(TestOptions {
        skip_approval: false,
        ..Default::default()
    })
    .await;
    let client = http_client();

    let approval_url = reach_approval(&server, &client).await;
    let (req, _) = parse_approval_params(&approval_url);

    let response = client
        .post(server.url("/approval"))
        .form(&[
            ("req", req.as_str()),
            ("hmac", "Zm9yZ2VkLW1hYw"),
            ("approval", "approve"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
