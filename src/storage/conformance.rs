//! Shared conformance suite for storage backends.
//!
//! Every backend's test module calls [`run_all`] so the updater contract,
//! error kinds and GC semantics cannot drift between implementations.

use super::*;
use chrono::{Duration, Utc};
use std::collections::HashMap;

pub fn run_all<S: Storage>(s: &S) {
    client_crud(s);
    auth_request_round_trip(s);
    auth_code_round_trip(s);
    refresh_token_crud(s);
    password_normalization(s);
    offline_session_crud(s);
    connector_crud(s);
    device_flow_round_trip(s);
    keys_updater_inserts_initial_row(s);
    garbage_collect_boundary(s);
    concurrent_updaters_converge(s);
}

fn sample_claims() -> Claims {
    Claims {
        user_id: "0-385-28089-0".to_string(),
        username: "Kilgore Trout".to_string(),
        preferred_username: "kilgore".to_string(),
        email: "kilgore@kilgore.trout".to_string(),
        email_verified: true,
        groups: vec!["authors".to_string()],
    }
}

fn client_crud<S: Storage>(s: &S) {
    let client = Client {
        id: "conf-client".to_string(),
        secret: "secret".to_string(),
        redirect_uris: vec!["http://127.0.0.1:5555/callback".to_string()],
        trusted_peers: vec!["peer".to_string()],
        public: false,
        name: "Conformance".to_string(),
        logo_url: String::new(),
    };
    assert!(matches!(
        s.get_client("conf-client"),
        Err(StorageError::NotFound)
    ));
    s.create_client(client.clone()).unwrap();
    assert_eq!(s.get_client("conf-client").unwrap(), client);
    assert!(matches!(
        s.create_client(client.clone()),
        Err(StorageError::AlreadyExists)
    ));
    assert!(s.list_clients().unwrap().iter().any(|c| c.id == client.id));

    s.update_client("conf-client", &mut |mut c| {
        c.name = "Renamed".to_string();
        Ok(c)
    })
    .unwrap();
    assert_eq!(s.get_client("conf-client").unwrap().name, "Renamed");

    s.delete_client("conf-client").unwrap();
    assert!(matches!(
        s.delete_client("conf-client"),
        Err(StorageError::NotFound)
    ));
}

fn sample_auth_request(id: &str) -> AuthRequest {
    AuthRequest {
        id: id.to_string(),
        client_id: "example-app".to_string(),
        response_types: vec!["code".to_string()],
        scopes: vec!["openid".to_string(), "email".to_string()],
        redirect_uri: "http://127.0.0.1:5555/callback".to_string(),
        nonce: "nonce".to_string(),
        state: "state".to_string(),
        force_approval_prompt: false,
        logged_in: false,
        claims: Claims::default(),
        connector_id: "mock".to_string(),
        connector_data: vec![1, 2, 3],
        expiry: Utc::now() + Duration::minutes(30),
        pkce: Pkce {
            code_challenge: "challenge".to_string(),
            code_challenge_method: "S256".to_string(),
        },
        hmac_key: vec![9; 32],
    }
}

fn auth_request_round_trip<S: Storage>(s: &S) {
    let req = sample_auth_request("conf-authreq");
    s.create_auth_request(req.clone()).unwrap();
    assert_eq!(s.get_auth_request("conf-authreq").unwrap(), req);

    s.update_auth_request("conf-authreq", &mut |mut r| {
        r.logged_in = true;
        r.claims = sample_claims();
        Ok(r)
    })
    .unwrap();
    let updated = s.get_auth_request("conf-authreq").unwrap();
    assert!(updated.logged_in);
    assert_eq!(updated.claims, sample_claims());

    s.delete_auth_request("conf-authreq").unwrap();
    assert!(matches!(
        s.get_auth_request("conf-authreq"),
        Err(StorageError::NotFound)
    ));
}

fn auth_code_round_trip<S: Storage>(s: &S) {
    let code = AuthCode {
        id: "conf-code".to_string(),
        client_id: "example-app".to_string(),
        scopes: vec!["openid".to_string()],
        nonce: String::new(),
        redirect_uri: "http://127.0.0.1:5555/callback".to_string(),
        claims: sample_claims(),
        connector_id: "mock".to_string(),
        connector_data: Vec::new(),
        expiry: Utc::now() + Duration::minutes(5),
        pkce: Pkce::default(),
    };
    s.create_auth_code(code.clone()).unwrap();
    assert_eq!(s.get_auth_code("conf-code").unwrap(), code);
    s.delete_auth_code("conf-code").unwrap();
    assert!(matches!(
        s.get_auth_code("conf-code"),
        Err(StorageError::NotFound)
    ));
}

fn refresh_token_crud<S: Storage>(s: &S) {
    let token = RefreshToken {
        id: "conf-refresh".to_string(),
        token: "secret-1".to_string(),
        obsolete_token: String::new(),
        client_id: "example-app".to_string(),
        scopes: vec!["openid".to_string(), "offline_access".to_string()],
        nonce: String::new(),
        claims: sample_claims(),
        connector_id: "mock".to_string(),
        connector_data: Vec::new(),
        created_at: Utc::now(),
        last_used: Utc::now(),
    };
    s.create_refresh_token(token.clone()).unwrap();
    assert_eq!(s.get_refresh_token("conf-refresh").unwrap(), token);

    s.update_refresh_token("conf-refresh", &mut |mut t| {
        t.obsolete_token = t.token.clone();
        t.token = "secret-2".to_string();
        Ok(t)
    })
    .unwrap();
    let rotated = s.get_refresh_token("conf-refresh").unwrap();
    assert_eq!(rotated.token, "secret-2");
    assert_eq!(rotated.obsolete_token, "secret-1");

    assert!(s
        .list_refresh_tokens()
        .unwrap()
        .iter()
        .any(|t| t.id == "conf-refresh"));
    s.delete_refresh_token("conf-refresh").unwrap();
}

fn password_normalization<S: Storage>(s: &S) {
    s.create_password(Password {
        email: "Conf@Example.COM".to_string(),
        hash: b"$2a$10$conformance".to_vec(),
        username: "conf".to_string(),
        user_id: "conf-user".to_string(),
    })
    .unwrap();
    assert_eq!(
        s.get_password("conf@example.com").unwrap().email,
        "conf@example.com"
    );
    assert_eq!(
        s.get_password("CONF@EXAMPLE.COM").unwrap().user_id,
        "conf-user"
    );
    s.update_password("Conf@example.com", &mut |mut p| {
        p.username = "renamed".to_string();
        Ok(p)
    })
    .unwrap();
    assert_eq!(s.get_password("conf@example.com").unwrap().username, "renamed");
    s.delete_password("conf@EXAMPLE.com").unwrap();
    assert!(matches!(
        s.get_password("conf@example.com"),
        Err(StorageError::NotFound)
    ));
}

fn offline_session_crud<S: Storage>(s: &S) {
    let session = OfflineSession {
        user_id: "u1".to_string(),
        conn_id: "mock".to_string(),
        refresh: HashMap::new(),
        connector_data: vec![42],
    };
    s.create_offline_session(session.clone()).unwrap();
    assert!(matches!(
        s.create_offline_session(session.clone()),
        Err(StorageError::AlreadyExists)
    ));
    assert_eq!(s.get_offline_session("u1", "mock").unwrap(), session);

    s.update_offline_session("u1", "mock", &mut |mut sess| {
        sess.refresh.insert(
            "example-app".to_string(),
            RefreshTokenRef {
                id: "r1".to_string(),
                client_id: "example-app".to_string(),
                created_at: Utc::now(),
                last_used: Utc::now(),
            },
        );
        Ok(sess)
    })
    .unwrap();
    assert_eq!(s.get_offline_session("u1", "mock").unwrap().refresh.len(), 1);
    s.delete_offline_session("u1", "mock").unwrap();
    assert!(matches!(
        s.get_offline_session("u1", "mock"),
        Err(StorageError::NotFound)
    ));
}

fn connector_crud<S: Storage>(s: &S) {
    let rec = ConnectorRecord {
        id: "conf-conn".to_string(),
        type_: "mock".to_string(),
        name: "Mock".to_string(),
        resource_version: "1".to_string(),
        config: br#"{"answer":42}"#.to_vec(),
    };
    s.create_connector(rec.clone()).unwrap();
    assert_eq!(s.get_connector("conf-conn").unwrap(), rec);
    s.update_connector("conf-conn", &mut |mut c| {
        c.resource_version = "2".to_string();
        Ok(c)
    })
    .unwrap();
    assert_eq!(
        s.get_connector("conf-conn").unwrap().resource_version,
        "2"
    );
    assert!(s.list_connectors().unwrap().iter().any(|c| c.id == "conf-conn"));
    s.delete_connector("conf-conn").unwrap();
}

fn device_flow_round_trip<S: Storage>(s: &S) {
    let req = DeviceRequest {
        user_code: "ABCD-EFGH".to_string(),
        device_code: "conf-device-code".to_string(),
        client_id: "example-app".to_string(),
        client_secret: String::new(),
        scopes: vec!["openid".to_string()],
        expiry: Utc::now() + Duration::minutes(5),
    };
    s.create_device_request(req.clone()).unwrap();
    assert_eq!(s.get_device_request("ABCD-EFGH").unwrap(), req);

    let token = DeviceToken {
        device_code: "conf-device-code".to_string(),
        status: DEVICE_TOKEN_PENDING.to_string(),
        token: String::new(),
        expiry: Utc::now() + Duration::minutes(5),
        last_request: Utc::now(),
        poll_interval_seconds: 5,
        pkce: Pkce::default(),
    };
    s.create_device_token(token.clone()).unwrap();
    assert_eq!(s.get_device_token("conf-device-code").unwrap(), token);

    s.update_device_token("conf-device-code", &mut |mut t| {
        t.status = DEVICE_TOKEN_COMPLETE.to_string();
        t.token = r#"{"access_token":"x"}"#.to_string();
        Ok(t)
    })
    .unwrap();
    assert_eq!(
        s.get_device_token("conf-device-code").unwrap().status,
        DEVICE_TOKEN_COMPLETE
    );

    s.delete_device_token("conf-device-code").unwrap();
    s.delete_device_request("ABCD-EFGH").unwrap();
}

fn keys_updater_inserts_initial_row<S: Storage>(s: &S) {
    assert!(matches!(s.get_keys(), Err(StorageError::NotFound)));
    let rotation = Utc::now() + Duration::hours(6);
    s.update_keys(&mut |old| {
        assert!(old.is_none());
        Ok(Keys {
            signing_key: Some(SigningKey {
                kid: "kid-1".to_string(),
                private_der: vec![1],
                public_der: vec![2],
            }),
            verification_keys: Vec::new(),
            next_rotation: rotation,
        })
    })
    .unwrap();
    let keys = s.get_keys().unwrap();
    assert_eq!(keys.signing_key.as_ref().unwrap().kid, "kid-1");
    assert_eq!(keys.next_rotation, rotation);

    // Second update sees the stored row.
    s.update_keys(&mut |old| {
        let old = old.expect("keys row must exist");
        assert_eq!(old.signing_key.as_ref().unwrap().kid, "kid-1");
        Ok(old)
    })
    .unwrap();
}

fn garbage_collect_boundary<S: Storage>(s: &S) {
    let now = Utc::now();
    let mut live = sample_auth_request("gc-live");
    live.expiry = now + Duration::minutes(10);
    let mut dead = sample_auth_request("gc-dead");
    dead.expiry = now - Duration::minutes(10);
    s.create_auth_request(live).unwrap();
    s.create_auth_request(dead).unwrap();

    let result = s.garbage_collect(now).unwrap();
    assert_eq!(result.auth_requests, 1);
    assert!(s.get_auth_request("gc-live").is_ok());
    assert!(matches!(
        s.get_auth_request("gc-dead"),
        Err(StorageError::NotFound)
    ));

    // Idempotent.
    let again = s.garbage_collect(now).unwrap();
    assert_eq!(again.auth_requests, 0);
    s.delete_auth_request("gc-live").unwrap();
}

/// N concurrent updaters incrementing a counter must not lose a write.
fn concurrent_updaters_converge<S: Storage>(s: &S) {
    s.create_client(Client {
        id: "counter".to_string(),
        secret: String::new(),
        redirect_uris: Vec::new(),
        trusted_peers: Vec::new(),
        public: true,
        name: "0".to_string(),
        logo_url: String::new(),
    })
    .unwrap();

    const THREADS: usize = 8;
    const INCREMENTS: usize = 10;
    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..INCREMENTS {
                    s.update_client("counter", &mut |mut c| {
                        let n: usize = c.name.parse().unwrap();
                        c.name = (n + 1).to_string();
                        Ok(c)
                    })
                    .unwrap();
                }
            });
        }
    });
    assert_eq!(
        s.get_client("counter").unwrap().name,
        (THREADS * INCREMENTS).to_string()
    );
    s.delete_client("counter").unwrap();
}
