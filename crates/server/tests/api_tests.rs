//! End-to-end API behavior over the router.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{extract_cookie, json_body, TestServer};

fn create_body(account: &str, bundle: &str, version: &str) -> serde_json::Value {
    serde_json::json!({
        "software": {
            "trackId": 1,
            "bundleID": bundle,
            "name": "Example App",
            "version": version,
            "artworkUrl": "https://example.com/icon.png"
        },
        "accountHash": account,
        "downloadURL": "https://iosapps.itunes.apple.com/itunes-assets/example.ipa",
        "sinfs": [{"id": 0, "sinf": "U0lORg=="}]
    })
}

#[tokio::test]
async fn auth_status_reports_setup_progression() {
    let server = TestServer::new().await;

    let body = json_body(server.get("/api/auth/status").await).await;
    assert_eq!(body["required"], true);
    assert_eq!(body["setup"], false);
    assert_eq!(body["authenticated"], false);

    let cookie = server.setup_session("hunter2hunter2").await;

    let body = json_body(
        server
            .get_authed("/api/auth/status", &cookie)
            .await,
    )
    .await;
    assert_eq!(body["setup"], true);
    assert_eq!(body["authenticated"], true);
}

#[tokio::test]
async fn setup_is_idempotent_once() {
    let server = TestServer::new().await;
    server.setup_session("hunter2hunter2").await;

    let (challenge, nonce) = server.solved_challenge().await;
    let response = server
        .post_json(
            "/api/auth/setup",
            serde_json::json!({
                "password": "otherpassword",
                "challenge": challenge,
                "nonce": nonce,
            }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_requires_correct_password() {
    let server = TestServer::new().await;
    server.setup_session("hunter2hunter2").await;

    let (challenge, nonce) = server.solved_challenge().await;
    let response = server
        .post_json(
            "/api/auth/login",
            serde_json::json!({
                "password": "wrong-password",
                "challenge": challenge,
                "nonce": nonce,
            }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (challenge, nonce) = server.solved_challenge().await;
    let response = server
        .post_json(
            "/api/auth/login",
            serde_json::json!({
                "password": "hunter2hunter2",
                "challenge": challenge,
                "nonce": nonce,
            }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(extract_cookie(&response).starts_with("gantry_session="));
}

#[tokio::test]
async fn pow_challenge_is_one_shot() {
    let server = TestServer::new().await;
    server.setup_session("hunter2hunter2").await;

    let (challenge, nonce) = server.solved_challenge().await;
    let login = serde_json::json!({
        "password": "hunter2hunter2",
        "challenge": challenge,
        "nonce": nonce,
    });

    let first = server.post_json("/api/auth/login", login.clone(), None).await;
    assert_eq!(first.status(), StatusCode::OK);

    // Same (challenge, nonce) again within the TTL: rejected.
    let second = server.post_json("/api/auth/login", login, None).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn task_rpcs_require_session() {
    let server = TestServer::new().await;
    server.setup_session("hunter2hunter2").await;

    for uri in [
        "/api/downloads?accountHashes=aaaaaaaa",
        "/api/packages?accountHashes=aaaaaaaa",
        "/api/settings",
    ] {
        let response = server.get(uri).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "uri: {uri}");
    }

    let response = server.get("/api/tunnel").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_download_returns_sanitized_task() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let response = server
        .post_json(
            "/api/downloads",
            create_body("aaaaaaaa", "com.x.y", "1.2"),
            Some(&cookie),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    assert_eq!(body["software"]["bundleID"], "com.x.y");
    assert_eq!(body["accountHash"], "aaaaaaaa");
    assert_eq!(body["hasFile"], false);
    let obj = body.as_object().unwrap();
    assert!(!obj.contains_key("downloadURL"));
    assert!(!obj.contains_key("sinfs"));
    assert!(!obj.contains_key("iTunesMetadata"));
    // Opaque display fields ride through untouched.
    assert_eq!(body["software"]["artworkUrl"], "https://example.com/icon.png");
}

#[tokio::test]
async fn create_download_rejects_bad_inputs() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let mut bad_url = create_body("aaaaaaaa", "com.x.y", "1.2");
    bad_url["downloadURL"] = serde_json::json!("https://evil.com/x.ipa");
    let response = server
        .post_json("/api/downloads", bad_url, Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut bad_hash = create_body("short", "com.x.y", "1.2");
    bad_hash["accountHash"] = serde_json::json!("short");
    let response = server
        .post_json("/api/downloads", bad_hash, Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_task_conflicts() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let first = server
        .post_json(
            "/api/downloads",
            create_body("aaaaaaaa", "com.x.y", "1.2"),
            Some(&cookie),
        )
        .await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = server
        .post_json(
            "/api/downloads",
            create_body("aaaaaaaa", "com.x.y", "1.2"),
            Some(&cookie),
        )
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn tenancy_hides_foreign_tasks() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let created = json_body(
        server
            .post_json(
                "/api/downloads",
                create_body("aaaaaaaa", "com.x.y", "1.2"),
                Some(&cookie),
            )
            .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let owned = server
        .get_authed(
            &format!("/api/downloads/{id}?accountHash=aaaaaaaa"),
            &cookie,
        )
        .await;
    assert_eq!(owned.status(), StatusCode::OK);

    let foreign = server
        .get_authed(
            &format!("/api/downloads/{id}?accountHash=bbbbbbbb"),
            &cookie,
        )
        .await;
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_task_succeeds_and_clears_listing() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let created = json_body(
        server
            .post_json(
                "/api/downloads",
                create_body("aaaaaaaa", "com.x.y", "1.2"),
                Some(&cookie),
            )
            .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let response = server
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/downloads/{id}?accountHash=aaaaaaaa"))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["success"], true);

    let listing = json_body(
        server
            .get_authed("/api/downloads?accountHashes=aaaaaaaa", &cookie)
            .await,
    )
    .await;
    assert_eq!(listing.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn settings_roundtrip_and_totals() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let body = json_body(server.get_authed("/api/settings", &cookie).await).await;
    assert_eq!(body["autoCleanupDays"], 0);
    assert_eq!(body["storage"]["objectCount"], 0);

    let response = server
        .put_json(
            "/api/settings",
            serde_json::json!({"autoCleanupDays": 7, "autoCleanupMaxMB": 512}),
            Some(&cookie),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(server.get_authed("/api/settings", &cookie).await).await;
    assert_eq!(body["autoCleanupDays"], 7);
    assert_eq!(body["autoCleanupMaxMB"], 512);
}

#[tokio::test]
async fn settings_never_echo_request_headers() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let response = server
        .request(
            Request::builder()
                .uri("/api/settings")
                .header(header::COOKIE, &cookie)
                .header("x-injected", "canary-value-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let raw = format!("{:?}", json_body(response).await);
    assert!(!raw.contains("canary-value-123"));
}

#[tokio::test]
async fn packages_lists_only_completed() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let created = json_body(
        server
            .post_json(
                "/api/downloads",
                create_body("aaaaaaaa", "com.x.y", "1.2"),
                Some(&cookie),
            )
            .await,
    )
    .await;
    let id: uuid::Uuid = created["id"].as_str().unwrap().parse().unwrap();

    let body = json_body(
        server
            .get_authed("/api/packages?accountHashes=aaaaaaaa", &cookie)
            .await,
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 0);

    // Complete the task out-of-band with a real blob.
    let key = gantry_core::artifact_key("aaaaaaaa", "com.x.y", id);
    server
        .state
        .storage
        .put(&key, bytes::Bytes::from(vec![9u8; 256]))
        .await
        .unwrap();
    server
        .state
        .tasks
        .mark_completed(id, &key, 256)
        .await
        .unwrap();

    let body = json_body(
        server
            .get_authed("/api/packages?accountHashes=aaaaaaaa", &cookie)
            .await,
    )
    .await;
    let packages = body.as_array().unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0]["hasFile"], true);
    assert_eq!(packages[0]["fileSize"], 256);
}

#[tokio::test]
async fn package_file_streams_attachment() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let created = json_body(
        server
            .post_json(
                "/api/downloads",
                create_body("aaaaaaaa", "com.x.y", "1.2"),
                Some(&cookie),
            )
            .await,
    )
    .await;
    let id: uuid::Uuid = created["id"].as_str().unwrap().parse().unwrap();

    let key = gantry_core::artifact_key("aaaaaaaa", "com.x.y", id);
    server
        .state
        .storage
        .put(&key, bytes::Bytes::from_static(b"ipa-bytes"))
        .await
        .unwrap();
    server.state.tasks.mark_completed(id, &key, 9).await.unwrap();

    let response = server
        .get_authed(
            &format!("/api/packages/{id}/file?accountHash=aaaaaaaa"),
            &cookie,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        disposition,
        "attachment; filename=\"Example App_1.2.ipa\""
    );
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    assert_eq!(bytes.as_ref(), b"ipa-bytes");
}

#[tokio::test]
async fn install_endpoints_are_public_by_uuid() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    let created = json_body(
        server
            .post_json(
                "/api/downloads",
                create_body("aaaaaaaa", "com.x.y", "1.2"),
                Some(&cookie),
            )
            .await,
    )
    .await;
    let id: uuid::Uuid = created["id"].as_str().unwrap().parse().unwrap();

    // Incomplete task: manifest 404s.
    let response = server
        .request(
            Request::builder()
                .uri(format!("/api/install/{id}/manifest.plist"))
                .header(header::HOST, "gantry.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let key = gantry_core::artifact_key("aaaaaaaa", "com.x.y", id);
    server
        .state
        .storage
        .put(&key, bytes::Bytes::from_static(b"ipa"))
        .await
        .unwrap();
    server.state.tasks.mark_completed(id, &key, 3).await.unwrap();

    // No cookie needed once completed.
    let response = server
        .request(
            Request::builder()
                .uri(format!("/api/install/{id}/manifest.plist"))
                .header(header::HOST, "gantry.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let manifest = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let manifest = String::from_utf8(manifest.to_vec()).unwrap();
    assert!(manifest.contains(&format!(
        "https://gantry.example.com/api/install/{id}/payload.ipa"
    )));
    assert!(manifest.contains("<string>com.x.y</string>"));

    let response = server
        .get(&format!("/api/install/{id}/payload.ipa"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cleanup_endpoint_reports_counts() {
    let server = TestServer::new().await;
    let cookie = server.setup_session("hunter2hunter2").await;

    // An orphan blob with no task behind it.
    server
        .state
        .storage
        .put(
            "packages/bbbbbbbb/foo/zzz.ipa",
            bytes::Bytes::from(vec![0u8; 128]),
        )
        .await
        .unwrap();

    let response = server.post_json("/api/cleanup", serde_json::json!({}), Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["orphansDeleted"], 1);
    assert_eq!(body["agedPurged"], 0);
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::new().await;
    let response = server.get("/api/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}
