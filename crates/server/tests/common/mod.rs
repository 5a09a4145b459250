//! Shared fixtures for server integration tests.

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use gantry_core::config::AppConfig;
use gantry_server::pow::solve;
use gantry_server::{create_router, AppState};
use gantry_storage::FilesystemBackend;
use gantry_tasks::TaskStore;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

pub struct TestServer {
    pub _temp: tempfile::TempDir,
    pub state: AppState,
    pub router: Router,
}

impl TestServer {
    pub async fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing(temp.path());
        // Keep proof-of-work solvable in debug test builds.
        config.server.pow_difficulty = 16;

        let storage: Arc<dyn gantry_storage::ObjectStore> = Arc::new(
            FilesystemBackend::new(temp.path().join("storage"))
                .await
                .unwrap(),
        );
        let tasks = Arc::new(TaskStore::new(temp.path().join("tasks.db")).await.unwrap());
        let state = AppState::new(config, storage, tasks);
        let router = create_router(state.clone());

        Self {
            _temp: temp,
            state,
            router,
        }
    }

    pub async fn request(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn get_authed(&self, uri: &str, cookie: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        body: serde_json::Value,
        cookie: Option<&str>,
    ) -> Response<Body> {
        self.send_json("POST", uri, body, cookie).await
    }

    pub async fn put_json(
        &self,
        uri: &str,
        body: serde_json::Value,
        cookie: Option<&str>,
    ) -> Response<Body> {
        self.send_json("PUT", uri, body, cookie).await
    }

    async fn send_json(
        &self,
        method: &str,
        uri: &str,
        body: serde_json::Value,
        cookie: Option<&str>,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.request(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Run the challenge→solve→setup flow and return the session cookie.
    pub async fn setup_session(&self, password: &str) -> String {
        let (challenge, nonce) = self.solved_challenge().await;
        let response = self
            .post_json(
                "/api/auth/setup",
                serde_json::json!({
                    "password": password,
                    "challenge": challenge,
                    "nonce": nonce,
                }),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        extract_cookie(&response)
    }

    /// Fetch a challenge and brute-force its nonce.
    pub async fn solved_challenge(&self) -> (String, String) {
        let response = self.get("/api/auth/challenge").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let challenge = body["challenge"].as_str().unwrap().to_string();
        let difficulty = body["difficulty"].as_u64().unwrap() as u32;
        let nonce = solve(&challenge, difficulty);
        (challenge, nonce)
    }
}

pub fn extract_cookie(response: &Response<Body>) -> String {
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("response should set a cookie")
        .to_str()
        .unwrap();
    set_cookie
        .split(';')
        .next()
        .expect("cookie pair present")
        .to_string()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
