use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use server_api::ApiContext;
use shared::domain::{Profile, ProfileRole};
use storage::Storage;
use tower::ServiceExt;

use crate::{app_state::AppState, auth::TokenKeys, routes::build_router};

pub(crate) struct TestServer {
    pub state: Arc<AppState>,
    pub admin: Profile,
    pub alice: Profile,
    pub bob: Profile,
}

impl TestServer {
    pub async fn new() -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let admin = storage
            .create_profile("admin@example.com", "Admin", ProfileRole::Admin)
            .await
            .expect("admin");
        let alice = storage
            .create_profile("alice@example.com", "Alice", ProfileRole::Subcontractor)
            .await
            .expect("alice");
        let bob = storage
            .create_profile("bob@example.com", "Bob", ProfileRole::Subcontractor)
            .await
            .expect("bob");
        let state = Arc::new(AppState::new(
            ApiContext::new(storage),
            TokenKeys::new("test-secret", 3600),
        ));
        Self {
            state,
            admin,
            alice,
            bob,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn token(&self, profile: &Profile) -> String {
        self.state.tokens.issue(profile).expect("token").0
    }

    pub async fn spawn(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");

        let response = self.router().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }
}
