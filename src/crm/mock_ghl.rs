//! In-process stand-in for GoHighLevel's token, location and contacts
//! endpoints. Bound to `127.0.0.1:0` and served on the test runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde_json::{Value, json};

use super::ghl::GhlClient;
use crate::config::GhlSection;

#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, content_type: &'static str, body: &str) -> Self {
        Self {
            status,
            content_type,
            body: body.to_string(),
        }
    }
}

impl IntoResponse for MockResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

pub struct MockBehavior {
    pub token: MockResponse,
    pub location: MockResponse,
    pub contacts: MockResponse,
    /// Delay before the token endpoint answers.
    pub token_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            token: MockResponse::json(
                200,
                json!({
                    "access_token": "mock-access",
                    "refresh_token": "mock-refresh",
                    "expires_in": 86399,
                    "scope": "contacts.readonly contacts.write",
                    "userType": "Location",
                    "locationId": "loc-1",
                    "companyId": "comp-1"
                }),
            ),
            location: MockResponse::json(
                200,
                json!({"location": {"id": "loc-1", "companyId": "comp-1", "name": "Mock Location"}}),
            ),
            contacts: MockResponse::json(
                200,
                json!({"contacts": [
                    {"id": "gc-1", "firstName": "Grace", "lastName": "Hopper", "email": "grace@example.com", "tags": ["navy"]},
                    {"id": "gc-2", "firstName": "Alan", "phone": "+15550100"}
                ]}),
            ),
            token_delay: Duration::ZERO,
        }
    }
}

/// What the mock saw.
#[derive(Default)]
pub struct MockCalls {
    pub token: AtomicUsize,
    pub location: AtomicUsize,
    pub contacts: AtomicUsize,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub contact_queries: Mutex<Vec<HashMap<String, String>>>,
    pub auth_headers: Mutex<Vec<String>>,
}

struct MockState {
    behavior: MockBehavior,
    calls: Arc<MockCalls>,
}

pub struct MockGhl {
    pub base_url: String,
    pub calls: Arc<MockCalls>,
}

impl MockGhl {
    pub async fn start() -> Self {
        Self::start_with(MockBehavior::default()).await
    }

    pub async fn start_with(behavior: MockBehavior) -> Self {
        let calls = Arc::new(MockCalls::default());
        let state = Arc::new(MockState {
            behavior,
            calls: calls.clone(),
        });
        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/locations/v1/location", get(location))
            .route("/contacts/", get(contacts))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock GHL listener");
        let addr = listener.local_addr().expect("mock GHL local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            base_url: format!("http://{}", addr),
            calls,
        }
    }

    /// Config section pointing every GHL base URL at this mock.
    pub fn ghl_section(&self) -> GhlSection {
        GhlSection {
            client_id: Some("client-id".to_string()),
            client_secret: Some("client-secret".to_string()),
            marketplace_url: self.base_url.clone(),
            services_url: self.base_url.clone(),
            ..GhlSection::default()
        }
    }

    pub fn client(&self) -> GhlClient {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("build test HTTP client");
        GhlClient::with_http(&self.ghl_section(), http)
    }

    pub fn token_calls(&self) -> usize {
        self.calls.token.load(Ordering::SeqCst)
    }
}

fn record_auth(calls: &MockCalls, headers: &HeaderMap) {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        calls.auth_headers.lock().unwrap().push(auth.to_string());
    }
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> MockResponse {
    state.calls.token.fetch_add(1, Ordering::SeqCst);
    state.calls.token_forms.lock().unwrap().push(form);
    if !state.behavior.token_delay.is_zero() {
        tokio::time::sleep(state.behavior.token_delay).await;
    }
    state.behavior.token.clone()
}

async fn location(State(state): State<Arc<MockState>>, headers: HeaderMap) -> MockResponse {
    state.calls.location.fetch_add(1, Ordering::SeqCst);
    record_auth(&state.calls, &headers);
    state.behavior.location.clone()
}

async fn contacts(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> MockResponse {
    state.calls.contacts.fetch_add(1, Ordering::SeqCst);
    record_auth(&state.calls, &headers);
    state.calls.contact_queries.lock().unwrap().push(query);
    state.behavior.contacts.clone()
}
