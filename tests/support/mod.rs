// Stub of the appointments backend used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use medical_api_client::{AuthenticatedHttpClient, ClientConfig, SessionStore};
use serde_json::{Value, json};

/// One request as the backend saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
}

pub struct BackendState {
    // Access token the protected routes currently accept.
    valid_access: Mutex<String>,
    // Access token handed out by the refresh endpoint.
    issued_access: Mutex<String>,
    accepted_refresh: Mutex<String>,
    rotated_refresh: Mutex<Option<String>>,
    accounts: Mutex<HashMap<String, String>>,
    current_profile: Mutex<Value>,
    refresh_ok: AtomicBool,
    reject_all: AtomicBool,
    refresh_delay_ms: AtomicU64,
    pub login_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub resource_calls: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

impl BackendState {
    fn new() -> Self {
        let mut accounts = HashMap::new();
        accounts.insert("a@b.com".to_owned(), "validpass123".to_owned());
        Self {
            valid_access: Mutex::new("T1".into()),
            issued_access: Mutex::new("T2".into()),
            accepted_refresh: Mutex::new("R1".into()),
            rotated_refresh: Mutex::new(None),
            accounts: Mutex::new(accounts),
            current_profile: Mutex::new(json!({"id": 1, "role": "doctor", "email": "a@b.com"})),
            refresh_ok: AtomicBool::new(true),
            reject_all: AtomicBool::new(false),
            refresh_delay_ms: AtomicU64::new(0),
            login_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            resource_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

pub struct StubBackend {
    pub base_url: String,
    pub state: Arc<BackendState>,
}

impl StubBackend {
    /// Make the protected routes reject the current access token.
    pub fn expire_access(&self) {
        *self.state.valid_access.lock().unwrap() = "expired".into();
    }

    /// Make the protected routes accept `token` only.
    pub fn accept_access(&self, token: &str) {
        *self.state.valid_access.lock().unwrap() = token.to_owned();
    }

    pub fn fail_refresh(&self) {
        self.state.refresh_ok.store(false, Ordering::SeqCst);
    }

    /// Reject every protected request, even with a freshly issued token.
    pub fn reject_all(&self) {
        self.state.reject_all.store(true, Ordering::SeqCst);
    }

    pub fn refresh_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.refresh_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn rotate_refresh(&self, token: &str) {
        *self.state.rotated_refresh.lock().unwrap() = Some(token.to_owned());
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn resource_calls(&self) -> usize {
        self.state.resource_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.state.login_calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().unwrap().clone()
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.base_url.parse().expect("valid base url"))
    }

    pub fn client<S: SessionStore>(&self, store: S) -> AuthenticatedHttpClient<S> {
        self.client_with(self.config(), store)
    }

    pub fn client_with<S: SessionStore>(
        &self,
        config: ClientConfig,
        store: S,
    ) -> AuthenticatedHttpClient<S> {
        AuthenticatedHttpClient::new(config, store).expect("client should build")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Start a fresh backend on an ephemeral port inside the test's runtime.
pub async fn spawn() -> StubBackend {
    init_tracing();

    let state = Arc::new(BackendState::new());
    let app = router(Arc::clone(&state));

    // Bind to an ephemeral port to avoid collisions with local services.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral test port");
    let addr = listener.local_addr().expect("get local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub backend failed");
    });

    StubBackend {
        base_url: format!("http://{addr}/api/"),
        state,
    }
}

type Shared = State<Arc<BackendState>>;

fn router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/api/accounts/auth/login/", post(login))
        .route("/api/accounts/auth/register/", post(register))
        .route("/api/accounts/auth/token/refresh/", post(refresh))
        .route("/api/accounts/me/", get(me))
        .route("/api/doctor/profile/", get(doctor_profile))
        .route("/api/doctor/availability/", post(create_availability))
        .route("/api/doctor/photo/", post(upload_photo))
        .route("/api/doctor/appointments/create/", post(create_appointment))
        .route("/api/doctor/appointments/5/", delete(delete_appointment))
        .route("/api/patients/404/", get(missing_patient))
        .with_state(state)
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "detail": "Given token not valid for any token type",
            "code": "token_not_valid",
        })),
    )
        .into_response()
}

/// Record the request and check its bearer token.
fn authorize(state: &BackendState, path: &str, headers: &HeaderMap) -> Result<(), Response> {
    let authorization = header_value(headers, header::AUTHORIZATION);
    state.resource_calls.fetch_add(1, Ordering::SeqCst);
    state.seen.lock().unwrap().push(SeenRequest {
        path: path.to_owned(),
        authorization: authorization.clone(),
        content_type: header_value(headers, header::CONTENT_TYPE),
    });

    if state.reject_all.load(Ordering::SeqCst) {
        return Err(unauthorized());
    }
    let expected = format!("Bearer {}", state.valid_access.lock().unwrap());
    if authorization.as_deref() == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

async fn login(State(state): Shared, Json(body): Json<Value>) -> Response {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    let email = body["email"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();

    let known = state.accounts.lock().unwrap().get(email).cloned();
    if known.as_deref() != Some(password) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
            .into_response();
    }

    *state.valid_access.lock().unwrap() = "T1".into();
    let role = state.current_profile.lock().unwrap()["role"].clone();
    Json(json!({"access": "T1", "refresh": "R1", "role": role})).into_response()
}

async fn register(State(state): Shared, Json(body): Json<Value>) -> Response {
    state.register_calls.fetch_add(1, Ordering::SeqCst);
    let email = body["email"].as_str().unwrap_or_default().to_owned();
    let password = body["password"].as_str().unwrap_or_default().to_owned();

    let mut accounts = state.accounts.lock().unwrap();
    if accounts.contains_key(&email) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"email": ["custom user with this email already exists."]})),
        )
            .into_response();
    }
    accounts.insert(email.clone(), password);

    let role = body.get("role").cloned().unwrap_or_else(|| json!("patient"));
    let profile = json!({"id": 2, "username": body["username"], "email": email, "role": role});
    *state.current_profile.lock().unwrap() = profile.clone();
    (StatusCode::CREATED, Json(profile)).into_response()
}

async fn refresh(State(state): Shared, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let accepted = state.accepted_refresh.lock().unwrap().clone();
    let accepted_token = body["refresh"].as_str() == Some(accepted.as_str());
    if !state.refresh_ok.load(Ordering::SeqCst) || !accepted_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token is invalid or expired", "code": "token_not_valid"})),
        )
            .into_response();
    }

    let access = state.issued_access.lock().unwrap().clone();
    *state.valid_access.lock().unwrap() = access.clone();
    match state.rotated_refresh.lock().unwrap().clone() {
        Some(rotated) => {
            *state.accepted_refresh.lock().unwrap() = rotated.clone();
            Json(json!({"access": access, "refresh": rotated})).into_response()
        }
        None => Json(json!({"access": access})).into_response(),
    }
}

async fn me(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, "/api/accounts/me/", &headers) {
        return rejection;
    }
    Json(state.current_profile.lock().unwrap().clone()).into_response()
}

async fn doctor_profile(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, "/api/doctor/profile/", &headers) {
        return rejection;
    }
    let token = header_value(&headers, header::AUTHORIZATION);
    Json(json!({"id": 1, "specialization": "Cardiology", "seen_token": token})).into_response()
}

async fn create_availability(State(state): Shared, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = authorize(&state, "/api/doctor/availability/", &headers) {
        return rejection;
    }
    let received: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (StatusCode::CREATED, Json(json!({"received": received}))).into_response()
}

async fn upload_photo(State(state): Shared, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = authorize(&state, "/api/doctor/photo/", &headers) {
        return rejection;
    }
    let content_type = header_value(&headers, header::CONTENT_TYPE);
    Json(json!({"content_type": content_type, "size": body.len()})).into_response()
}

async fn create_appointment(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, "/api/doctor/appointments/create/", &headers) {
        return rejection;
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "date": ["This field is required."],
            "time": ["This field is required."],
        })),
    )
        .into_response()
}

async fn delete_appointment(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, "/api/doctor/appointments/5/", &headers) {
        return rejection;
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn missing_patient(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, "/api/patients/404/", &headers) {
        return rejection;
    }
    (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response()
}
