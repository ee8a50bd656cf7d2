//! Shared test doubles: a scripted generation client and a local fake backend.

#![allow(dead_code)]

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use room_visualizer::config::{ConfigOverrides, WidgetConfig};
use room_visualizer::models::generation::{GeneratedImage, GenerationRequest, GenerationResponse};
use room_visualizer::models::state::AppSnapshot;
use room_visualizer::services::generation::{GenerationClient, GenerationError};
use room_visualizer::services::store::Store;

/// Upper bound for any wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Configuration pointing at `api_endpoint`.
pub fn test_config(api_endpoint: &str) -> WidgetConfig {
    WidgetConfig::new("shop.test")
        .and_then(|config| {
            config.merged(ConfigOverrides {
                api_endpoint: Some(api_endpoint.to_string()),
                ..ConfigOverrides::default()
            })
        })
        .expect("valid test config")
}

/// Wait for `predicate` on the store, failing the test after [`WAIT`].
pub async fn wait_for_state<P>(store: &Store, predicate: P) -> Arc<AppSnapshot>
where
    P: Fn(&AppSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, store.wait_for(predicate))
        .await
        .expect("timed out waiting for store state")
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Scripted outcome of one generation call.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(String),
    Fail { status: u16, message: String },
    Empty,
}

#[derive(Default)]
struct ScriptedInner {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<GenerationRequest>>,
    completed: Mutex<usize>,
    gate: Option<Arc<Semaphore>>,
}

/// In-process [`GenerationClient`]. Outcomes are scripted per product URL
/// and default to success; a gated client holds every call until a permit
/// is released.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    inner: Arc<ScriptedInner>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                gate: Some(Arc::new(Semaphore::new(0))),
                ..ScriptedInner::default()
            }),
        }
    }

    /// Queue outcomes for successive calls about `product_url`.
    pub fn script(&self, product_url: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.inner
            .scripts
            .lock()
            .entry(product_url.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Let `n` held calls answer.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.inner.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Calls that have returned an answer.
    pub fn completed_count(&self) -> usize {
        *self.inner.completed.lock()
    }

    fn next_outcome(&self, product_url: &str) -> Outcome {
        self.inner
            .scripts
            .lock()
            .get_mut(product_url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Outcome::Succeed(format!("{product_url}/generated.png")))
    }
}

impl GenerationClient for ScriptedClient {
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> impl Future<Output = Result<GenerationResponse, GenerationError>> + Send {
        let this = self.clone();
        async move {
            this.inner.calls.lock().push(request.clone());

            if let Some(gate) = this.inner.gate.clone() {
                gate.acquire().await.expect("gate open").forget();
            }

            let outcome = this.next_outcome(&request.product_url);
            *this.inner.completed.lock() += 1;
            match outcome {
                Outcome::Succeed(url) => Ok(GenerationResponse {
                    generated_images: vec![GeneratedImage {
                        url,
                        original_image_url: Some(format!("{}/room.png", request.product_url)),
                    }],
                    ..GenerationResponse::default()
                }),
                Outcome::Fail { status, message } => {
                    Err(GenerationError::Remote { status, message })
                }
                Outcome::Empty => Ok(GenerationResponse::default()),
            }
        }
    }
}

/// A multipart request as the fake backend received it.
#[derive(Debug, Clone, Default)]
pub struct ReceivedForm {
    pub image: Vec<u8>,
    pub image_file_name: Option<String>,
    pub image_content_type: Option<String>,
    pub product_url: Option<String>,
    pub model: Option<String>,
    pub domain: Option<String>,
    pub session_id: Option<String>,
}

/// Running fake backend. `api_endpoint` ends in `/api`, like the real one.
pub struct FakeBackend {
    pub api_endpoint: String,
    pub received: Arc<Mutex<Vec<ReceivedForm>>>,
}

/// Serve `POST /api/generate` on an ephemeral port.
///
/// Product URLs steer the answer: `.../fail` answers 500 `{"error":"boom"}`,
/// `.../garbled` answers 502 with a non-JSON body, `.../empty` answers 200
/// without images, anything else succeeds.
pub async fn spawn_fake_backend() -> FakeBackend {
    let received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/api/generate", post(fake_generate))
        .with_state(Arc::clone(&received));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake backend");
    });

    FakeBackend {
        api_endpoint: format!("http://{addr}/api"),
        received,
    }
}

async fn fake_generate(
    State(received): State<Arc<Mutex<Vec<ReceivedForm>>>>,
    mut multipart: Multipart,
) -> Response {
    let mut form = ReceivedForm::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            form.image_file_name = field.file_name().map(str::to_string);
            form.image_content_type = field.content_type().map(str::to_string);
            form.image = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            continue;
        }
        let value = field.text().await.ok();
        match name.as_str() {
            "productUrl" => form.product_url = value,
            "model" => form.model = value,
            "domain" => form.domain = value,
            "sessionId" => form.session_id = value,
            _ => {}
        }
    }

    let product_url = form.product_url.clone().unwrap_or_default();
    received.lock().push(form);

    if product_url.ends_with("/fail") {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" })))
            .into_response();
    }
    if product_url.ends_with("/garbled") {
        return (StatusCode::BAD_GATEWAY, "upstream exploded").into_response();
    }
    if product_url.ends_with("/empty") {
        return Json(json!({ "generatedImages": [] })).into_response();
    }

    Json(json!({
        "generatedImages": [{
            "url": format!("{product_url}/generated.png"),
            "originalImageUrl": format!("{product_url}/room.png"),
        }],
        "timings": { "total": { "durationSeconds": 1.5 } },
        "productData": { "title": "Test Product" },
    }))
    .into_response()
}
