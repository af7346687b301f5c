use crate::config::HttpSinkConfig;
use crate::error::AppError;
use crate::models::classify_types::LabelResult;
use crate::services::dispatch::Dispatcher;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
const RESERVED_KEYS: [&str; 2] = ["name", "base64"];

/// Document id for an image path; also the document's `base64` field.
/// Uses the URL-safe alphabet so the id is a single path segment.
pub fn document_id(image: &str) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(image.as_bytes())
}

pub fn document_url(base_url: &str, image: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), document_id(image))
}

pub fn basic_authorization(credentials: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes())
    )
}

/// Flat JSON document: `name`, `base64`, then one key per label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelDocument<'a> {
    pub name: String,
    pub base64: String,
    pub scores: Vec<(&'a str, f32)>,
}

impl<'a> LabelDocument<'a> {
    /// Labels that would collide with `name`, `base64` or an earlier label
    /// are left out; the first occurrence wins.
    pub fn from_result(result: &'a LabelResult) -> Self {
        let name = result.image_str();
        let base64 = document_id(&name);
        let mut used: HashSet<&str> = RESERVED_KEYS.iter().copied().collect();
        let mut scores = Vec::with_capacity(result.len());
        for prediction in result.predictions() {
            let key = prediction.class_name.as_str();
            if !used.insert(key) {
                warn!(label = key, path = %name, "label collides with another key, skipped");
                continue;
            }
            scores.push((key, prediction.confidence));
        }
        Self {
            name,
            base64,
            scores,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for LabelDocument<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.scores.len()))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("base64", &self.base64)?;
        for (label, score) in &self.scores {
            map.serialize_entry(label, score)?;
        }
        map.end()
    }
}

/// How a PUT ended, as seen by the completion task.
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub url: String,
    pub status: Option<u16>,
    pub body: String,
}

pub type CompletionHook = Arc<dyn Fn(PutOutcome) + Send + Sync>;

/// PUTs one JSON document per image. Requests run on the dispatcher's own
/// runtime; `dispatch` returns once the request is spawned and `flush`
/// waits for every spawned request to finish.
pub struct HttpDispatcher {
    runtime: tokio::runtime::Runtime,
    in_flight: TaskTracker,
    client: reqwest::Client,
    base_url: String,
    authorization: String,
    on_complete: Option<CompletionHook>,
}

impl HttpDispatcher {
    pub fn new(config: &HttpSinkConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &HttpSinkConfig, client: reqwest::Client) -> Result<Self, AppError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("label-http")
            .enable_all()
            .build()?;
        let base_url = config.base_url();
        info!(url = %base_url, "sending documents over HTTP");
        Ok(Self {
            runtime,
            in_flight: TaskTracker::new(),
            client,
            base_url,
            authorization: basic_authorization(&config.credentials),
            on_complete: None,
        })
    }

    /// Called after each request finishes, in addition to logging.
    pub fn on_complete(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }
}

impl Dispatcher for HttpDispatcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dispatch(&self, result: LabelResult) -> Result<(), AppError> {
        let document = LabelDocument::from_result(&result);
        let body = document.to_json()?;
        let url = document_url(&self.base_url, &document.name);

        let request = self
            .client
            .put(&url)
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body);
        let on_complete = self.on_complete.clone();

        let task = async move {
            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    info!(%url, status, %body, "PUT completed");
                    PutOutcome {
                        url,
                        status: Some(status),
                        body,
                    }
                }
                Err(e) => {
                    warn!(%url, "PUT failed: {}", e);
                    PutOutcome {
                        url,
                        status: None,
                        body: e.to_string(),
                    }
                }
            };
            if let Some(hook) = on_complete {
                hook(outcome);
            }
        };
        self.in_flight.spawn_on(task, self.runtime.handle());
        Ok(())
    }

    fn flush(&self) -> Result<(), AppError> {
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(pending, "waiting for PUTs in flight");
        }
        self.in_flight.close();
        self.runtime.block_on(self.in_flight.wait());
        self.in_flight.reopen();
        Ok(())
    }
}
