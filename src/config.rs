//! Service configuration.
//!
//! Read from a system-wide JSON file, then a local one whose keys override
//! the system values object by object. Every field has a default, so both
//! files are optional.

use crate::error::AppError;
use crate::services::fs_service::DEFAULT_EXTENSIONS;
use crate::services::pool::{OverflowPolicy, PoolConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/label-client/label-client.json";
pub const LOCAL_CONFIG_PATH: &str = "./label-client.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoveryConfig,
    pub pools: PoolsConfig,
    pub sink: SinkKind,
    pub binary: BinarySinkConfig,
    #[serde(rename = "elastic-search")]
    pub elastic_search: HttpSinkConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub watch: bool,
    pub deduplicate: bool,
    /// Milliseconds a newly created file may go without events before it is
    /// reported even though its writer never closed it.
    pub settle_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            watch: true,
            deduplicate: true,
            settle_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub image_workers: usize,
    pub network_workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            image_workers: pool.workers,
            network_workers: pool.workers,
            queue_capacity: pool.capacity,
            overflow: pool.overflow,
        }
    }
}

impl PoolsConfig {
    pub fn image_pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.image_workers,
            capacity: self.queue_capacity,
            overflow: self.overflow,
        }
    }

    pub fn network_pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.network_workers,
            capacity: self.queue_capacity,
            overflow: self.overflow,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Binary,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarySinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for BinarySinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            connect_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSinkConfig {
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub prefix: String,
    /// `user:password`, sent as HTTP Basic credentials.
    pub credentials: String,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 9200,
            prefix: "/images/_doc".to_string(),
            credentials: "elastic:changeme".to_string(),
        }
    }
}

impl HttpSinkConfig {
    /// `<protocol>://<hostname>:<port><prefix>` without a trailing slash.
    pub fn base_url(&self) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        let prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };
        format!("{}://{}:{}{}", self.protocol, self.hostname, self.port, prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub graph: PathBuf,
    pub labels: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub input_mean: f32,
    pub input_std: f32,
    pub input_layer: Option<String>,
    pub output_layer: Option<String>,
    pub top_k: usize,
    pub apply_softmax: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            graph: PathBuf::from("data/inception_v3.onnx"),
            labels: PathBuf::from("data/imagenet_slim_labels.txt"),
            input_width: 299,
            input_height: 299,
            input_mean: 0.0,
            input_std: 255.0,
            input_layer: None,
            output_layer: None,
            top_k: 5,
            apply_softmax: false,
        }
    }
}

impl AppConfig {
    /// Loads the system file, then `local` over it. Missing files are skipped.
    pub fn load(system: &Path, local: &Path) -> Result<Self, AppError> {
        let mut merged = Value::Object(Default::default());
        for path in [system, local] {
            if let Some(layer) = read_layer(path)? {
                tracing::info!(path = %path.display(), "loaded configuration");
                merge(&mut merged, layer);
            }
        }
        Self::from_value(merged)
    }

    pub fn from_value(value: Value) -> Result<Self, AppError> {
        serde_json::from_value(value).map_err(|e| AppError::Config(e.to_string()))
    }
}

fn read_layer(path: &Path) -> Result<Option<Value>, AppError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_str(&content)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(Some(value))
}

/// Objects merge key by key; any other value in `layer` replaces `base`.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
